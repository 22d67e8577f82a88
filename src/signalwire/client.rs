use async_trait::async_trait;

use crate::config::SignalWireConfig;

/// Anything that can deliver a text message.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Sends `body` and returns the vendor message sid.
    async fn send_message(&self, from: &str, to: &str, body: &str) -> Result<String, SmsError>;
}

/// SignalWire LaML REST client (Twilio-compatible Messages API).
pub struct SignalWireClient {
    client: reqwest::Client,
    project_id: String,
    api_token: String,
    base_url: String,
}

impl SignalWireClient {
    pub fn new(config: &SignalWireConfig) -> Self {
        Self::with_base_url(config, &format!("https://{}", config.space_url))
    }

    pub fn with_base_url(config: &SignalWireConfig, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            project_id: config.project_id.clone(),
            api_token: config.api_token.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SmsGateway for SignalWireClient {
    async fn send_message(&self, from: &str, to: &str, body: &str) -> Result<String, SmsError> {
        let url = format!(
            "{}/api/laml/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.project_id
        );

        let params = [("From", from), ("To", to), ("Body", body)];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.project_id, Some(&self.api_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| SmsError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SmsError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SmsError::Request(e.to_string()))?;

        let sid = body["sid"].as_str().unwrap_or("unknown").to_string();

        tracing::info!(to, sid = %sid, "SMS sent");
        Ok(sid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("SignalWire API error: {0}")]
    Api(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config() -> SignalWireConfig {
        SignalWireConfig {
            project_id: "proj".into(),
            api_token: "secret".into(),
            space_url: "demo.signalwire.com".into(),
        }
    }

    #[tokio::test]
    async fn send_posts_form_with_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/laml/2010-04-01/Accounts/proj/Messages.json")
            // base64("proj:secret")
            .match_header("authorization", "Basic cHJvajpzZWNyZXQ=")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("From".into(), "+15550001111".into()),
                Matcher::UrlEncoded("To".into(), "+15552223333".into()),
                Matcher::UrlEncoded("Body".into(), "See you at 5".into()),
            ]))
            .with_status(201)
            .with_body(r#"{"sid":"SM123"}"#)
            .create_async()
            .await;

        let client = SignalWireClient::with_base_url(&config(), &server.url());
        let sid = client
            .send_message("+15550001111", "+15552223333", "See you at 5")
            .await
            .unwrap();
        assert_eq!(sid, "SM123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn vendor_rejection_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", Matcher::Any)
            .with_status(400)
            .with_body(r#"{"message":"invalid To"}"#)
            .create_async()
            .await;

        let client = SignalWireClient::with_base_url(&config(), &server.url());
        let err = client.send_message("+1", "bad", "x").await.unwrap_err();
        assert!(matches!(err, SmsError::Api(ref m) if m.contains("invalid To")), "{err}");
    }
}
