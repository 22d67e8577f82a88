use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TokenGrant;
use crate::config::SlackConfig;

/// Slack Web API client. Tokens are per-workspace and passed per call.
pub struct SlackClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlackChannel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub num_members: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OutgoingMessage {
    pub channel: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PostedMessage {
    pub channel: String,
    pub ts: String,
}

#[derive(Deserialize)]
struct ChannelList {
    #[serde(default)]
    channels: Vec<SlackChannel>,
}

impl SlackClient {
    pub fn new(config: &SlackConfig) -> Self {
        Self::with_base_url(config, "https://slack.com/api")
    }

    pub fn with_base_url(config: &SlackConfig, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    /// Slack answers 200 with `ok: false` for most failures; the `error`
    /// code comes back as [`SlackError::Slack`].
    async fn read(resp: reqwest::Response) -> Result<Value, SlackError> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SlackError::Api(format!("{status}: {body}")));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| SlackError::Request(e.to_string()))?;
        if body["ok"].as_bool() != Some(true) {
            let code = body["error"].as_str().unwrap_or("unknown_error");
            return Err(SlackError::Slack(code.to_string()));
        }
        Ok(body)
    }

    /// Non-archived channels of the given `types` (e.g.
    /// `public_channel,private_channel`).
    pub async fn list_channels(
        &self,
        token: &str,
        types: &str,
        limit: u32,
    ) -> Result<Vec<SlackChannel>, SlackError> {
        let limit = limit.to_string();
        let resp = self
            .client
            .get(format!("{}/conversations.list", self.base_url))
            .bearer_auth(token)
            .query(&[
                ("types", types),
                ("exclude_archived", "true"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SlackError::Request(e.to_string()))?;

        let body = Self::read(resp).await?;
        let list: ChannelList =
            serde_json::from_value(body).map_err(|e| SlackError::Request(e.to_string()))?;
        Ok(list.channels)
    }

    /// Joins a public channel. Already being a member is not an error.
    pub async fn join_channel(&self, token: &str, channel: &str) -> Result<(), SlackError> {
        let resp = self
            .client
            .post(format!("{}/conversations.join", self.base_url))
            .bearer_auth(token)
            .form(&[("channel", channel)])
            .send()
            .await
            .map_err(|e| SlackError::Request(e.to_string()))?;

        match Self::read(resp).await {
            Ok(_) => Ok(()),
            Err(SlackError::Slack(code)) if code == "already_in_channel" => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn post_message(
        &self,
        token: &str,
        message: &OutgoingMessage,
    ) -> Result<PostedMessage, SlackError> {
        let resp = self
            .client
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(token)
            .json(message)
            .send()
            .await
            .map_err(|e| SlackError::Request(e.to_string()))?;

        let body = Self::read(resp).await?;
        let posted: PostedMessage =
            serde_json::from_value(body).map_err(|e| SlackError::Request(e.to_string()))?;
        tracing::debug!(channel = %posted.channel, ts = %posted.ts, "Slack message posted");
        Ok(posted)
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, SlackError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(SlackError::NotConfigured);
        }

        let resp = self
            .client
            .post(format!("{}/oauth.v2.access", self.base_url))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| SlackError::Request(e.to_string()))?;

        let body = Self::read(resp).await?;
        serde_json::from_value(body).map_err(|e| SlackError::Request(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SlackError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Slack API error: {0}")]
    Api(String),
    #[error("Slack error: {0}")]
    Slack(String),
    #[error("Slack OAuth client is not configured")]
    NotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(url: &str) -> SlackClient {
        let config = SlackConfig {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
        };
        SlackClient::with_base_url(&config, url)
    }

    #[tokio::test]
    async fn post_message_returns_thread_reference() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat.postMessage")
            .match_header("authorization", "Bearer xoxb-1")
            .match_body(Matcher::PartialJson(json!({
                "channel": "C1",
                "text": "hello",
                "thread_ts": "171.1"
            })))
            .with_body(r#"{"ok":true,"channel":"C1","ts":"171.2"}"#)
            .create_async()
            .await;

        let msg = OutgoingMessage {
            channel: "C1".into(),
            text: "hello".into(),
            thread_ts: Some("171.1".into()),
            ..Default::default()
        };
        let posted = client(&server.url()).post_message("xoxb-1", &msg).await.unwrap();
        assert_eq!(posted.ts, "171.2");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn ok_false_surfaces_error_code() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat.postMessage")
            .with_body(r#"{"ok":false,"error":"channel_not_found"}"#)
            .create_async()
            .await;

        let msg = OutgoingMessage {
            channel: "C404".into(),
            text: "hi".into(),
            ..Default::default()
        };
        let err = client(&server.url()).post_message("t", &msg).await.unwrap_err();
        assert!(matches!(err, SlackError::Slack(ref c) if c == "channel_not_found"));
    }

    #[tokio::test]
    async fn list_channels_sends_filters() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/conversations.list")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("types".into(), "public_channel".into()),
                Matcher::UrlEncoded("exclude_archived".into(), "true".into()),
                Matcher::UrlEncoded("limit".into(), "10".into()),
            ]))
            .with_body(
                r#"{"ok":true,"channels":[{"id":"C1","name":"general","num_members":4},
                    {"id":"C2","name":"ops","is_private":true}]}"#,
            )
            .create_async()
            .await;

        let channels = client(&server.url())
            .list_channels("t", "public_channel", 10)
            .await
            .unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].num_members, Some(4));
        assert!(channels[1].is_private);
    }

    #[tokio::test]
    async fn join_tolerates_already_in_channel() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/conversations.join")
            .match_body(Matcher::UrlEncoded("channel".into(), "C1".into()))
            .with_body(r#"{"ok":false,"error":"already_in_channel"}"#)
            .create_async()
            .await;

        client(&server.url()).join_channel("t", "C1").await.unwrap();
    }

    #[tokio::test]
    async fn refresh_requires_client_credentials() {
        let slack = SlackClient::with_base_url(&SlackConfig::default(), "http://unused");
        assert!(matches!(
            slack.refresh_token("r").await,
            Err(SlackError::NotConfigured)
        ));
    }
}
