//! Optional internal endpoints: the new-message notification relay (email,
//! SMS and push fan-out) and the phone-number contact lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::NotificationsConfig;

pub struct RelayClient {
    client: reqwest::Client,
    relay_url: Option<String>,
    lookup_url: Option<String>,
    token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: NewMessageData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageData {
    pub sender_number: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

impl NewMessageEvent {
    pub fn sms(user_id: &str, sender: &str, content: &str, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind: "new_message",
            data: NewMessageData {
                sender_number: sender.to_string(),
                timestamp: at,
                content: content.to_string(),
            },
        }
    }
}

/// What to look a contact up by.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupKey<'a> {
    Phone(&'a str),
    Email(&'a str),
}

/// Public profile data for a phone number or email address.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct LookupContact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub twitter_url: Option<String>,
    #[serde(default)]
    pub facebook_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    not_found: bool,
    #[serde(default)]
    contact: Option<LookupContact>,
}

impl RelayClient {
    pub fn new(config: &NotificationsConfig, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            relay_url: config.relay_url.clone(),
            lookup_url: config.contact_lookup_url.clone(),
            token: token.to_string(),
        }
    }

    /// Posts the event to the relay. A missing relay URL is a no-op.
    pub async fn notify(&self, event: &NewMessageEvent) -> Result<(), RelayError> {
        let Some(url) = &self.relay_url else {
            return Ok(());
        };
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(event)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Api(format!("{status}: {body}")));
        }
        Ok(())
    }

    /// `None` when no lookup endpoint is configured or the endpoint has
    /// nothing for the key.
    pub async fn lookup_contact(&self, key: LookupKey<'_>) -> Result<Option<LookupContact>, RelayError> {
        let Some(url) = &self.lookup_url else {
            return Ok(None);
        };
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&key)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            tracing::debug!(?key, status = %resp.status(), "Contact lookup found nothing");
            return Ok(None);
        }
        let body: LookupResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;
        if body.not_found || !body.success {
            return Ok(None);
        }
        Ok(body.contact)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Relay error: {0}")]
    Api(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;
    use serde_json::json;

    fn relay(url: &str) -> RelayClient {
        let config = NotificationsConfig {
            relay_url: Some(format!("{url}/notify")),
            contact_lookup_url: Some(format!("{url}/lookup")),
        };
        RelayClient::new(&config, "svc")
    }

    #[tokio::test]
    async fn event_uses_camel_case_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/notify")
            .match_header("authorization", "Bearer svc")
            .match_body(Matcher::Json(json!({
                "userId": "u1",
                "type": "new_message",
                "data": {
                    "senderNumber": "+14155550100",
                    "timestamp": "2026-01-05T10:00:00Z",
                    "content": "hi"
                }
            })))
            .create_async()
            .await;

        let at = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        relay(&server.url())
            .notify(&NewMessageEvent::sms("u1", "+14155550100", "hi", at))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn lookup_not_found_is_none() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/lookup")
            .with_body(r#"{"success":false,"notFound":true}"#)
            .create_async()
            .await;

        assert_eq!(relay(&server.url()).lookup_contact(LookupKey::Phone("+1415")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lookup_returns_contact() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/lookup")
            .match_body(Matcher::Json(json!({"phone": "+14155550100"})))
            .with_body(r#"{"success":true,"contact":{"name":"Dana Reyes","company":"Acme"}}"#)
            .create_async()
            .await;

        let contact = relay(&server.url())
            .lookup_contact(LookupKey::Phone("+14155550100"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.name.as_deref(), Some("Dana Reyes"));
        assert_eq!(contact.company.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn unconfigured_endpoints_are_noops() {
        let client = RelayClient::new(&NotificationsConfig::default(), "svc");
        let at = Utc::now();
        client
            .notify(&NewMessageEvent::sms("u1", "+1", "x", at))
            .await
            .unwrap();
        assert_eq!(client.lookup_contact(LookupKey::Email("a@b.co")).await.unwrap(), None);
    }
}
