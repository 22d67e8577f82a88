//! Gmail API and Google OAuth.

pub mod message;
pub mod webhook;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::GoogleConfig;
use crate::integrations::TokenGrant;
use crate::models::UserIntegration;
use crate::store::Store;

pub use message::GmailMessage;

/// Google access tokens without an `expires_in` live an hour.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

pub struct GmailClient {
    client: reqwest::Client,
    /// `.../gmail/v1/users/me`
    api_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
struct HistoryRecord {
    #[serde(default, rename = "messagesAdded")]
    messages_added: Vec<MessageAdded>,
}

#[derive(Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Deserialize)]
struct HistoryPage {
    #[serde(default)]
    history: Vec<HistoryRecord>,
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    #[serde(default)]
    history_id: Option<String>,
}

impl GmailClient {
    pub fn new(config: &GoogleConfig) -> Self {
        Self::with_base_urls(
            config,
            "https://gmail.googleapis.com/gmail/v1/users/me",
            "https://oauth2.googleapis.com/token",
        )
    }

    pub fn with_base_urls(config: &GoogleConfig, api_base: &str, token_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url: token_url.to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, GmailError> {
        let resp = req
            .send()
            .await
            .map_err(|e| GmailError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(GmailError::NotFound(body));
            }
            return Err(GmailError::Api(format!("{status}: {body}")));
        }
        Ok(resp)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GmailError> {
        let resp = self
            .send(
                self.client
                    .get(format!("{}{path}", self.api_base))
                    .bearer_auth(token)
                    .query(query),
            )
            .await?;
        resp.json().await.map_err(|e| GmailError::Request(e.to_string()))
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, GmailError> {
        let resp = self
            .send(self.client.post(&self.token_url).form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ]))
            .await?;
        resp.json().await.map_err(|e| GmailError::Request(e.to_string()))
    }

    /// Current mailbox history id, the baseline for later history queries.
    pub async fn latest_history_id(&self, token: &str) -> Result<Option<String>, GmailError> {
        let profile: Profile = self.get_json(token, "/profile", &[]).await?;
        Ok(profile.history_id)
    }

    /// Ids of messages added since `start_history_id`, in first-seen order.
    /// A 404 means the history id has expired; the caller falls back to
    /// [`recent_message_ids`](Self::recent_message_ids).
    pub async fn history_message_ids(
        &self,
        token: &str,
        start_history_id: &str,
    ) -> Result<Vec<String>, GmailError> {
        let page: HistoryPage = self
            .get_json(
                token,
                "/history",
                &[
                    ("startHistoryId", start_history_id),
                    ("historyTypes", "messageAdded"),
                ],
            )
            .await?;
        let mut ids: Vec<String> = Vec::new();
        for added in page.history.into_iter().flat_map(|h| h.messages_added) {
            if !ids.contains(&added.message.id) {
                ids.push(added.message.id);
            }
        }
        Ok(ids)
    }

    pub async fn recent_message_ids(&self, token: &str, max: u32) -> Result<Vec<String>, GmailError> {
        let max = max.to_string();
        let list: MessageList = self
            .get_json(token, "/messages", &[("maxResults", max.as_str())])
            .await?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    pub async fn message(&self, token: &str, id: &str) -> Result<GmailMessage, GmailError> {
        self.get_json(token, &format!("/messages/{id}"), &[("format", "full")])
            .await
    }

    /// Sends an encoded reply in `thread_id`. Returns the new message id.
    pub async fn send_raw(&self, token: &str, raw: &str, thread_id: &str) -> Result<String, GmailError> {
        let resp = self
            .send(
                self.client
                    .post(format!("{}/messages/send", self.api_base))
                    .bearer_auth(token)
                    .json(&json!({ "raw": raw, "threadId": thread_id })),
            )
            .await?;
        let sent: MessageRef = resp
            .json()
            .await
            .map_err(|e| GmailError::Request(e.to_string()))?;
        Ok(sent.id)
    }

    /// A usable access token for `integration`, refreshing and persisting a
    /// new one when the stored token has expired.
    pub async fn access_token(
        &self,
        store: &dyn Store,
        integration: &UserIntegration,
    ) -> Result<String, GmailError> {
        let now = Utc::now();
        if let (Some(token), Some(expires)) = (&integration.access_token, integration.token_expires_at) {
            if expires > now {
                return Ok(token.clone());
            }
        }

        let refresh = integration
            .refresh_token
            .as_deref()
            .ok_or(GmailError::NoRefreshToken)?;
        let grant = self.refresh_token(refresh).await?;

        let mut updated = integration.clone();
        grant.apply(&mut updated, DEFAULT_TOKEN_TTL_SECS, now);
        if let Err(e) = store.update_integration(&updated).await {
            tracing::warn!(integration_id = %integration.id, "Failed to store refreshed Gmail token: {e}");
        }
        tracing::info!(integration_id = %integration.id, "Refreshed Gmail access token");
        Ok(grant.access_token)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GmailError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Gmail API error: {0}")]
    Api(String),
    #[error("Gmail resource not found: {0}")]
    NotFound(String),
    #[error("integration has no refresh token")]
    NoRefreshToken,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;
    use mockito::Matcher;

    fn gmail(url: &str) -> GmailClient {
        let config = GoogleConfig {
            client_id: "gid".into(),
            client_secret: "gsecret".into(),
            ..Default::default()
        };
        GmailClient::with_base_urls(&config, &format!("{url}/gmail/v1/users/me"), &format!("{url}/token"))
    }

    fn integration(expires_in: i64) -> UserIntegration {
        UserIntegration {
            id: "int-g".into(),
            user_id: "u1".into(),
            provider: "google_email".into(),
            status: "connected".into(),
            access_token: Some("stale".into()),
            refresh_token: Some("r-1".into()),
            token_expires_at: Some(Utc::now() + Duration::seconds(expires_in)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn history_ids_are_deduplicated() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/history")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("startHistoryId".into(), "100".into()),
                Matcher::UrlEncoded("historyTypes".into(), "messageAdded".into()),
            ]))
            .with_body(
                r#"{"history":[
                    {"messagesAdded":[{"message":{"id":"a"}},{"message":{"id":"b"}}]},
                    {"messagesAdded":[{"message":{"id":"a"}}]},
                    {"labelsAdded":[]}
                ]}"#,
            )
            .create_async()
            .await;

        let ids = gmail(&server.url()).history_message_ids("t", "100").await.unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn expired_history_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/history")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":{"code":404}}"#)
            .create_async()
            .await;

        let err = gmail(&server.url()).history_message_ids("t", "1").await.unwrap_err();
        assert!(matches!(err, GmailError::NotFound(_)));
    }

    #[tokio::test]
    async fn valid_token_is_used_without_refresh() {
        let server = mockito::Server::new_async().await;
        let store = MemoryStore::default();
        let token = gmail(&server.url())
            .access_token(&store, &integration(600))
            .await
            .unwrap();
        assert_eq!(token, "stale");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_stored() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("client_id".into(), "gid".into()),
            ]))
            .with_body(r#"{"access_token":"fresh","expires_in":3599}"#)
            .create_async()
            .await;

        let store = MemoryStore::default();
        store.with(|t| t.integrations.push(integration(-10))).await;

        let token = gmail(&server.url())
            .access_token(&store, &integration(-10))
            .await
            .unwrap();
        assert_eq!(token, "fresh");
        mock.assert_async().await;

        let stored = store.integration_by_id("int-g").await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh"));
        assert_eq!(stored.refresh_token.as_deref(), Some("r-1"));
        assert!(stored.token_expires_at.unwrap() > Utc::now());
    }
}
