use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::TokenGrant;
use crate::config::HubSpotConfig;

/// Association type ids defined by HubSpot.
const NOTE_TO_CONTACT: u32 = 202;
const COMMUNICATION_TO_CONTACT: u32 = 81;

const CONTACT_PROPERTIES: &[&str] = &["email", "firstname", "lastname", "phone", "company"];

/// HubSpot CRM v3 client.
pub struct HubSpotClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContactProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HubSpotContact {
    pub id: String,
    #[serde(default)]
    pub properties: ContactProperties,
}

impl HubSpotContact {
    /// First and last name joined, `None` when both are blank.
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.properties.firstname, &self.properties.lastname]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .filter(|p| !p.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

#[derive(Deserialize)]
struct SearchResults {
    #[serde(default)]
    results: Vec<HubSpotContact>,
}

impl HubSpotClient {
    pub fn new(config: &HubSpotConfig) -> Self {
        Self::with_base_url(config, "https://api.hubapi.com")
    }

    pub fn with_base_url(config: &HubSpotConfig, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, HubSpotError> {
        let resp = req
            .send()
            .await
            .map_err(|e| HubSpotError::Request(e.to_string()))?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        if body["category"] == "CONFLICT" {
            return Err(HubSpotError::Conflict);
        }
        let message = body["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{status}: {body}"));
        Err(HubSpotError::Api(message))
    }

    pub async fn search_by_email(
        &self,
        token: &str,
        email: &str,
    ) -> Result<Option<HubSpotContact>, HubSpotError> {
        let body = json!({
            "filterGroups": [{
                "filters": [{ "propertyName": "email", "operator": "EQ", "value": email }],
            }],
            "properties": CONTACT_PROPERTIES,
            "limit": 1,
        });
        let found = self.search_raw(token, &body).await?;
        Ok(found.into_iter().next())
    }

    /// Free-text contact search.
    pub async fn search(
        &self,
        token: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<HubSpotContact>, HubSpotError> {
        let body = json!({
            "query": query,
            "properties": CONTACT_PROPERTIES,
            "limit": limit,
        });
        self.search_raw(token, &body).await
    }

    async fn search_raw(&self, token: &str, body: &Value) -> Result<Vec<HubSpotContact>, HubSpotError> {
        let req = self
            .client
            .post(format!("{}/crm/v3/objects/contacts/search", self.base_url))
            .bearer_auth(token)
            .json(body);
        let results: SearchResults = serde_json::from_value(self.send(req).await?)
            .map_err(|e| HubSpotError::Request(e.to_string()))?;
        Ok(results.results)
    }

    pub async fn create_contact(
        &self,
        token: &str,
        properties: &ContactProperties,
    ) -> Result<HubSpotContact, HubSpotError> {
        let req = self
            .client
            .post(format!("{}/crm/v3/objects/contacts", self.base_url))
            .bearer_auth(token)
            .json(&json!({ "properties": properties }));
        serde_json::from_value(self.send(req).await?).map_err(|e| HubSpotError::Request(e.to_string()))
    }

    pub async fn update_contact(
        &self,
        token: &str,
        id: &str,
        properties: &ContactProperties,
    ) -> Result<HubSpotContact, HubSpotError> {
        let req = self
            .client
            .patch(format!("{}/crm/v3/objects/contacts/{id}", self.base_url))
            .bearer_auth(token)
            .json(&json!({ "properties": properties }));
        serde_json::from_value(self.send(req).await?).map_err(|e| HubSpotError::Request(e.to_string()))
    }

    /// Creates a note on the contact and returns the note id.
    pub async fn create_note(
        &self,
        token: &str,
        contact_id: &str,
        body: &str,
        at: DateTime<Utc>,
    ) -> Result<String, HubSpotError> {
        let payload = json!({
            "properties": {
                "hs_note_body": body,
                "hs_timestamp": at.to_rfc3339(),
            },
            "associations": [association(contact_id, NOTE_TO_CONTACT)],
        });
        let req = self
            .client
            .post(format!("{}/crm/v3/objects/notes", self.base_url))
            .bearer_auth(token)
            .json(&payload);
        let created = self.send(req).await?;
        Ok(created["id"].as_str().unwrap_or_default().to_string())
    }

    /// Logs an SMS communication so HubSpot updates "last contacted".
    pub async fn log_sms_communication(
        &self,
        token: &str,
        contact_id: &str,
        body: &str,
        at: DateTime<Utc>,
    ) -> Result<(), HubSpotError> {
        let payload = json!({
            "properties": {
                "hs_communication_channel_type": "SMS",
                "hs_communication_logged_from": "CRM",
                "hs_communication_body": body,
                "hs_timestamp": at.to_rfc3339(),
            },
            "associations": [association(contact_id, COMMUNICATION_TO_CONTACT)],
        });
        let req = self
            .client
            .post(format!("{}/crm/v3/objects/communications", self.base_url))
            .bearer_auth(token)
            .json(&payload);
        self.send(req).await.map(|_| ())
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, HubSpotError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(HubSpotError::NotConfigured);
        }
        let req = self
            .client
            .post(format!("{}/oauth/v1/token", self.base_url))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ]);
        serde_json::from_value(self.send(req).await?).map_err(|e| HubSpotError::Request(e.to_string()))
    }
}

fn association(contact_id: &str, type_id: u32) -> Value {
    json!({
        "to": { "id": contact_id },
        "types": [{ "associationCategory": "HUBSPOT_DEFINED", "associationTypeId": type_id }],
    })
}

#[derive(Debug, thiserror::Error)]
pub enum HubSpotError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("{0}")]
    Api(String),
    #[error("contact already exists")]
    Conflict,
    #[error("HubSpot OAuth client is not configured")]
    NotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: &str) -> HubSpotClient {
        let config = HubSpotConfig {
            client_id: "cid".into(),
            client_secret: "cs".into(),
        };
        HubSpotClient::with_base_url(&config, url)
    }

    #[tokio::test]
    async fn search_by_email_uses_eq_filter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/crm/v3/objects/contacts/search")
            .match_header("authorization", "Bearer hs-token")
            .match_body(Matcher::PartialJson(json!({"limit": 1})))
            .with_body(
                r#"{"results":[{"id":"501","properties":{"email":"ana@example.com","firstname":"Ana"}}]}"#,
            )
            .create_async()
            .await;

        let found = client(&server.url())
            .search_by_email("hs-token", "ana@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "501");
        assert_eq!(found.full_name().as_deref(), Some("Ana"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn conflict_category_maps_to_conflict() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/crm/v3/objects/contacts")
            .with_status(409)
            .with_body(r#"{"category":"CONFLICT","message":"Contact already exists"}"#)
            .create_async()
            .await;

        let props = ContactProperties {
            email: Some("ana@example.com".into()),
            ..Default::default()
        };
        let err = client(&server.url()).create_contact("t", &props).await.unwrap_err();
        assert!(matches!(err, HubSpotError::Conflict));
    }

    #[tokio::test]
    async fn api_error_carries_vendor_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PATCH", "/crm/v3/objects/contacts/9")
            .with_status(400)
            .with_body(r#"{"category":"VALIDATION_ERROR","message":"Property phone is invalid"}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .update_contact("t", "9", &ContactProperties::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Property phone is invalid");
    }

    #[tokio::test]
    async fn note_is_associated_with_contact() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/crm/v3/objects/notes")
            .match_body(Matcher::PartialJson(json!({
                "properties": {"hs_note_body": "Called back"}
            })))
            .with_status(201)
            .with_body(r#"{"id":"n-77"}"#)
            .create_async()
            .await;

        let id = client(&server.url())
            .create_note("t", "501", "Called back", Utc::now())
            .await
            .unwrap();
        assert_eq!(id, "n-77");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_posts_form_grant() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/v1/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r-1".into()),
            ]))
            .with_body(r#"{"access_token":"a-2","refresh_token":"r-2","expires_in":1800}"#)
            .create_async()
            .await;

        let grant = client(&server.url()).refresh_token("r-1").await.unwrap();
        assert_eq!(grant.access_token, "a-2");
        assert_eq!(grant.expires_in, Some(1800));
    }
}
