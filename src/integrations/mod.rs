//! Clients for third-party APIs reached on behalf of a user.

pub mod calcom;
pub mod hubspot;
pub mod mcp;
pub mod places;
pub mod relay;
pub mod slack;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::models::UserIntegration;

/// Tokens are refreshed when they expire within this window.
const REFRESH_WINDOW: Duration = Duration::minutes(5);

/// OAuth refresh-token grant response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Writes the new tokens onto `integration`, keeping the old refresh
    /// token when the provider did not rotate it.
    pub fn apply(&self, integration: &mut UserIntegration, default_ttl_secs: i64, now: DateTime<Utc>) {
        integration.access_token = Some(self.access_token.clone());
        if let Some(refresh) = &self.refresh_token {
            integration.refresh_token = Some(refresh.clone());
        }
        let ttl = self.expires_in.unwrap_or(default_ttl_secs);
        integration.token_expires_at = Some(now + Duration::seconds(ttl));
    }
}

/// True when the access token expires within five minutes and a refresh
/// token is on file. Integrations without an expiry never refresh.
pub fn needs_refresh(integration: &UserIntegration, now: DateTime<Utc>) -> bool {
    match (integration.token_expires_at, &integration.refresh_token) {
        (Some(expires), Some(_)) => expires < now + REFRESH_WINDOW,
        _ => false,
    }
}
