use std::fmt::Display;
use std::future::Future;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, ToolResponse};
use crate::integrations::{needs_refresh, TokenGrant};
use crate::models::{IntegrationProvider, UserIntegration};
use crate::AppState;

/// Outcome of fetching a usable OAuth token for a provider.
pub(super) enum Access {
    Token(String),
    NotConnected,
    Expired,
}

/// The user's token for `provider`, refreshed and persisted first when it
/// expires within five minutes.
pub(super) async fn access_token<F, Fut, E>(
    state: &AppState,
    user_id: &str,
    provider: &str,
    default_ttl_secs: i64,
    refresh: F,
) -> Access
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<TokenGrant, E>>,
    E: Display,
{
    let integration = match state.store.integration(user_id, provider).await {
        Ok(Some(i)) => i,
        Ok(None) => return Access::NotConnected,
        Err(e) => {
            tracing::error!(user_id, provider, "Integration lookup failed: {e}");
            return Access::NotConnected;
        }
    };
    let now = Utc::now();
    if !needs_refresh(&integration, now) {
        return match integration.access_token {
            Some(token) if !token.is_empty() => Access::Token(token),
            _ => Access::NotConnected,
        };
    }

    let refresh_token = integration.refresh_token.clone().unwrap_or_default();
    match refresh(refresh_token).await {
        Ok(grant) => {
            let mut updated = integration.clone();
            grant.apply(&mut updated, default_ttl_secs, now);
            if let Err(e) = state.store.update_integration(&updated).await {
                tracing::warn!(user_id, provider, "Failed to store refreshed token: {e}");
            }
            tracing::info!(user_id, provider, "Refreshed access token");
            Access::Token(grant.access_token)
        }
        Err(e) => {
            tracing::error!(user_id, provider, "Token refresh failed: {e}");
            Access::Expired
        }
    }
}

async fn catalog(state: &AppState, user_id: &str) -> Result<(Vec<IntegrationProvider>, Vec<UserIntegration>), ToolResponse> {
    let providers = state.store.integration_providers().await.map_err(|e| {
        tracing::error!("Failed to load integration providers: {e}");
        ToolResponse::fail("Failed to fetch integrations")
    })?;
    let mut providers: Vec<IntegrationProvider> = providers
        .into_iter()
        .filter(|p| p.enabled && p.slug != "builtin")
        .collect();
    providers.sort_by(|a, b| a.name.cmp(&b.name));
    let mine = state.store.user_integrations(user_id).await.unwrap_or_default();
    Ok((providers, mine))
}

fn names(list: &[&IntegrationProvider]) -> String {
    list.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
}

fn provider_info(p: &IntegrationProvider) -> Value {
    json!({ "slug": p.slug, "name": p.name, "description": p.description, "category": p.category })
}

pub(super) async fn list(state: &AppState, user_id: &str) -> ToolResponse {
    let (providers, mine) = match catalog(state, user_id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let (connected, available): (Vec<&IntegrationProvider>, Vec<&IntegrationProvider>) = providers
        .iter()
        .partition(|p| mine.iter().any(|i| i.provider == p.slug && i.is_connected()));

    let mut message = match connected.len() {
        0 => "You don't have any integrations connected yet.\n\n".to_string(),
        1 => format!("You have 1 connected integration: {}.\n\n", names(&connected)),
        n => format!("You have {n} connected integrations: {}.\n\n", names(&connected)),
    };
    if available.is_empty() {
        message.push_str("All available integrations are already connected!");
    } else {
        message.push_str(&format!(
            "Available to connect: {}.\n\nWould you like me to help you connect any of these?",
            names(&available)
        ));
    }

    ToolResponse::ok(message).with_result(json!({
        "connected": connected.iter().map(|p| provider_info(p)).collect::<Vec<_>>(),
        "available": available.iter().map(|p| provider_info(p)).collect::<Vec<_>>(),
    }))
}

#[derive(Deserialize)]
struct StatusArgs {
    #[serde(default)]
    provider: Option<String>,
}

pub(super) async fn status(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: StatusArgs = match parse_args("check_integration_status", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let Some(wanted) = args.provider.filter(|p| !p.trim().is_empty()) else {
        return ToolResponse::fail("Please specify which integration to check.");
    };
    let (providers, mine) = match catalog(state, user_id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let wanted_lower = wanted.to_lowercase();
    let Some(provider) = providers
        .iter()
        .find(|p| p.slug == wanted_lower || p.name.to_lowercase() == wanted_lower)
    else {
        return ToolResponse::fail(format!("I couldn't find an integration called \"{wanted}\"."));
    };

    let connection = mine.iter().find(|i| i.provider == provider.slug && i.is_connected());
    match connection {
        Some(conn) => {
            let since = conn
                .connected_at
                .map(|at| format!(" (since {})", at.format("%b %-d, %Y")))
                .unwrap_or_default();
            ToolResponse::ok(format!("{} is connected{since} and ready to use!", provider.name)).with_result(json!({
                "provider": provider.slug,
                "connected": true,
                "connected_at": conn.connected_at,
            }))
        }
        None => ToolResponse::ok(format!(
            "{} is not connected. Would you like me to help you connect it?",
            provider.name
        ))
        .with_result(json!({ "provider": provider.slug, "connected": false })),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::call;
    use super::super::Mode;
    use super::*;
    use crate::testing::{harness, Harness, ScriptedModel};
    use chrono::{Duration, TimeZone};

    async fn seed(h: &Harness) {
        h.store
            .with(|t| {
                for (slug, name, enabled) in [
                    ("slack", "Slack", true),
                    ("hubspot", "HubSpot", true),
                    ("cal_com", "Cal.com", true),
                    ("builtin", "Built-in", true),
                    ("zapier", "Zapier", false),
                ] {
                    t.providers.push(IntegrationProvider {
                        id: format!("p-{slug}"),
                        slug: slug.into(),
                        name: name.into(),
                        enabled,
                        ..Default::default()
                    });
                }
                t.integrations.push(UserIntegration {
                    id: "i1".into(),
                    user_id: "u1".into(),
                    provider: "slack".into(),
                    status: "connected".into(),
                    access_token: Some("xoxb".into()),
                    connected_at: Some(Utc.with_ymd_and_hms(2026, 2, 14, 12, 0, 0).unwrap()),
                    ..Default::default()
                });
            })
            .await;
    }

    #[tokio::test]
    async fn lists_connected_and_available() {
        let h = harness(ScriptedModel::replying(""), "http://127.0.0.1:9");
        seed(&h).await;
        let resp = call(&h.state, "list_available_integrations", json!({}), Mode::Preview).await;
        assert_eq!(
            resp.message.as_deref(),
            Some(
                "You have 1 connected integration: Slack.\n\nAvailable to connect: Cal.com, HubSpot.\n\nWould you like me to help you connect any of these?"
            )
        );
    }

    #[tokio::test]
    async fn status_by_slug_or_name() {
        let h = harness(ScriptedModel::replying(""), "http://127.0.0.1:9");
        seed(&h).await;

        let resp = call(&h.state, "check_integration_status", json!({ "provider": "slack" }), Mode::Preview).await;
        assert_eq!(resp.message.as_deref(), Some("Slack is connected (since Feb 14, 2026) and ready to use!"));

        let resp = call(&h.state, "check_integration_status", json!({ "provider": "HubSpot" }), Mode::Preview).await;
        assert_eq!(
            resp.message.as_deref(),
            Some("HubSpot is not connected. Would you like me to help you connect it?")
        );

        let resp = call(&h.state, "check_integration_status", json!({ "provider": "zapier" }), Mode::Preview).await;
        assert_eq!(resp.message.as_deref(), Some("I couldn't find an integration called \"zapier\"."));

        let resp = call(&h.state, "check_integration_status", json!({}), Mode::Preview).await;
        assert_eq!(resp.message.as_deref(), Some("Please specify which integration to check."));
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_saved() {
        let h = harness(ScriptedModel::replying(""), "http://127.0.0.1:9");
        h.store
            .with(|t| {
                t.integrations.push(UserIntegration {
                    id: "i2".into(),
                    user_id: "u1".into(),
                    provider: "hubspot".into(),
                    status: "connected".into(),
                    access_token: Some("old".into()),
                    refresh_token: Some("r1".into()),
                    token_expires_at: Some(Utc::now() + Duration::minutes(1)),
                    ..Default::default()
                })
            })
            .await;

        let access = access_token(&h.state, "u1", "hubspot", 1800, |refresh| async move {
            assert_eq!(refresh, "r1");
            Ok::<_, String>(TokenGrant {
                access_token: "new".into(),
                refresh_token: None,
                expires_in: Some(1800),
            })
        })
        .await;
        assert!(matches!(access, Access::Token(t) if t == "new"));
        let saved = h.store.with(|t| t.integrations[0].access_token.clone()).await;
        assert_eq!(saved.as_deref(), Some("new"));

        h.store
            .with(|t| t.integrations[0].token_expires_at = Some(Utc::now()))
            .await;
        let access = access_token(&h.state, "u1", "hubspot", 1800, |_| async {
            Err::<TokenGrant, _>("invalid_grant")
        })
        .await;
        assert!(matches!(access, Access::Expired));
    }
}
