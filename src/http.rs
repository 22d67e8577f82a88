//! Response and auth helpers shared by the JSON endpoints.

use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::store::Store;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// `{"success": false, "error": ...}` with the given status.
pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message.into(),
        }),
    )
        .into_response()
}

/// Browser-facing endpoints accept any origin.
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("apikey"),
        ])
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolves the calling user. The service token may act for any user named
/// in `x-user-id`; any other bearer must be a user access token.
#[allow(clippy::result_large_err)]
pub async fn authenticate(
    headers: &HeaderMap,
    service_token: &str,
    store: &dyn Store,
) -> Result<String, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(error(StatusCode::UNAUTHORIZED, "Missing authorization header"));
    };

    let acting_for = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(user_id) = acting_for {
        if !service_token.is_empty() && token == service_token {
            tracing::debug!(%user_id, "Service call");
            return Ok(user_id.to_string());
        }
    }

    match store.user_id_for_token(token).await {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => {
            tracing::warn!("Unauthorized API request");
            Err(error(StatusCode::UNAUTHORIZED, "Invalid authorization token"))
        }
        Err(e) => {
            tracing::error!("Token lookup failed: {e}");
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, v.parse().unwrap());
        }
        map
    }

    #[test]
    fn bearer_requires_prefix_and_value() {
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer abc")])), Some("abc"));
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer ")])), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn service_token_acts_for_named_user() {
        let store = MemoryStore::default();
        let h = headers(&[("authorization", "Bearer svc"), ("x-user-id", "u9")]);
        assert_eq!(authenticate(&h, "svc", &store).await.unwrap(), "u9");
    }

    #[tokio::test]
    async fn user_tokens_resolve_through_store() {
        let store = MemoryStore::default();
        store.with(|t| {
            t.tokens.insert("tok-1".into(), "u1".into());
        })
        .await;

        let h = headers(&[("authorization", "Bearer tok-1")]);
        assert_eq!(authenticate(&h, "svc", &store).await.unwrap(), "u1");

        // x-user-id is ignored without the service token
        let h = headers(&[("authorization", "Bearer nope"), ("x-user-id", "u1")]);
        let resp = authenticate(&h, "svc", &store).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = authenticate(&HeaderMap::new(), "svc", &store).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
