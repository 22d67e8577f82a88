use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::AppState;

const SCRIPT: &str = include_str!("widget.js");
const API_PLACEHOLDER: &str = "__MAGPIPE_API__";

/// The widget script with this server's public URL filled in.
pub fn render(external_url: &str) -> String {
    SCRIPT.replace(API_PLACEHOLDER, external_url.trim_end_matches('/'))
}

/// Handle GET /widget.js
pub async fn handle_script(State(state): State<AppState>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/javascript; charset=utf-8"),
            (header::CACHE_CONTROL, "public, max-age=300"),
        ],
        render(&state.config.server.external_url),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_points_at_this_server() {
        let js = render("https://chat.example.com/");
        assert!(js.contains("var API_URL = 'https://chat.example.com/webhooks/chat';"));
        assert!(js.contains("window.MagpipeChat = function"));
        assert!(!js.contains(API_PLACEHOLDER));
    }
}
