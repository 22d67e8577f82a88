use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::models::McpServer;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC client for MCP tool servers reachable over plain HTTP POST.
pub struct McpClient {
    client: reqwest::Client,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// `tools/call` on `server`. Returns the JSON-RPC `result`.
    pub async fn call_tool(
        &self,
        server: &McpServer,
        tool: &str,
        arguments: &Value,
    ) -> Result<Value, McpError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": Utc::now().timestamp_millis(),
            "method": "tools/call",
            "params": { "name": tool, "arguments": arguments },
        });

        let mut req = self.client.post(&server.server_url).json(&request);
        if let Some(token) = server.access_token.as_deref().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }

        tracing::info!(server = %server.name, tool, "MCP tools/call");
        let resp = req.send().await.map_err(|e| McpError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Api(format!("{status}: {body}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| McpError::Request(e.to_string()))?;
        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            let message = err["message"].as_str().unwrap_or("unknown error");
            return Err(McpError::Rpc(message.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Flattens a `tools/call` result's content list: text items are
/// concatenated, resources become `[Resource: uri]` lines.
pub fn result_text(result: &Value) -> String {
    let mut text = String::new();
    for item in result["content"].as_array().into_iter().flatten() {
        match item["type"].as_str() {
            Some("text") => text.push_str(item["text"].as_str().unwrap_or_default()),
            Some("resource") => {
                let uri = item["resource"]["uri"].as_str().unwrap_or("unknown");
                text.push_str(&format!("\n[Resource: {uri}]"));
            }
            _ => {}
        }
    }
    text
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("MCP server error: {0}")]
    Api(String),
    #[error("MCP error: {0}")]
    Rpc(String),
}
