use serde_json::{json, Value};

use super::ToolResponse;
use crate::integrations::mcp::{result_text, McpError};
use crate::AppState;

/// Forwards `server:tool` to the user's connected MCP server.
pub(super) async fn call(state: &AppState, user_id: &str, tool_name: &str, args: &Value) -> ToolResponse {
    let (slug, tool) = match tool_name.split_once(':') {
        Some((slug, tool)) if !slug.is_empty() && !tool.is_empty() => (slug, tool),
        _ => return ToolResponse::fail(format!("Invalid tool name format: {tool_name}")),
    };

    let servers = match state.store.mcp_servers(user_id).await {
        Ok(servers) => servers,
        Err(e) => {
            tracing::error!(user_id, "MCP server lookup failed: {e}");
            Vec::new()
        }
    };
    let Some(server) = servers.into_iter().find(|s| s.slug() == slug) else {
        return ToolResponse::fail(format!(
            "MCP server \"{slug}\" not found. Make sure it's connected in Settings → MCP Servers."
        ));
    };

    let args = if args.is_null() { json!({}) } else { args.clone() };
    match state.mcp.call_tool(&server, tool, &args).await {
        Ok(result) => {
            let text = result_text(&result);
            let message = if text.is_empty() {
                format!("Tool {tool} executed successfully")
            } else {
                text
            };
            ToolResponse::ok(message).with_result(result)
        }
        Err(e @ McpError::Request(_)) => {
            tracing::error!(user_id, server = %server.name, tool, "MCP server unreachable: {e}");
            ToolResponse::fail(format!("Failed to connect to {}: {e}", server.name))
        }
        Err(e) => {
            tracing::warn!(user_id, server = %server.name, tool, "MCP tool failed: {e}");
            ToolResponse::fail(format!("Failed to execute tool on {}: {e}", server.name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::call;
    use super::super::Mode;
    use super::*;
    use crate::models::McpServer;
    use crate::testing::{harness, ScriptedModel};
    use mockito::Matcher;

    #[tokio::test]
    async fn forwards_to_server_by_slug() {
        let mut server = mockito::Server::new_async().await;
        let rpc = server
            .mock("POST", "/rpc")
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/call",
                "params": { "name": "create_issue", "arguments": { "title": "Bug" } },
            })))
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"Created #12"}]}}"#)
            .expect(1)
            .create_async()
            .await;
        let h = harness(ScriptedModel::replying(""), &server.url());
        let url = format!("{}/rpc", server.url());
        h.store
            .with(|t| {
                t.mcp_servers.push(McpServer {
                    id: "m1".into(),
                    user_id: "u1".into(),
                    name: "Issue Tracker".into(),
                    server_url: url,
                    ..Default::default()
                })
            })
            .await;

        let resp = call(&h.state, "issue_tracker:create_issue", json!({ "title": "Bug" }), Mode::Execute).await;
        assert!(resp.success);
        assert_eq!(resp.message.as_deref(), Some("Created #12"));
        rpc.assert_async().await;

        let logs = h.store.with(|t| t.tool_logs.clone()).await;
        assert_eq!(logs[0].tool_source, "mcp:issue_tracker");
    }

    #[tokio::test]
    async fn reports_missing_server_and_bad_names() {
        let h = harness(ScriptedModel::replying(""), "http://127.0.0.1:9");
        let resp = call(&h.state, "github:list_repos", json!({}), Mode::Execute).await;
        assert_eq!(
            resp.message.as_deref(),
            Some("MCP server \"github\" not found. Make sure it's connected in Settings → MCP Servers.")
        );
        let resp = call(&h.state, ":list_repos", json!({}), Mode::Execute).await;
        assert_eq!(resp.message.as_deref(), Some("Invalid tool name format: :list_repos"));
    }

    #[tokio::test]
    async fn rpc_errors_name_the_server() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rpc")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such tool"}}"#)
            .create_async()
            .await;
        let h = harness(ScriptedModel::replying(""), &server.url());
        let url = format!("{}/rpc", server.url());
        h.store
            .with(|t| {
                t.mcp_servers.push(McpServer {
                    id: "m1".into(),
                    user_id: "u1".into(),
                    name: "Docs".into(),
                    server_url: url,
                    ..Default::default()
                })
            })
            .await;

        let resp = call(&h.state, "docs:search", json!({}), Mode::Execute).await;
        assert_eq!(resp.message.as_deref(), Some("Failed to execute tool on Docs: MCP error: no such tool"));
    }
}
