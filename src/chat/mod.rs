//! Website chat: the widget's JSON API and the agent conversation behind it.

pub mod webhook;
pub mod widget;

use reqwest::Url;
use serde_json::{json, Value};

use crate::llm::{CompletionRequest, LlmError, Message, ToolCall, ToolSpec};
use crate::models::McpServer;
use crate::tools::{self, Mode, ToolRequest};
use crate::AppState;

pub const DEFAULT_CHAT_PROMPT: &str = "You are a helpful AI assistant responding via website chat. Be friendly, professional, and concise. Keep responses to 2-4 sentences unless more detail is needed.";

const CHAT_SUFFIX: &str = "\n\nIMPORTANT CONTEXT:
- You are responding via WEBSITE CHAT (not SMS or phone call)
- Keep responses helpful and conversational (2-4 sentences typically)
- You can use markdown formatting (bold, lists, links)
- Be friendly and professional
- If they need to call, provide the business phone number
- This is a real-time chat - respond promptly and concisely";

/// Stand-in user turn when the widget asks for an opening message.
pub const GREETING_REQUEST: &str = "Generate a warm, personalized greeting to start the conversation. Keep it brief (1-2 sentences). Do not ask how you can help - just greet them warmly.";

/// Reply used when the model is still calling tools after the last round.
pub const TOOL_LIMIT_REPLY: &str = "I've processed your request. Is there anything else I can help you with?";

const MAX_TOOL_ROUNDS: usize = 3;
const MAX_TOKENS: u32 = 300;

/// Whether a widget embedded on `page_url` may talk to us. An empty list
/// allows every page; so does a missing or unparseable URL.
pub fn domain_allowed(allowed: &[String], page_url: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(host) = page_url
        .and_then(|u| Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_lowercase))
    else {
        return true;
    };
    allowed.iter().any(|d| {
        let d = d.trim().to_lowercase();
        host == d || host.ends_with(&format!(".{d}"))
    })
}

/// Splits a display name at the first space.
pub fn split_name(name: &str) -> (String, String) {
    let mut parts = name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let last = parts.collect::<Vec<_>>().join(" ");
    (first, last)
}

/// Inputs to the chat system prompt.
#[derive(Debug, Default)]
pub struct ChatPrompt<'a> {
    pub system_prompt: Option<&'a str>,
    pub visitor_name: Option<&'a str>,
    pub visitor_email: Option<&'a str>,
    /// HubSpot is connected, so the model can file the visitor as a lead.
    pub hubspot: bool,
}

impl ChatPrompt<'_> {
    pub fn build(&self) -> String {
        let name = self.visitor_name.filter(|n| !n.trim().is_empty());
        let email = self.visitor_email.filter(|e| !e.trim().is_empty());

        // The visitor's name goes first so it wins over canned greetings.
        let mut prompt = match name {
            Some(name) => format!(
                "IMPORTANT: You are chatting with {name}. Use their name in your greeting and responses (e.g., \"Hi {name}!\" not just \"Hi there!\").\n\n"
            ),
            None => String::new(),
        };
        prompt.push_str(
            self.system_prompt
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(DEFAULT_CHAT_PROMPT),
        );
        prompt.push_str(CHAT_SUFFIX);

        if self.hubspot {
            match (name, email) {
                (Some(name), Some(email)) => prompt.push_str(&format!(
                    "\n\nHUBSPOT INTEGRATION:\nYou have access to HubSpot CRM. The visitor's contact information is already known:\n- Name: {name}\n- Email: {email}\nDO NOT ask the visitor for their name or email - you already have it.\nWhen appropriate (e.g., during or after a meaningful conversation), create their contact in HubSpot using the hubspot_create_contact tool."
                )),
                _ => prompt.push_str(&format!(
                    "\n\nHUBSPOT INTEGRATION:\nYou have access to HubSpot CRM. When the visitor provides their contact information (name, email), you should:\n- Create or update their contact in HubSpot using the hubspot_create_contact tool\n- The visitor's name is: {}\n- The visitor's email is: {}\n- Use HubSpot proactively when you have enough information to create a lead (at minimum, an email address)",
                    name.unwrap_or("Not provided yet"),
                    email.unwrap_or("Not provided yet"),
                )),
            }
        }
        prompt
    }
}

fn hubspot_contact_tool() -> ToolSpec {
    ToolSpec {
        name: "hubspot_create_contact".into(),
        description: "Create or update a contact in HubSpot CRM".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "email": { "type": "string", "description": "Contact email address (required)" },
                "firstname": { "type": "string", "description": "First name" },
                "lastname": { "type": "string", "description": "Last name" },
                "phone": { "type": "string", "description": "Phone number" },
            },
            "required": ["email"],
        }),
    }
}

/// Cached tools of each connected MCP server, named `server_slug:tool`.
pub fn mcp_tools(servers: &[McpServer]) -> Vec<ToolSpec> {
    servers
        .iter()
        .flat_map(|server| {
            let slug = server.slug();
            server.tools.iter().map(move |tool| ToolSpec {
                name: format!("{slug}:{}", tool.name),
                description: tool
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Tool from {}", server.name)),
                parameters: tool
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            })
        })
        .collect()
}

/// Tools offered to the chat model for a user's widget.
pub async fn available_tools(state: &AppState, user_id: &str, hubspot: bool) -> Vec<ToolSpec> {
    let servers = match state.store.mcp_servers(user_id).await {
        Ok(servers) => servers,
        Err(e) => {
            tracing::error!(user_id, "Failed to load MCP servers: {e}");
            Vec::new()
        }
    };
    let mut tools = mcp_tools(&servers);
    if hubspot {
        tools.push(hubspot_contact_tool());
    }
    tracing::debug!(user_id, tools = tools.len(), hubspot, "Chat tools loaded");
    tools
}

async fn execute_call(state: &AppState, user_id: &str, call: &ToolCall, log_context: &Value) -> String {
    let arguments: Value = if call.function.arguments.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str(&call.function.arguments) {
            Ok(args) => args,
            Err(e) => return format!("Error: invalid arguments: {e}"),
        }
    };
    let request = ToolRequest {
        tool_name: call.function.name.clone(),
        arguments,
        mode: Mode::Execute,
    };
    let response = tools::run_in(state, user_id, &request, Some(log_context.clone())).await;
    match (response.success, response.message) {
        (true, Some(message)) => message,
        (true, None) => response
            .result
            .map(|r| r.to_string())
            .unwrap_or_else(|| "Tool executed successfully".to_string()),
        (false, message) => format!("Error: {}", message.unwrap_or_else(|| "Tool execution failed".into())),
    }
}

/// Runs the completion loop: tool calls are executed and fed back for up
/// to three rounds, then the model's text is the reply.
pub async fn converse(
    state: &AppState,
    user_id: &str,
    mut messages: Vec<Message>,
    tools: Vec<ToolSpec>,
    model: Option<String>,
    log_context: Value,
) -> Result<String, LlmError> {
    for round in 0..MAX_TOOL_ROUNDS {
        let request = CompletionRequest::new(messages.clone())
            .max_tokens(MAX_TOKENS)
            .tools(tools.clone())
            .model(model.clone());
        let reply = state.llm.complete(request).await?;
        if reply.tool_calls.is_empty() {
            return Ok(reply.text().to_string());
        }

        tracing::info!(user_id, round, calls = reply.tool_calls.len(), "Chat model requested tools");
        let calls = reply.tool_calls.clone();
        messages.push(reply);
        for call in &calls {
            let output = execute_call(state, user_id, call, &log_context).await;
            messages.push(Message::tool_result(&call.id, output));
        }
    }
    Ok(TOOL_LIMIT_REPLY.to_string())
}
