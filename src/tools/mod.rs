//! Agent tool execution with a two-phase preview/execute protocol.
//!
//! Mutating tools answer a preview with a [`PendingAction`] describing what
//! execute would do, without touching anything. Each handler normalizes its
//! arguments once and only then branches on [`Mode`], so a confirmed action
//! acts on exactly the parameters the preview showed.

mod agent;
mod calendar;
mod contacts;
mod hubspot;
mod integrations;
mod mcp;
mod messaging;
mod slack;

use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http;
use crate::models::{PiiStorage, ToolLog};
use crate::pii;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Preview,
    Execute,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub mode: Mode,
}

/// What execute would do, shown to the user for confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub preview: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_action: Option<PendingAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_info: Option<Value>,
}

impl ToolResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn pending(kind: &str, preview: impl Into<String>, parameters: Value) -> Self {
        Self {
            success: true,
            requires_confirmation: Some(true),
            pending_action: Some(PendingAction {
                kind: kind.to_string(),
                preview: preview.into(),
                parameters,
            }),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// The text handed back to a model that called this tool.
    pub fn summary(&self) -> String {
        match (&self.pending_action, &self.message) {
            (Some(action), _) => action.preview.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) if self.success => "Done.".to_string(),
            (None, None) => "The tool failed.".to_string(),
        }
    }
}

/// Deserializes a tool's arguments, failing the call on a shape mismatch.
fn parse_args<T: DeserializeOwned>(tool: &str, args: &Value) -> Result<T, ToolResponse> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args.clone()
    };
    serde_json::from_value(args).map_err(|e| ToolResponse::fail(format!("Invalid arguments for {tool}: {e}")))
}

/// Timezone of the user's default agent, used to read and show times.
async fn user_timezone(state: &AppState, user_id: &str) -> Tz {
    let agent = state.store.default_agent(user_id).await.ok().flatten();
    agent
        .and_then(|a| a.schedule_timezone)
        .and_then(|tz| tz.parse().ok())
        .unwrap_or(chrono_tz::America::Los_Angeles)
}

/// RFC 3339, or a local `YYYY-MM-DDTHH:MM[:SS]` read in `tz`.
fn parse_time(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|at| at.with_timezone(&Utc))
}

/// e.g. `Tue, Mar 3, 2:30 PM`.
fn format_time(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%a, %b %-d, %-I:%M %p").to_string()
}

fn tool_source(tool_name: &str) -> String {
    if let Some((server, _)) = tool_name.split_once(':') {
        return format!("mcp:{server}");
    }
    let source = match tool_name {
        "slack_send_message" | "slack_list_channels" => "slack",
        "check_calendar_availability" | "book_calendar_appointment" => "calcom",
        name if name.starts_with("hubspot_") => "hubspot",
        _ => "builtin",
    };
    source.to_string()
}

async fn dispatch(state: &AppState, user_id: &str, tool: &str, args: &Value, mode: Mode) -> ToolResponse {
    match tool {
        "list_contacts" => contacts::list(state, user_id, args).await,
        "add_contact" => contacts::add(state, user_id, args, mode).await,
        "call_contact" => contacts::call(state, user_id, args).await,
        "send_sms" => messaging::send(state, user_id, args, mode).await,
        "schedule_sms" => messaging::schedule(state, user_id, args, mode).await,
        "search_business" => contacts::search_business(state, args).await,
        "update_system_prompt" => agent::update_prompt(state, user_id, args, mode).await,
        "add_knowledge_source" => agent::add_knowledge_source(state, user_id, args, mode).await,
        "check_calendar_availability" => calendar::availability(state, user_id, args).await,
        "book_calendar_appointment" => calendar::book(state, user_id, args, mode).await,
        "list_available_integrations" => integrations::list(state, user_id).await,
        "check_integration_status" => integrations::status(state, user_id, args).await,
        "slack_send_message" => slack::send_message(state, user_id, args).await,
        "slack_list_channels" => slack::list_channels(state, user_id).await,
        "hubspot_create_contact" => hubspot::create_contact(state, user_id, args).await,
        "hubspot_search_contacts" => hubspot::search_contacts(state, user_id, args).await,
        "hubspot_get_contact" => hubspot::get_contact(state, user_id, args).await,
        "hubspot_create_note" => hubspot::create_note(state, user_id, args).await,
        other if other.contains(':') => mcp::call(state, user_id, other, args).await,
        other => ToolResponse::fail(format!("Unknown tool: {other}")),
    }
}

/// Tool arguments as the log keeps them, following the default agent's PII
/// setting.
async fn logged_input(state: &AppState, user_id: &str, arguments: &Value) -> Value {
    let storage = match state.store.default_agent(user_id).await {
        Ok(agent) => agent.map(|a| a.pii_storage).unwrap_or_default(),
        Err(e) => {
            tracing::warn!(user_id, "Agent lookup for tool log failed: {e}");
            PiiStorage::default()
        }
    };
    match (storage, arguments) {
        (PiiStorage::Enabled, _) => arguments.clone(),
        (PiiStorage::Redacted, Value::Object(map)) => {
            Value::Object(pii::redact_object(state.llm.as_ref(), map).await)
        }
        (PiiStorage::Redacted, other) => {
            Value::String(pii::redact(state.llm.as_ref(), &other.to_string()).await)
        }
        (PiiStorage::Disabled, _) => Value::Null,
    }
}

/// Runs one tool call and records it in the tool log.
pub async fn run(state: &AppState, user_id: &str, request: &ToolRequest) -> ToolResponse {
    run_in(state, user_id, request, None).await
}

/// [`run`], tagging the log row with where the call came from (e.g. a chat
/// session).
pub async fn run_in(
    state: &AppState,
    user_id: &str,
    request: &ToolRequest,
    context: Option<Value>,
) -> ToolResponse {
    let started = Instant::now();
    let response = dispatch(state, user_id, &request.tool_name, &request.arguments, request.mode).await;
    let elapsed = started.elapsed().as_millis() as u64;

    tracing::info!(
        user_id,
        tool = %request.tool_name,
        mode = ?request.mode,
        success = response.success,
        elapsed_ms = elapsed,
        "Tool executed"
    );

    let log = ToolLog {
        user_id: user_id.to_string(),
        tool_name: request.tool_name.clone(),
        tool_source: tool_source(&request.tool_name),
        input: logged_input(state, user_id, &request.arguments).await,
        output: serde_json::to_value(&response).unwrap_or(Value::Null),
        success: response.success,
        error_message: (!response.success).then(|| response.message.clone()).flatten(),
        execution_time_ms: Some(elapsed),
        context,
    };
    if let Err(e) = state.store.insert_tool_log(&log).await {
        tracing::warn!(tool = %request.tool_name, "Failed to log tool execution: {e}");
    }
    response
}

/// POST /mcp/execute
pub async fn handle_execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ToolRequest>,
) -> Response {
    let user_id = match http::authenticate(&headers, &state.config.api.token, state.store.as_ref()).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if request.tool_name.is_empty() {
        return http::error(StatusCode::BAD_REQUEST, "Missing tool_name");
    }
    Json(run(&state, &user_id, &request).await).into_response()
}
