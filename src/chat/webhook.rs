use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{available_tools, converse, split_name, ChatPrompt, GREETING_REQUEST};
use crate::http;
use crate::llm::Message;
use crate::models::{ChatMessage, ChatRole, ChatSession, ChatWidget, SessionStatus};
use crate::tools::{self, Mode, ToolRequest};
use crate::AppState;

const HISTORY_LIMIT: usize = 10;
const POLL_LIMIT: usize = 50;

/// Body the widget posts for each visitor message or greeting request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub widget_key: String,
    #[serde(default)]
    pub visitor_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub visitor_name: Option<String>,
    #[serde(default)]
    pub visitor_email: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub browser_info: Option<Value>,
    #[serde(default)]
    pub request_greeting: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub success: bool,
    pub session_id: String,
    pub message_id: Option<String>,
    /// `null` when no agent answered.
    pub ai_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_greeting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A rejected request: status plus the `error` text sent back.
#[derive(Debug, PartialEq)]
pub struct Rejection(pub StatusCode, pub &'static str);

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        http::error(self.0, self.1)
    }
}

/// Handle POST /webhooks/chat: a visitor message (or greeting request)
/// from the embeddable widget.
pub async fn handle_chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    match respond(&state, req).await {
        Ok(reply) => Json(reply).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

fn filled(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

async fn session_for(state: &AppState, widget: &ChatWidget, req: &ChatRequest) -> Result<(ChatSession, bool), Rejection> {
    let name = filled(&req.visitor_name);
    let email = filled(&req.visitor_email);

    let existing = match state.store.active_chat_session(&widget.id, &req.visitor_id).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(widget_id = %widget.id, "Session lookup failed: {e}");
            None
        }
    };
    if let Some(mut session) = existing {
        if name.is_some() || email.is_some() {
            session.visitor_name = name.or(session.visitor_name);
            session.visitor_email = email.or(session.visitor_email);
            if let Err(e) = state.store.update_chat_session(&session).await {
                tracing::warn!(session_id = %session.id, "Failed to update visitor details: {e}");
            }
        }
        return Ok((session, false));
    }

    let session = ChatSession {
        widget_id: widget.id.clone(),
        user_id: widget.user_id.clone(),
        agent_id: widget.agent_id.clone(),
        visitor_id: req.visitor_id.clone(),
        visitor_name: name,
        visitor_email: email,
        page_url: req.page_url.clone(),
        browser_info: Some(req.browser_info.clone().unwrap_or_else(|| json!({}))),
        status: SessionStatus::Active,
        created_at: Some(Utc::now()),
        ..Default::default()
    };
    match state.store.insert_chat_session(&session).await {
        Ok(created) => {
            tracing::info!(widget_id = %widget.id, session_id = %created.id, "Chat session started");
            Ok((created, true))
        }
        Err(e) => {
            tracing::error!(widget_id = %widget.id, "Failed to create chat session: {e}");
            Err(Rejection(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create chat session"))
        }
    }
}

async fn hubspot_connected(state: &AppState, user_id: &str) -> bool {
    matches!(state.store.integration(user_id, "hubspot").await, Ok(Some(_)))
}

async fn run_tool(state: &AppState, user_id: &str, tool: &str, arguments: Value, context: &Value) -> tools::ToolResponse {
    let request = ToolRequest {
        tool_name: tool.to_string(),
        arguments,
        mode: Mode::Execute,
    };
    tools::run_in(state, user_id, &request, Some(context.clone())).await
}

/// Files a new visitor who gave an email as a HubSpot contact, unless
/// HubSpot already knows them.
async fn sync_visitor(state: &AppState, session: &ChatSession, email: &str, context: &Value) {
    let found = run_tool(state, &session.user_id, "hubspot_search_contacts", json!({ "query": email }), context).await;
    if !found.success {
        tracing::warn!(session_id = %session.id, "HubSpot visitor search failed");
        return;
    }
    let known = found
        .result
        .as_ref()
        .and_then(|r| r["contacts"].as_array())
        .is_some_and(|c| !c.is_empty());
    if known {
        tracing::debug!(session_id = %session.id, "Visitor already in HubSpot");
        return;
    }

    let (first, last) = split_name(session.visitor_name.as_deref().unwrap_or_default());
    let created = run_tool(
        state,
        &session.user_id,
        "hubspot_create_contact",
        json!({ "email": email, "firstname": first, "lastname": last }),
        context,
    )
    .await;
    tracing::info!(session_id = %session.id, success = created.success, "Visitor synced to HubSpot");
}

async fn log_exchange(
    state: &AppState,
    widget: &ChatWidget,
    session: &ChatSession,
    email: &str,
    visitor_text: &str,
    reply: &str,
    context: &Value,
) {
    let widget_name = widget.name.as_deref().unwrap_or("Chat Widget");
    let visitor = session.visitor_name.as_deref().unwrap_or("Website Visitor");
    let content = format!(
        "**Chat via {widget_name}**\n\n**{visitor}:** {visitor_text}\n\n**AI Agent:** {reply}\n\n---\nSession ID: {}\nPage: {}",
        session.id,
        session.page_url.as_deref().unwrap_or("Unknown"),
    );
    let note = run_tool(
        state,
        &session.user_id,
        "hubspot_create_note",
        json!({
            "email": email,
            "subject": format!("Chat Conversation - {widget_name}"),
            "content": content,
        }),
        context,
    )
    .await;
    if !note.success {
        tracing::warn!(session_id = %session.id, "Failed to log chat to HubSpot: {}", note.summary());
    }
}

/// Everything behind the chat webhook, minus HTTP encoding.
pub async fn respond(state: &AppState, req: ChatRequest) -> Result<ChatReply, Rejection> {
    let text = filled(&req.message);
    let greeting = req.request_greeting;
    if req.widget_key.is_empty() || req.visitor_id.is_empty() || (text.is_none() && !greeting) {
        return Err(Rejection(
            StatusCode::BAD_REQUEST,
            "Missing required fields: widgetKey, visitorId, message",
        ));
    }

    let widget = match state.store.active_widget(&req.widget_key).await {
        Ok(Some(w)) => w,
        Ok(None) => {
            tracing::warn!(widget_key = %req.widget_key, "Widget not found or inactive");
            return Err(Rejection(StatusCode::NOT_FOUND, "Widget not found or inactive"));
        }
        Err(e) => {
            tracing::error!(widget_key = %req.widget_key, "Widget lookup failed: {e}");
            return Err(Rejection(StatusCode::NOT_FOUND, "Widget not found or inactive"));
        }
    };
    if !super::domain_allowed(&widget.allowed_domains, req.page_url.as_deref()) {
        tracing::warn!(widget_id = %widget.id, page = ?req.page_url, "Domain not allowed");
        return Err(Rejection(StatusCode::FORBIDDEN, "Domain not allowed"));
    }

    let (session, is_new) = session_for(state, &widget, &req).await?;
    let log_context = json!({ "session_id": session.id, "widget_id": widget.id });
    let hubspot = hubspot_connected(state, &widget.user_id).await;

    if is_new && hubspot {
        if let Some(email) = session.visitor_email.as_deref() {
            sync_visitor(state, &session, email, &log_context).await;
        }
    }

    let mut visitor_message_id = None;
    if let (Some(text), false) = (text.as_deref(), greeting) {
        let row = ChatMessage {
            id: String::new(),
            session_id: session.id.clone(),
            role: ChatRole::Visitor,
            content: text.to_string(),
            is_ai_generated: false,
            created_at: Utc::now(),
        };
        match state.store.insert_chat_message(&row).await {
            Ok(stored) => visitor_message_id = Some(stored.id),
            Err(e) => {
                tracing::error!(session_id = %session.id, "Failed to store visitor message: {e}");
                return Err(Rejection(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store message"));
            }
        }
    }

    let mut reply = ChatReply {
        success: true,
        session_id: session.id.clone(),
        message_id: visitor_message_id.clone(),
        ..Default::default()
    };

    if !greeting && session.ai_paused_until.is_some_and(|until| until > Utc::now()) {
        tracing::info!(session_id = %session.id, "AI paused for session");
        reply.ai_paused = Some(true);
        return Ok(reply);
    }

    let agent = match widget.agent_id.as_deref() {
        Some(id) => state.store.get_agent(id).await.unwrap_or_else(|e| {
            tracing::warn!(agent_id = id, "Failed to load widget agent: {e}");
            None
        }),
        None => None,
    };
    let Some(agent) = agent.filter(|a| a.is_active) else {
        tracing::info!(widget_id = %widget.id, "No active agent configured for widget");
        return Ok(reply);
    };

    let history = state
        .store
        .chat_history(&session.id, HISTORY_LIMIT)
        .await
        .unwrap_or_default();
    let system = ChatPrompt {
        system_prompt: agent.system_prompt.as_deref(),
        visitor_name: session.visitor_name.as_deref(),
        visitor_email: session.visitor_email.as_deref(),
        hubspot,
    }
    .build();

    let mut messages = vec![Message::system(system)];
    for m in history.iter().filter(|m| Some(&m.id) != visitor_message_id.as_ref()) {
        messages.push(match m.role {
            ChatRole::Visitor => Message::user(m.content.clone()),
            ChatRole::Agent => Message::assistant(m.content.clone()),
        });
    }
    messages.push(Message::user(match (greeting, text.as_deref()) {
        (false, Some(text)) => text,
        _ => GREETING_REQUEST,
    }));

    let tools = available_tools(state, &widget.user_id, hubspot).await;
    let answer = match converse(
        state,
        &widget.user_id,
        messages,
        tools,
        agent.llm_model.clone(),
        log_context.clone(),
    )
    .await
    {
        Ok(answer) => answer,
        Err(e) => {
            tracing::error!(session_id = %session.id, "Chat completion failed: {e}");
            reply.error = Some("AI temporarily unavailable".into());
            return Ok(reply);
        }
    };

    let agent_row = ChatMessage {
        id: String::new(),
        session_id: session.id.clone(),
        role: ChatRole::Agent,
        content: answer.clone(),
        is_ai_generated: true,
        created_at: Utc::now(),
    };
    match state.store.insert_chat_message(&agent_row).await {
        Ok(stored) => reply.ai_message_id = Some(stored.id),
        Err(e) => tracing::error!(session_id = %session.id, "Failed to store AI response: {e}"),
    }

    if let (Some(email), Some(text), false, true) = (session.visitor_email.as_deref(), text.as_deref(), greeting, hubspot) {
        log_exchange(state, &widget, &session, email, text, &answer, &log_context).await;
    }

    tracing::info!(session_id = %session.id, greeting, "Chat reply sent");
    reply.ai_response = Some(answer);
    reply.is_greeting = Some(greeting);
    Ok(reply)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    pub widget_key: String,
    pub visitor_id: String,
    #[serde(default)]
    pub after: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollReply {
    session_id: Option<String>,
    messages: Vec<ChatMessage>,
}

/// Handle GET /webhooks/chat: agent messages for the visitor's active
/// session newer than `after`. The widget polls this for replies sent
/// outside its own requests (e.g. by a human taking over).
pub async fn handle_poll(State(state): State<AppState>, Query(q): Query<PollQuery>) -> Response {
    let widget = match state.store.active_widget(&q.widget_key).await {
        Ok(Some(w)) => w,
        _ => return http::error(StatusCode::NOT_FOUND, "Widget not found or inactive"),
    };
    let session = match state.store.active_chat_session(&widget.id, &q.visitor_id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(widget_id = %widget.id, "Session lookup failed: {e}");
            return http::error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load session");
        }
    };
    let Some(session) = session else {
        return Json(PollReply {
            session_id: None,
            messages: Vec::new(),
        })
        .into_response();
    };

    let messages = state
        .store
        .chat_history(&session.id, POLL_LIMIT)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.role == ChatRole::Agent && q.after.map_or(true, |after| m.created_at > after))
        .collect();
    Json(PollReply {
        session_id: Some(session.id),
        messages,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FunctionCall, Role, ToolCall};
    use crate::models::{AgentConfig, UserIntegration};
    use crate::testing::{harness, Harness, ScriptedModel};
    use chrono::Duration;
    use mockito::Matcher;

    async fn seed(h: &Harness, domains: &[&str]) {
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        h.store
            .with(move |t| {
                t.widgets.push(ChatWidget {
                    id: "w1".into(),
                    user_id: "u1".into(),
                    agent_id: Some("a1".into()),
                    widget_key: "wk_live".into(),
                    name: Some("Site Chat".into()),
                    allowed_domains: domains,
                    is_active: true,
                });
                t.agents.push(AgentConfig {
                    id: "a1".into(),
                    user_id: "u1".into(),
                    is_active: true,
                    system_prompt: Some("You answer for Acme Boats.".into()),
                    ..Default::default()
                });
            })
            .await;
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            widget_key: "wk_live".into(),
            visitor_id: "v_1".into(),
            message: Some(message.into()),
            page_url: Some("https://www.acme.com/boats".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_unknown_widget_and_foreign_domain() {
        let h = harness(ScriptedModel::replying("hi"), "http://127.0.0.1:9");
        seed(&h, &["acme.com"]).await;

        let mut req = request("hello");
        req.widget_key = "wk_missing".into();
        assert_eq!(
            respond(&h.state, req).await.unwrap_err(),
            Rejection(StatusCode::NOT_FOUND, "Widget not found or inactive")
        );

        let mut req = request("hello");
        req.page_url = Some("https://evil.io/".into());
        assert_eq!(
            respond(&h.state, req).await.unwrap_err(),
            Rejection(StatusCode::FORBIDDEN, "Domain not allowed")
        );

        let mut req = request("");
        req.message = None;
        assert_eq!(respond(&h.state, req).await.unwrap_err().0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn conversation_reuses_session_and_history() {
        let h = harness(ScriptedModel::replying("Our boats start at $20k."), "http://127.0.0.1:9");
        seed(&h, &["acme.com"]).await;

        let first = respond(&h.state, request("How much?")).await.unwrap();
        assert_eq!(first.ai_response.as_deref(), Some("Our boats start at $20k."));
        assert_eq!(first.is_greeting, Some(false));
        assert!(first.ai_message_id.is_some());

        let second = respond(&h.state, request("Any discounts?")).await.unwrap();
        assert_eq!(second.session_id, first.session_id);

        let last = h.llm.requests().pop().unwrap();
        let roles: Vec<Role> = last.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(last.messages[3].text(), "Any discounts?");
        assert!(last.messages[0].text().contains("You answer for Acme Boats."));
        assert_eq!(h.store.with(|t| t.chat_messages.len()).await, 4);
    }

    #[tokio::test]
    async fn greeting_stores_no_visitor_message() {
        let h = harness(ScriptedModel::replying("Welcome aboard, Dana!"), "http://127.0.0.1:9");
        seed(&h, &[]).await;
        let req = ChatRequest {
            widget_key: "wk_live".into(),
            visitor_id: "v_2".into(),
            visitor_name: Some("Dana".into()),
            request_greeting: true,
            ..Default::default()
        };

        let reply = respond(&h.state, req).await.unwrap();
        assert_eq!(reply.message_id, None);
        assert_eq!(reply.is_greeting, Some(true));
        let prompt = h.llm.requests()[0].messages.clone();
        assert!(prompt[0].text().starts_with("IMPORTANT: You are chatting with Dana."));
        assert_eq!(prompt.last().unwrap().text(), GREETING_REQUEST);
        let stored = h.store.with(|t| t.chat_messages.clone()).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, ChatRole::Agent);
    }

    #[tokio::test]
    async fn paused_session_gets_no_reply() {
        let h = harness(ScriptedModel::replying("nope"), "http://127.0.0.1:9");
        seed(&h, &[]).await;
        respond(&h.state, request("first")).await.unwrap();
        h.store
            .with(|t| t.chat_sessions[0].ai_paused_until = Some(Utc::now() + Duration::minutes(30)))
            .await;

        let reply = respond(&h.state, request("hello?")).await.unwrap();
        assert_eq!(reply.ai_paused, Some(true));
        assert_eq!(reply.ai_response, None);
        assert!(reply.message_id.is_some());
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn inactive_agent_and_model_failure_return_null_reply() {
        let h = harness(ScriptedModel::failing(), "http://127.0.0.1:9");
        seed(&h, &[]).await;

        let reply = respond(&h.state, request("hi")).await.unwrap();
        assert_eq!(reply.ai_response, None);
        assert_eq!(reply.error.as_deref(), Some("AI temporarily unavailable"));

        h.store.with(|t| t.agents[0].is_active = false).await;
        let reply = respond(&h.state, request("hi again")).await.unwrap();
        assert_eq!(reply.ai_response, None);
        assert_eq!(reply.error, None);
        let body = serde_json::to_value(&reply).unwrap();
        assert!(body["aiResponse"].is_null());
        assert!(body.get("aiPaused").is_none());
    }

    #[tokio::test]
    async fn hubspot_visitor_is_synced_and_tool_calls_run() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hubspot/crm/v3/objects/contacts/search")
            .with_body(r#"{"results":[]}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/hubspot/crm/v3/objects/contacts")
            .match_body(Matcher::PartialJson(json!({
                "properties": { "email": "dana@fbi.gov", "firstname": "Dana", "lastname": "Scully" }
            })))
            .with_body(r#"{"id":"77","properties":{}}"#)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/hubspot/crm/v3/objects/notes")
            .with_status(404)
            .with_body(r#"{"message":"not found"}"#)
            .create_async()
            .await;

        let model = ScriptedModel::new(|req| {
            if req.messages.last().map(|m| m.role) == Some(Role::Tool) {
                return Ok(Message::assistant("You're all set, Dana."));
            }
            Ok(Message {
                role: Role::Assistant,
                content: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    kind: "function".into(),
                    function: FunctionCall {
                        name: "hubspot_create_contact".into(),
                        arguments: r#"{"email":"dana@fbi.gov","firstname":"Dana","lastname":"Scully"}"#.into(),
                    },
                }],
                tool_call_id: None,
            })
        });
        let h = harness(model, &server.url());
        seed(&h, &[]).await;
        h.store
            .with(|t| {
                t.integrations.push(UserIntegration {
                    id: "int-hs".into(),
                    user_id: "u1".into(),
                    provider: "hubspot".into(),
                    status: "connected".into(),
                    access_token: Some("hs".into()),
                    ..Default::default()
                })
            })
            .await;

        let mut req = request("Sign me up");
        req.visitor_name = Some("Dana Scully".into());
        req.visitor_email = Some("dana@fbi.gov".into());
        let reply = respond(&h.state, req).await.unwrap();
        assert_eq!(reply.ai_response.as_deref(), Some("You're all set, Dana."));
        create.assert_async().await;

        let request = &h.llm.requests()[0];
        assert!(request.tools.iter().any(|t| t.name == "hubspot_create_contact"));
        assert!(request.messages[0].text().contains("HUBSPOT INTEGRATION"));

        let logs = h.store.with(|t| t.tool_logs.clone()).await;
        let names: Vec<&str> = logs.iter().map(|l| l.tool_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["hubspot_search_contacts", "hubspot_create_contact", "hubspot_create_contact", "hubspot_create_note"]
        );
        assert_eq!(logs[1].context.as_ref().unwrap()["widget_id"], "w1");
    }

    #[tokio::test]
    async fn poll_returns_new_agent_messages() {
        let h = harness(ScriptedModel::replying("Hello!"), "http://127.0.0.1:9");
        seed(&h, &[]).await;
        let before = Utc::now() - Duration::seconds(1);
        respond(&h.state, request("hi")).await.unwrap();

        let resp = handle_poll(
            State(h.state.clone()),
            Query(PollQuery {
                widget_key: "wk_live".into(),
                visitor_id: "v_1".into(),
                after: Some(before),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"], "Hello!");
    }
}
