//! Gmail push notifications delivered through Cloud Pub/Sub.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::knowledge;
use crate::contacts;
use crate::credits::{self, Usage};
use crate::gmail::message::{self, ParsedEmail, Reply};
use crate::llm::{CompletionRequest, Message};
use crate::models::{AgentConfig, AgentEmailConfig, Direction, EmailAgentMode, EmailMessage, UserIntegration};
use crate::sentiment;
use crate::AppState;

const THREAD_CONTEXT_LIMIT: usize = 10;
const KNOWLEDGE_LIMIT: usize = 5;
const EXCERPT_CHARS: usize = 500;

const FALLBACK_EMAIL_PROMPT: &str = "You are a helpful email assistant. Draft a professional reply to the sender's email.
- Be warm but concise
- Address their question directly
- If unsure, say the team will follow up
- Sign off as \"Magpipe Team\"";

#[derive(Debug, Deserialize)]
pub struct PushQuery {
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    #[serde(default)]
    pub message: Option<PushMessage>,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    /// Standard base64 of the JSON notification.
    #[serde(default)]
    pub data: Option<String>,
}

/// Decoded Pub/Sub payload.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MailboxNotification {
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub history_id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, PartialEq, Default)]
pub struct PushOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configs_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_inbound: Option<usize>,
}

impl PushOutcome {
    fn skipped(reason: &'static str) -> Self {
        Self {
            skipped: Some(true),
            reason: Some(reason),
            ..Default::default()
        }
    }
}

pub fn decode_notification(envelope: &PushEnvelope) -> Option<MailboxNotification> {
    let data = envelope.message.as_ref()?.data.as_deref()?;
    let bytes = STANDARD.decode(data.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Handle POST /webhooks/gmail?secret=: Pub/Sub push for watched mailboxes.
///
/// Anything past the secret check answers 200 so Pub/Sub does not retry
/// permanent failures.
pub async fn handle_push(
    State(state): State<AppState>,
    Query(query): Query<PushQuery>,
    Json(envelope): Json<PushEnvelope>,
) -> Response {
    let expected = &state.config.google.pubsub_secret;
    if expected.is_empty() || query.secret.as_deref() != Some(expected.as_str()) {
        tracing::warn!("Invalid or missing Pub/Sub secret");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let Some(notification) = decode_notification(&envelope) else {
        tracing::warn!("Pub/Sub push without decodable data");
        return Json(PushOutcome::skipped("no_data")).into_response();
    };
    Json(process_notification(&state, notification).await).into_response()
}

pub async fn process_notification(state: &AppState, notification: MailboxNotification) -> PushOutcome {
    let Some(address) = notification.email_address.filter(|a| !a.is_empty()) else {
        return PushOutcome::skipped("no_email_address");
    };
    tracing::info!(email = %address, history_id = ?notification.history_id, "Gmail push notification");

    let configs = match state.store.email_configs_for(&address).await {
        Ok(c) if !c.is_empty() => c,
        Ok(_) => {
            tracing::info!(email = %address, "No active email config");
            return PushOutcome::skipped("no_config");
        }
        Err(e) => {
            tracing::error!(email = %address, "Failed to load email configs: {e}");
            return PushOutcome::skipped("no_config");
        }
    };

    let mut new_inbound = 0;
    for config in &configs {
        new_inbound += sync_mailbox(state, config).await;
    }

    PushOutcome {
        success: Some(true),
        email: Some(address),
        configs_processed: Some(configs.len()),
        new_inbound: Some(new_inbound),
        ..Default::default()
    }
}

async fn integration_for(state: &AppState, config: &AgentEmailConfig) -> Option<UserIntegration> {
    let found = match &config.integration_id {
        Some(id) => state.store.integration_by_id(id).await,
        None => state.store.integration(&config.user_id, "google_email").await,
    };
    match found {
        Ok(Some(i)) if i.is_connected() => Some(i),
        Ok(_) => {
            tracing::info!(config_id = %config.id, "No connected Gmail integration");
            None
        }
        Err(e) => {
            tracing::error!(config_id = %config.id, "Failed to load Gmail integration: {e}");
            None
        }
    }
}

async fn store_history_id(state: &AppState, config: &AgentEmailConfig, token: &str) {
    match state.gmail.latest_history_id(token).await {
        Ok(Some(id)) => {
            if let Err(e) = state.store.set_email_history_id(&config.id, &id).await {
                tracing::error!(config_id = %config.id, "Failed to store history id: {e}");
            }
        }
        Ok(None) => tracing::warn!(config_id = %config.id, "Mailbox profile has no history id"),
        Err(e) => tracing::error!(config_id = %config.id, "Failed to read history id: {e}"),
    }
}

/// Imports new mail for one config and answers new inbound messages.
/// Returns the number of new inbound messages.
async fn sync_mailbox(state: &AppState, config: &AgentEmailConfig) -> usize {
    let Some(integration) = integration_for(state, config).await else {
        return 0;
    };
    let token = match state.gmail.access_token(state.store.as_ref(), &integration).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(config_id = %config.id, "No Gmail access token: {e}");
            return 0;
        }
    };

    // First notification only sets the baseline; older mail is not imported
    let Some(start) = config.last_history_id.as_deref() else {
        store_history_id(state, config, &token).await;
        tracing::info!(config_id = %config.id, "Initial Gmail sync, history baseline stored");
        return 0;
    };

    let ids = match state.gmail.history_message_ids(&token, start).await {
        Ok(ids) => ids,
        Err(crate::gmail::GmailError::NotFound(_)) => {
            tracing::warn!(config_id = %config.id, "History id expired, listing recent messages");
            state.gmail.recent_message_ids(&token, 10).await.unwrap_or_default()
        }
        Err(e) => {
            tracing::error!(config_id = %config.id, "Failed to fetch Gmail history: {e}");
            Vec::new()
        }
    };
    tracing::info!(config_id = %config.id, count = ids.len(), "Fetched messages via push");

    let mut inbound = Vec::new();
    for id in ids {
        if let Some(parsed) = import_message(state, config, &token, &id).await {
            inbound.push(parsed);
        }
    }

    store_history_id(state, config, &token).await;

    if config.agent_mode == EmailAgentMode::Off {
        return inbound.len();
    }
    let agent = match state.store.get_agent(&config.agent_id).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::warn!(agent_id = %config.agent_id, "Failed to load email agent: {e}");
            None
        }
    };
    for email in &inbound {
        if already_answered(state, email).await {
            tracing::info!(thread_id = %email.thread_id, "Thread already has an AI reply, skipping");
            continue;
        }
        answer(state, config, agent.as_ref(), &token, email).await;
    }
    inbound.len()
}

/// Stores one message. Returns it when it is a new inbound email for the
/// agent to answer.
async fn import_message(
    state: &AppState,
    config: &AgentEmailConfig,
    token: &str,
    id: &str,
) -> Option<ParsedEmail> {
    let raw = match state.gmail.message(token, id).await {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(message_id = id, "Failed to fetch Gmail message: {e}");
            return None;
        }
    };
    let parsed = message::parse_message(&raw, &config.gmail_address, config.send_as_email.as_deref());

    if parsed.direction == Direction::Inbound {
        let to = parsed.to.to_lowercase();
        let to_us = std::iter::once(config.gmail_address.as_str())
            .chain(config.send_as_email.as_deref())
            .any(|addr| to.contains(&addr.to_lowercase()));
        if !to_us {
            return None;
        }
    }
    if message::is_system_email(&parsed.from_email) {
        tracing::info!(from = %parsed.from_email, "Skipping system email");
        return None;
    }
    match state.store.email_message_exists(&parsed.gmail_message_id).await {
        Ok(false) => {}
        Ok(true) => return None,
        Err(e) => {
            tracing::warn!(message_id = id, "Dedup check failed: {e}");
            return None;
        }
    }

    let inbound = parsed.direction == Direction::Inbound;
    let sentiment = if inbound {
        let text = if parsed.body_text.is_empty() { &parsed.subject } else { &parsed.body_text };
        Some(sentiment::analyze(state.llm.as_ref(), text).await)
    } else {
        None
    };

    let row = EmailMessage {
        user_id: config.user_id.clone(),
        agent_id: Some(config.agent_id.clone()),
        gmail_message_id: parsed.gmail_message_id.clone(),
        thread_id: parsed.thread_id.clone(),
        from_email: parsed.from_email.clone(),
        from_name: parsed.from_name.clone(),
        to_email: parsed.to.clone(),
        subject: parsed.subject.clone(),
        body_text: parsed.body_text.clone(),
        body_html: parsed.body_html.clone(),
        direction: parsed.direction,
        status: (if inbound { "delivered" } else { "sent" }).to_string(),
        is_read: !inbound,
        sentiment,
        sent_at: parsed.received_at,
        ..Default::default()
    };
    if let Err(e) = state.store.insert_email(&row).await {
        tracing::error!(message_id = id, "Failed to store email: {e}");
        return None;
    }
    if !inbound {
        return None;
    }

    let task_state = state.clone();
    let user_id = config.user_id.clone();
    let from_email = parsed.from_email.clone();
    let from_name = parsed.from_name.clone();
    tokio::spawn(async move {
        let store = task_state.store.as_ref();
        if let Err(e) =
            contacts::enrich_email_contact(store, &task_state.relay, &user_id, &from_email, from_name.as_deref()).await
        {
            tracing::error!(email = %from_email, "Email contact enrichment failed: {e}");
        }
        credits::charge(store, &task_state.config.pricing, &user_id, Usage::Email { count: 1 }).await;
    });
    Some(parsed)
}

async fn already_answered(state: &AppState, email: &ParsedEmail) -> bool {
    match state.store.email_thread(&email.thread_id, 50).await {
        Ok(rows) => rows.iter().any(|m| {
            m.direction == Direction::Outbound
                && (m.is_ai_generated || m.ai_draft.is_some())
                && m.sent_at >= email.received_at
        }),
        Err(e) => {
            tracing::warn!(thread_id = %email.thread_id, "Failed to check thread replies: {e}");
            false
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}

async fn email_prompt(state: &AppState, agent: Option<&AgentConfig>, email: &ParsedEmail) -> String {
    let mut prompt = agent.and_then(|a| a.system_prompt.clone()).unwrap_or_default();
    let name = agent.and_then(|a| a.name.as_deref()).unwrap_or("Magpipe Team");
    prompt.push_str(&format!(
        "\n\nYou are now responding to an email (not a phone call). Write a professional email reply.
- Be warm but concise
- Address the sender's question directly
- If you don't know the answer, say the team will follow up
- Never say the issue has \"already been addressed\" unless there is a clear prior reply
- Sign off as \"{name}\""
    ));

    if let Some(agent) = agent {
        let query = format!("{} {}", email.subject, excerpt(&email.body_text));
        if let Some(kb) = knowledge::search(
            state.store.as_ref(),
            state.llm.as_ref(),
            &agent.knowledge_source_ids,
            &query,
            KNOWLEDGE_LIMIT,
        )
        .await
        {
            prompt.push_str(&format!("\n\nRelevant knowledge base information:\n{kb}"));
        }
    }

    if prompt.trim().is_empty() {
        return FALLBACK_EMAIL_PROMPT.to_string();
    }
    prompt
}

async fn answer(
    state: &AppState,
    config: &AgentEmailConfig,
    agent: Option<&AgentConfig>,
    token: &str,
    email: &ParsedEmail,
) {
    let thread = state
        .store
        .email_thread(&email.thread_id, THREAD_CONTEXT_LIMIT)
        .await
        .unwrap_or_default();
    let has_reply = thread.iter().any(|m| m.direction == Direction::Outbound);
    let thread_context = thread
        .iter()
        .map(|m| {
            let direction = match m.direction {
                Direction::Inbound => "inbound",
                Direction::Outbound => "outbound",
            };
            let who = m.from_name.as_deref().unwrap_or(&m.from_email);
            format!("[{direction}] {who}: {}", excerpt(&m.body_text))
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let sender = email.from_name.as_deref().unwrap_or(&email.from_email);
    let mut user = format!(
        "Draft a reply to this email:\n\nFrom: {sender}\nSubject: {}\n\n{}",
        email.subject, email.body_text
    );
    if !thread_context.is_empty() {
        user.push_str(&format!("\n\nPrevious messages in thread:\n{thread_context}"));
    }
    if !has_reply {
        user.push_str("\n\nNote: No one has replied yet. This is the first response.");
    }

    let system = email_prompt(state, agent, email).await;
    let request = CompletionRequest::new(vec![Message::system(system), Message::user(user)])
        .temperature(0.3)
        .model(agent.and_then(|a| a.llm_model.clone()));
    let draft = match state.llm.complete(request).await {
        Ok(m) if !m.text().trim().is_empty() => m.text().trim().to_string(),
        Ok(_) => return,
        Err(e) => {
            tracing::error!(thread_id = %email.thread_id, "Email reply generation failed: {e}");
            return;
        }
    };

    let subject = message::reply_subject(&email.subject);
    match config.agent_mode {
        EmailAgentMode::Auto => {
            let send_from = config.send_as_email.as_deref().unwrap_or(&config.gmail_address);
            let fallback_id = format!("<{}@mail.gmail.com>", email.gmail_message_id);
            let raw = message::encode_reply(&Reply {
                from: send_from,
                to: &email.from_email,
                subject: &subject,
                in_reply_to: Some(email.message_id_header.as_deref().unwrap_or(&fallback_id)),
                body: &draft,
            });
            let sent_id = match state.gmail.send_raw(token, &raw, &email.thread_id).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(thread_id = %email.thread_id, "Failed to send Gmail reply: {e}");
                    return;
                }
            };
            let sentiment = sentiment::analyze(state.llm.as_ref(), &draft).await;
            let row = EmailMessage {
                user_id: config.user_id.clone(),
                agent_id: Some(config.agent_id.clone()),
                gmail_message_id: sent_id,
                thread_id: email.thread_id.clone(),
                from_email: send_from.to_string(),
                to_email: email.from_email.clone(),
                subject,
                body_text: draft,
                direction: Direction::Outbound,
                status: "sent".into(),
                is_ai_generated: true,
                is_read: true,
                sentiment: Some(sentiment),
                sent_at: Utc::now(),
                ..Default::default()
            };
            if let Err(e) = state.store.insert_email(&row).await {
                tracing::error!(thread_id = %email.thread_id, "Failed to store sent reply: {e}");
            }
            tracing::info!(thread_id = %email.thread_id, "Auto-sent AI email reply");
        }
        EmailAgentMode::Draft => {
            if let Err(e) = state.store.set_email_draft(&email.gmail_message_id, &draft).await {
                tracing::error!(thread_id = %email.thread_id, "Failed to store AI draft: {e}");
            } else {
                tracing::info!(thread_id = %email.thread_id, "Stored AI email draft");
            }
        }
        EmailAgentMode::Off => {}
    }
}
