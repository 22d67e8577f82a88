use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Form;
use chrono::Utc;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::compliance::{self, OPT_IN_CONFIRMATION, OPT_OUT_CONFIRMATION};
use crate::contacts;
use crate::credits::{self, Usage};
use crate::models::{AgentConfig, Direction, SmsMessage};
use crate::prefs::{self, Channel};
use crate::sentiment;
use crate::signalwire::EMPTY_LAML;
use crate::sms::delivery::{self, Outgoing};
use crate::sms::notify;
use crate::sms::reply::{self, InboundSms};
use crate::store::Store;
use crate::AppState;

/// Form fields SignalWire posts for an inbound message.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "MessageSid", default)]
    pub message_sid: String,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<String>,
}

/// Form fields of a call status callback.
#[derive(Debug, Clone, Deserialize)]
pub struct CallStatusUpdate {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: String,
    #[serde(rename = "CallDuration", default)]
    pub call_duration: Option<String>,
}

fn laml() -> Response {
    ([("Content-Type", "text/xml")], EMPTY_LAML).into_response()
}

/// Handle POST /webhooks/sms: SignalWire webhook for inbound texts.
///
/// Answers with empty LaML straight away; the reply is sent through the
/// REST API once the background work finishes.
pub async fn handle_sms(State(state): State<AppState>, Form(msg): Form<InboundMessage>) -> Response {
    receive(state, msg).await;
    laml()
}

async fn resolve_agent(store: &dyn Store, user_id: &str, assigned: Option<&str>) -> Option<AgentConfig> {
    if let Some(id) = assigned {
        match store.get_agent(id).await {
            Ok(Some(agent)) => return Some(agent),
            Ok(None) => tracing::warn!(agent_id = id, "Assigned agent not found"),
            Err(e) => tracing::warn!(agent_id = id, "Failed to load assigned agent: {e}"),
        }
    }
    match store.default_agent(user_id).await {
        Ok(Some(agent)) => return Some(agent),
        Ok(None) => {}
        Err(e) => tracing::warn!(user_id, "Failed to load default agent: {e}"),
    }
    match store.oldest_agent(user_id).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::warn!(user_id, "Failed to load any agent: {e}");
            None
        }
    }
}

/// Validates the destination number and starts background processing.
/// `None` when the number is unknown or inactive.
pub async fn receive(state: AppState, msg: InboundMessage) -> Option<JoinHandle<()>> {
    tracing::info!(
        from = %msg.from,
        to = %msg.to,
        sid = %msg.message_sid,
        media = msg.num_media.as_deref().unwrap_or("0"),
        "Inbound SMS"
    );

    let number = match state.store.active_service_number(&msg.to).await {
        Ok(Some(n)) => n,
        Ok(None) => {
            tracing::info!(to = %msg.to, "No active service number, ignoring");
            return None;
        }
        Err(e) => {
            tracing::error!(to = %msg.to, "Failed to look up service number: {e}");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        let inbound = InboundSms {
            user_id: number.user_id.clone(),
            from: msg.from,
            to: msg.to,
            body: msg.body,
        };
        process_inbound(&state, inbound, number.agent_id.as_deref()).await;
    }))
}

async fn process_inbound(state: &AppState, sms: InboundSms, assigned_agent: Option<&str>) {
    let store = state.store.as_ref();
    let agent = resolve_agent(store, &sms.user_id, assigned_agent).await;
    let sentiment = sentiment::analyze(state.llm.as_ref(), &sms.body).await;

    let row = SmsMessage {
        user_id: sms.user_id.clone(),
        agent_id: agent.as_ref().map(|a| a.id.clone()),
        sender_number: sms.from.clone(),
        recipient_number: sms.to.clone(),
        direction: Direction::Inbound,
        content: Some(sms.body.clone()),
        status: "sent".into(),
        sent_at: Utc::now(),
        sentiment: Some(sentiment),
        ..Default::default()
    };
    if let Err(e) = store.insert_sms(&row).await {
        tracing::error!(from = %sms.from, "Failed to log inbound SMS: {e}");
        reply::process_and_reply(state, &sms, agent.as_ref(), None).await;
        return;
    }
    tracing::info!(from = %sms.from, sentiment = sentiment.as_str(), "Inbound SMS logged");

    {
        let state = state.clone();
        let user_id = sms.user_id.clone();
        let from = sms.from.clone();
        tokio::spawn(async move {
            credits::charge(
                state.store.as_ref(),
                &state.config.pricing,
                &user_id,
                Usage::Sms {
                    count: 1,
                    ai_generated: false,
                },
            )
            .await;
            if let Err(e) = contacts::enrich_phone_contact(state.store.as_ref(), &state.relay, &user_id, &from).await {
                tracing::error!(%from, "Contact enrichment failed: {e}");
            }
        });
    }

    if state.area_codes.is_us_number(store, &sms.to).await {
        if compliance::is_opt_out_message(&sms.body) {
            if let Err(e) = compliance::record_opt_out(store, &sms.from).await {
                tracing::error!(from = %sms.from, "Failed to record opt-out: {e}");
            }
            confirm(state, &sms, OPT_OUT_CONFIRMATION).await;
            return;
        }
        if compliance::is_opt_in_message(&sms.body) {
            if let Err(e) = compliance::record_opt_in(store, &sms.from).await {
                tracing::error!(from = %sms.from, "Failed to record opt-in: {e}");
            }
            confirm(state, &sms, OPT_IN_CONFIRMATION).await;
            return;
        }
    }

    notify::notify_relay(state, &sms.user_id, &sms.from, &sms.body).await;

    let functions = agent.as_ref().and_then(|a| a.functions.as_ref());
    let thread = if prefs::should_notify(functions, "slack", Channel::Sms) {
        notify::notify_slack(state, &sms.user_id, &sms.from, &sms.body).await
    } else {
        None
    };

    reply::process_and_reply(state, &sms, agent.as_ref(), thread.as_ref()).await;
}

async fn confirm(state: &AppState, sms: &InboundSms, text: &str) {
    let notice = Outgoing::notice(&sms.user_id, &sms.to, &sms.from, text);
    if let Err(e) = delivery::send_sms(state, notice).await {
        tracing::error!(to = %sms.from, "Failed to send compliance confirmation: {e}");
    }
}

const TERMINAL_STATUSES: [&str; 4] = ["completed", "failed", "busy", "no-answer"];

/// Handle POST /webhooks/call-status: status callbacks for call records.
///
/// Always answers `OK`; vendors retry anything else.
pub async fn handle_call_status(
    State(state): State<AppState>,
    Form(update): Form<CallStatusUpdate>,
) -> &'static str {
    apply_call_status(&state, &update).await;
    "OK"
}

async fn apply_call_status(state: &AppState, update: &CallStatusUpdate) {
    let status = update.call_status.to_lowercase();
    tracing::info!(sid = %update.call_sid, %status, duration = ?update.call_duration, "Call status update");

    let mut call = match state.store.find_call_by_sid(&update.call_sid).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            tracing::warn!(sid = %update.call_sid, "No call record for status update");
            return;
        }
        Err(e) => {
            tracing::error!(sid = %update.call_sid, "Failed to load call record: {e}");
            return;
        }
    };

    let now = Utc::now();
    let duration = update
        .call_duration
        .as_deref()
        .and_then(|d| d.trim().parse::<i64>().ok());
    if status == "completed" {
        if let Some(secs) = duration {
            call.duration_seconds = Some(secs);
        }
        call.ended_at = Some(now);
        if call.sentiment.is_none() {
            if let Some(transcript) = call.transcript.as_deref() {
                let caller = sentiment::extract_caller_messages(transcript);
                call.sentiment = Some(sentiment::analyze(state.llm.as_ref(), &caller).await);
            }
        }
    } else if TERMINAL_STATUSES.contains(&status.as_str()) {
        call.ended_at = Some(now);
    }
    call.status = status;

    if let Err(e) = state.store.update_call(&call).await {
        tracing::error!(sid = %update.call_sid, "Failed to update call status: {e}");
    }
}
