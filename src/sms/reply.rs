//! The agent's answer to one inbound text.

use chrono::Utc;

use crate::context::memory::{self, Exchange};
use crate::context::prompt::SmsPrompt;
use crate::context::knowledge;
use crate::compliance;
use crate::llm::{CompletionRequest, Message};
use crate::models::{AgentConfig, Direction, PiiStorage};
use crate::pii;
use crate::schedule;
use crate::sms::delivery::{self, Outgoing, Translation};
use crate::sms::notify::{self, SlackThread};
use crate::AppState;

pub const OFF_DUTY_REPLY: &str = "This Magpipe agent is currently off duty.";
pub const FALLBACK_REPLY: &str = "Hi! I'm Maggie, your AI assistant. Sorry, I'm having trouble processing your message right now. Please try again later.";

const HISTORY_LIMIT: usize = 6;
const KNOWLEDGE_LIMIT: usize = 3;
const MAX_REPLY_TOKENS: u32 = 150;

/// An inbound text as the reply pipeline sees it.
#[derive(Debug, Clone)]
pub struct InboundSms {
    pub user_id: String,
    /// The contact's number.
    pub from: String,
    /// The service number that was texted.
    pub to: String,
    pub body: String,
}

async fn send(state: &AppState, msg: Outgoing<'_>) {
    if let Err(e) = delivery::send_sms(state, msg).await {
        tracing::error!(to = msg.to, "Failed to send SMS: {e}");
    }
}

async fn history(state: &AppState, sms: &InboundSms) -> Vec<Message> {
    let recent = match state.store.recent_sms(&sms.user_id, &sms.from, HISTORY_LIMIT).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(from = %sms.from, "Failed to load SMS history: {e}");
            return Vec::new();
        }
    };
    recent
        .into_iter()
        .rev()
        .filter_map(|m| {
            let content = m.content.filter(|c| *c != sms.body)?;
            Some(match m.direction {
                Direction::Outbound => Message::assistant(content),
                Direction::Inbound => Message::user(content),
            })
        })
        .collect()
}

/// Decides whether to answer, builds the prompt, replies and runs the
/// follow-ups (Slack thread, translation, memory). Never fails; every
/// problem is logged.
pub async fn process_and_reply(
    state: &AppState,
    sms: &InboundSms,
    agent: Option<&AgentConfig>,
    thread: Option<&SlackThread>,
) {
    let store = state.store.as_ref();
    let to_is_us = state.area_codes.is_us_number(store, &sms.to).await;
    if to_is_us && compliance::is_opted_out(store, &sms.from).await {
        tracing::info!(from = %sms.from, "Sender opted out, not replying");
        return;
    }

    match store.find_thread_context(&sms.user_id, &sms.from, &sms.to).await {
        Ok(Some(ctx)) if ctx.is_paused_at(Utc::now()) => {
            tracing::info!(from = %sms.from, until = ?ctx.ai_paused_until, "AI paused for conversation");
            return;
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to check AI pause: {e}"),
    }

    let Some(agent) = agent else {
        tracing::info!(user_id = %sms.user_id, "No agent configured");
        return;
    };
    if !agent.is_active {
        tracing::info!(agent_id = %agent.id, "Agent inactive, not replying");
        return;
    }

    if let Some(hours) = &agent.texts_schedule {
        if !schedule::is_within_schedule(hours, agent.schedule_timezone.as_deref(), Utc::now()) {
            tracing::info!(agent_id = %agent.id, "Text outside scheduled hours");
            if let Some(forward_to) = agent.after_hours_sms_forwarding.as_deref().filter(|n| !n.is_empty()) {
                let forward = format!("After-hours SMS from {}: {}", sms.from, sms.body);
                send(state, Outgoing::notice(&sms.user_id, &sms.to, forward_to, &forward)).await;
            }
            send(state, Outgoing::notice(&sms.user_id, &sms.to, &sms.from, OFF_DUTY_REPLY)).await;
            return;
        }
    }

    let history = history(state, sms).await;
    let memory = if agent.memory_enabled {
        memory::contact_memory(store, &sms.user_id, &sms.from, agent).await
    } else {
        None
    };
    let similar = if agent.semantic_memory_enabled && memory.is_some() {
        memory::similar_memories(store, state.llm.as_ref(), &sms.user_id, &sms.from, agent).await
    } else {
        None
    };
    let kb = knowledge::search(
        store,
        state.llm.as_ref(),
        &agent.knowledge_source_ids,
        &sms.body,
        KNOWLEDGE_LIMIT,
    )
    .await;

    let system = SmsPrompt {
        language: &agent.language,
        system_prompt: agent.system_prompt.as_deref(),
        knowledge: kb.as_deref(),
        memory: memory.as_deref(),
        similar: similar.as_deref(),
        service_number: &sms.to,
        ongoing: !history.is_empty(),
    }
    .build();
    tracing::debug!(history = history.len(), "SMS prompt built");

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system));
    messages.extend(history);
    messages.push(Message::user(sms.body.as_str()));
    let request = CompletionRequest::new(messages)
        .max_tokens(MAX_REPLY_TOKENS)
        .model(agent.llm_model.clone());

    let reply = match state.llm.complete(request).await {
        Ok(m) if !m.text().trim().is_empty() => m.text().trim().to_string(),
        Ok(_) | Err(_) => {
            tracing::error!(agent_id = %agent.id, "No reply from model, sending fallback");
            send(state, Outgoing::reply(&sms.user_id, &sms.to, &sms.from, FALLBACK_REPLY)).await;
            return;
        }
    };
    tracing::info!(agent_id = %agent.id, "Reply generated");

    send(
        state,
        Outgoing::reply(&sms.user_id, &sms.to, &sms.from, &reply).with_pii(agent.pii_storage),
    )
    .await;

    if let Some(thread) = thread {
        let name = agent.name.as_deref().unwrap_or("AI Assistant");
        notify::reply_in_thread(&state.slack, thread, name, &reply).await;
    }

    if let Some(translate_to) = agent.translate_to.as_deref().filter(|t| !t.is_empty()) {
        let job = Translation {
            user_id: &sms.user_id,
            translate_to,
            contact_phone: &sms.from,
            service_number: &sms.to,
            inbound: &sms.body,
            outbound: &reply,
        };
        delivery::translate_and_cache(state, job, thread, agent.functions.as_ref()).await;
    }

    if agent.memory_enabled && agent.pii_storage != PiiStorage::Disabled {
        let (inbound, outbound) = if agent.pii_storage == PiiStorage::Redacted {
            (
                pii::redact(state.llm.as_ref(), &sms.body).await,
                pii::redact(state.llm.as_ref(), &reply).await,
            )
        } else {
            (sms.body.clone(), reply.clone())
        };
        let exchange = Exchange {
            contact_phone: &sms.from,
            service_number: &sms.to,
            inbound: &inbound,
            reply: &outbound,
        };
        if let Err(e) = memory::record_exchange(store, state.llm.as_ref(), &sms.user_id, agent, exchange).await {
            tracing::error!(from = %sms.from, "Failed to update SMS memory: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, Role};
    use crate::models::{ConversationContext, SmsMessage};
    use crate::schedule::DaySchedule;
    use crate::store::Store;
    use crate::testing::{harness, harness_with_config, ScriptedModel};

    const CONTACT: &str = "+14155550100";
    const SERVICE: &str = "+14155559999";

    fn inbound(body: &str) -> InboundSms {
        InboundSms {
            user_id: "u1".into(),
            from: CONTACT.into(),
            to: SERVICE.into(),
            body: body.into(),
        }
    }

    fn agent() -> AgentConfig {
        AgentConfig {
            id: "a1".into(),
            user_id: "u1".into(),
            system_prompt: Some("You answer for Acme Plumbing.".into()),
            ..Default::default()
        }
    }

    fn closed_all_week() -> crate::schedule::WeeklySchedule {
        ["monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"]
            .into_iter()
            .map(|d| {
                (
                    d.to_string(),
                    DaySchedule {
                        enabled: false,
                        start: String::new(),
                        end: String::new(),
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn replies_with_history_and_suffix() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying("We open at 9."), &server.url());
        for (from, to, direction, body, age) in [
            (CONTACT, SERVICE, Direction::Inbound, "Hi", 60),
            (SERVICE, CONTACT, Direction::Outbound, "Hello! How can I help?", 50),
            (CONTACT, SERVICE, Direction::Inbound, "When do you open?", 0),
        ] {
            h.store
                .insert_sms(&SmsMessage {
                    user_id: "u1".into(),
                    sender_number: from.into(),
                    recipient_number: to.into(),
                    direction,
                    content: Some(body.into()),
                    sent_at: Utc::now() - chrono::Duration::seconds(age),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        process_and_reply(&h.state, &inbound("When do you open?"), Some(&agent()), None).await;

        let sent = h.sms.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (SERVICE.into(), CONTACT.into(), "We open at 9.\n\nSTOP to opt out".into()));

        let request = &h.llm.requests()[0];
        assert_eq!(request.max_tokens, Some(150));
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(request.messages[1].text(), "Hi");
        assert_eq!(request.messages[3].text(), "When do you open?");
        let system = request.messages[0].text();
        assert!(system.starts_with("You answer for Acme Plumbing."));
        assert!(system.contains("ONGOING conversation"));
    }

    #[tokio::test]
    async fn campaign_routing_does_not_move_replies_off_the_texted_number() {
        let server = mockito::Server::new_async().await;
        let mut config = crate::config::Config::default();
        config.sms.use_campaign_number = true;
        let h = harness_with_config(config, ScriptedModel::replying("We open at 9."), &server.url());

        process_and_reply(&h.state, &inbound("When do you open?"), Some(&agent()), None).await;

        let sent = h.sms.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SERVICE);
        let rows = h.store.with(|t| t.sms.clone()).await;
        assert_eq!(rows[0].sender_number, SERVICE);
    }

    #[tokio::test]
    async fn pause_is_honored_until_it_expires() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying("ok"), &server.url());
        let paused = |until| ConversationContext {
            id: "c1".into(),
            contact_id: "k1".into(),
            user_id: "u1".into(),
            contact_phone: Some(CONTACT.into()),
            service_number: Some(SERVICE.into()),
            ai_paused_until: Some(until),
            ..Default::default()
        };

        h.store
            .with(|t| t.contexts.push(paused(Utc::now() + chrono::Duration::seconds(1))))
            .await;
        process_and_reply(&h.state, &inbound("hello?"), Some(&agent()), None).await;
        assert!(h.sms.sent().is_empty(), "paused conversation gets no reply");

        h.store
            .with(|t| t.contexts[0] = paused(Utc::now() - chrono::Duration::seconds(1)))
            .await;
        process_and_reply(&h.state, &inbound("hello?"), Some(&agent()), None).await;
        assert_eq!(h.sms.sent().len(), 1);
    }

    #[tokio::test]
    async fn opted_out_inactive_or_missing_agent_gets_nothing() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying("ok"), &server.url());

        process_and_reply(&h.state, &inbound("hi"), None, None).await;
        let mut inactive = agent();
        inactive.is_active = false;
        process_and_reply(&h.state, &inbound("hi"), Some(&inactive), None).await;

        compliance::record_opt_out(h.store.as_ref(), CONTACT).await.unwrap();
        process_and_reply(&h.state, &inbound("hi"), Some(&agent()), None).await;

        assert!(h.sms.sent().is_empty());
        assert_eq!(h.llm.calls(), 0);
    }

    #[tokio::test]
    async fn after_hours_forwards_and_goes_off_duty() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying("ok"), &server.url());
        let mut agent = agent();
        agent.texts_schedule = Some(closed_all_week());
        agent.after_hours_sms_forwarding = Some("+14155551234".into());

        process_and_reply(&h.state, &inbound("Pipe burst!"), Some(&agent), None).await;

        let sent = h.sms.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            (SERVICE.into(), "+14155551234".into(), format!("After-hours SMS from {CONTACT}: Pipe burst!"))
        );
        assert_eq!(sent[1], (SERVICE.into(), CONTACT.into(), OFF_DUTY_REPLY.into()));
        assert_eq!(h.llm.calls(), 0);
    }

    #[tokio::test]
    async fn model_failure_sends_fallback() {
        let server = mockito::Server::new_async().await;
        let h = harness(
            ScriptedModel::new(|_| Err(LlmError::Api("500: boom".into()))),
            &server.url(),
        );
        process_and_reply(&h.state, &inbound("hi"), Some(&agent()), None).await;
        let sent = h.sms.sent();
        assert_eq!(sent[0].2, format!("{FALLBACK_REPLY}\n\nSTOP to opt out"));
    }

    #[tokio::test]
    async fn memory_is_injected_and_updated() {
        let server = mockito::Server::new_async().await;
        let h = harness(
            ScriptedModel::routed(
                vec![("conversation topics", r#"["hours"]"#), ("relationship summaries", "Asks about hours.")],
                "We open at 9.",
            ),
            &server.url(),
        );
        let mut agent = agent();
        agent.memory_enabled = true;

        process_and_reply(&h.state, &inbound("When do you open?"), Some(&agent), None).await;
        process_and_reply(&h.state, &inbound("And Saturday?"), Some(&agent), None).await;

        let ctx = h.store.with(|t| t.contexts[0].clone()).await;
        assert_eq!(ctx.sms_interaction_count, 2);
        assert_eq!(ctx.key_topics, vec!["hours".to_string()]);

        let second_reply_prompt = h
            .llm
            .requests()
            .into_iter()
            .filter(|r| r.max_tokens == Some(150) && r.messages[0].text().contains("Acme"))
            .nth(1)
            .unwrap();
        assert!(second_reply_prompt.messages[0].text().contains("CONTACT MEMORY:"));
    }

    #[tokio::test]
    async fn disabled_pii_skips_memory() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying("ok"), &server.url());
        let mut agent = agent();
        agent.memory_enabled = true;
        agent.pii_storage = PiiStorage::Disabled;

        process_and_reply(&h.state, &inbound("hi"), Some(&agent), None).await;
        assert!(h.store.with(|t| t.contexts.is_empty()).await);
        let outbound = h.store.with(|t| t.sms[0].content.clone()).await;
        assert_eq!(outbound, None);
    }
}
