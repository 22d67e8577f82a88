use chrono::Utc;
use serde_json::json;

use crate::integrations::relay::NewMessageEvent;
use crate::integrations::slack::{OutgoingMessage, SlackClient};
use crate::AppState;

const PREFERRED_CHANNELS: [&str; 2] = ["pat-notifications", "general"];

/// The Slack message announcing an inbound text. Agent replies and
/// translations are posted in its thread.
#[derive(Debug, Clone, PartialEq)]
pub struct SlackThread {
    pub channel: String,
    pub ts: String,
    pub token: String,
}

fn quote(text: &str) -> String {
    format!(">{}", text.replace('\n', "\n>"))
}

/// Tells the notification relay about a new inbound text.
pub async fn notify_relay(state: &AppState, user_id: &str, sender: &str, body: &str) {
    let event = NewMessageEvent::sms(user_id, sender, body, Utc::now());
    if let Err(e) = state.relay.notify(&event).await {
        tracing::error!(user_id, "New-message notification failed: {e}");
    }
}

/// Posts the inbound text to the user's Slack workspace. `None` when Slack
/// is not connected or the post failed.
pub async fn notify_slack(state: &AppState, user_id: &str, sender: &str, body: &str) -> Option<SlackThread> {
    let store = state.store.as_ref();
    let integration = match store.integration(user_id, "slack").await {
        Ok(Some(i)) if i.is_connected() => i,
        Ok(_) => return None,
        Err(e) => {
            tracing::warn!(user_id, "Failed to load Slack integration: {e}");
            return None;
        }
    };
    let token = integration.access_token.clone()?;

    let sender_name = match store.find_contact_by_phone(user_id, sender).await {
        Ok(Some(contact)) => contact.name.unwrap_or_else(|| sender.to_string()),
        _ => sender.to_string(),
    };

    let configured = integration
        .config
        .as_ref()
        .and_then(|c| c["notification_channel"].as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let channel = match configured {
        Some(c) => c,
        None => match state.slack.list_channels(&token, "public_channel", 10).await {
            Ok(channels) => {
                let preferred = PREFERRED_CHANNELS
                    .iter()
                    .find_map(|name| channels.iter().find(|c| c.name == *name));
                match preferred.or(channels.first()) {
                    Some(c) => c.id.clone(),
                    None => {
                        tracing::info!(user_id, "No Slack channel available for notification");
                        return None;
                    }
                }
            }
            Err(e) => {
                tracing::error!(user_id, "Failed to list Slack channels: {e}");
                return None;
            }
        },
    };

    if let Err(e) = state.slack.join_channel(&token, &channel).await {
        tracing::debug!(%channel, "Could not join Slack channel: {e}");
    }

    let message = OutgoingMessage {
        channel: channel.clone(),
        text: format!("📱 New SMS from {sender_name}"),
        blocks: Some(json!([
            {
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("📱 *New SMS from {sender_name}*\n{}", quote(body))}
            },
            {
                "type": "context",
                "elements": [{
                    "type": "mrkdwn",
                    "text": format!("From: {sender} • {}", Utc::now().format("%b %-d, %Y %-I:%M %p UTC"))
                }]
            }
        ])),
        thread_ts: None,
    };
    match state.slack.post_message(&token, &message).await {
        Ok(posted) => {
            tracing::info!(user_id, ts = %posted.ts, "Slack notification sent");
            Some(SlackThread {
                channel,
                ts: posted.ts,
                token,
            })
        }
        Err(e) => {
            tracing::error!(user_id, "Slack notification failed: {e}");
            None
        }
    }
}

async fn post_in_thread(slack: &SlackClient, thread: &SlackThread, text: String, block: String) {
    let message = OutgoingMessage {
        channel: thread.channel.clone(),
        text,
        blocks: Some(json!([{"type": "section", "text": {"type": "mrkdwn", "text": block}}])),
        thread_ts: Some(thread.ts.clone()),
    };
    if let Err(e) = slack.post_message(&thread.token, &message).await {
        tracing::error!(channel = %thread.channel, "Slack thread reply failed: {e}");
    }
}

pub async fn reply_in_thread(slack: &SlackClient, thread: &SlackThread, agent_name: &str, reply: &str) {
    post_in_thread(
        slack,
        thread,
        format!("🤖 {agent_name} replied"),
        format!("🤖 *{agent_name} replied:*\n{}", quote(reply)),
    )
    .await;
}

pub async fn post_translation(slack: &SlackClient, thread: &SlackThread, translation: &str) {
    post_in_thread(
        slack,
        thread,
        format!("🌐 Translation: {translation}"),
        format!("🌐 *Translation:*\n{}", quote(translation)),
    )
    .await;
}
