use serde::Deserialize;
use serde_json::{json, Value};

use super::integrations::{access_token, Access};
use super::{parse_args, ToolResponse};
use crate::integrations::slack::{OutgoingMessage, SlackChannel, SlackError};
use crate::AppState;

const PROVIDER: &str = "slack";
/// Slack bot tokens are issued for twelve hours.
const TOKEN_TTL_SECS: i64 = 43_200;
const CHANNEL_TYPES: &str = "public_channel,private_channel";
const CHANNEL_PAGE: u32 = 200;
const LISTED_PUBLIC: usize = 10;
const LISTED_PRIVATE: usize = 5;

async fn token(state: &AppState, user_id: &str) -> Result<String, ToolResponse> {
    let access = access_token(state, user_id, PROVIDER, TOKEN_TTL_SECS, |refresh| async move {
        state.slack.refresh_token(&refresh).await
    })
    .await;
    match access {
        Access::Token(token) => Ok(token),
        Access::NotConnected => Err(ToolResponse::fail(format!(
            "{PROVIDER} is not connected. Would you like me to help you connect it? Just say \"connect {PROVIDER}\"."
        ))),
        Access::Expired => Err(ToolResponse::fail(format!(
            "Your {PROVIDER} connection has expired. Please reconnect it in Settings."
        ))),
    }
}

#[derive(Deserialize)]
struct SendArgs {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    message: String,
}

pub(super) async fn send_message(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: SendArgs = match parse_args("slack_send_message", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let channel = args.channel.trim();
    if channel.is_empty() || args.message.trim().is_empty() {
        return ToolResponse::fail("Please specify both a channel and a message.");
    }
    let token = match token(state, user_id).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    // "#name" is resolved to an id; anything else is passed through.
    let mut channel_id = channel.to_string();
    if let Some(name) = channel.strip_prefix('#') {
        match state.slack.list_channels(&token, CHANNEL_TYPES, CHANNEL_PAGE).await {
            Ok(channels) => match channels.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
                Some(found) => channel_id = found.id.clone(),
                None => {
                    return ToolResponse::fail(format!(
                        "I couldn't find a channel called \"{channel}\". Try \"list Slack channels\" to see available channels."
                    ))
                }
            },
            Err(e) => tracing::warn!(user_id, "Channel lookup failed, posting to {channel} as given: {e}"),
        }
    }

    if let Err(e) = state.slack.join_channel(&token, &channel_id).await {
        tracing::debug!(user_id, channel = %channel_id, "Join skipped: {e}");
    }

    let message = OutgoingMessage {
        channel: channel_id,
        text: args.message,
        blocks: None,
        thread_ts: None,
    };
    match state.slack.post_message(&token, &message).await {
        Ok(posted) => {
            tracing::info!(user_id, channel = %posted.channel, "Slack message sent by agent tool");
            ToolResponse::ok(format!("Message sent to {channel}!"))
                .with_result(json!({ "channel": posted.channel, "timestamp": posted.ts }))
        }
        Err(SlackError::Slack(code)) if code == "channel_not_found" => ToolResponse::fail(
            "I couldn't find that channel. Make sure the channel exists and I have access to it.",
        ),
        Err(SlackError::Slack(code)) if code == "not_in_channel" => ToolResponse::fail(
            "I couldn't join that channel. It may be private - ask a channel admin to invite the Maggie app.",
        ),
        Err(SlackError::Slack(code)) => ToolResponse::fail(format!("Failed to send message: {code}")),
        Err(e) => {
            tracing::error!(user_id, "Slack post failed: {e}");
            ToolResponse::fail("Failed to send message to Slack. Please try again.")
        }
    }
}

fn bullet_list(channels: &[&SlackChannel], shown: usize, line: impl Fn(&SlackChannel) -> String) -> String {
    let mut out = channels
        .iter()
        .take(shown)
        .map(|c| line(c))
        .collect::<Vec<_>>()
        .join("\n");
    if channels.len() > shown {
        out.push_str(&format!("\n...and {} more", channels.len() - shown));
    }
    out
}

pub(super) async fn list_channels(state: &AppState, user_id: &str) -> ToolResponse {
    let token = match token(state, user_id).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let channels = match state.slack.list_channels(&token, CHANNEL_TYPES, CHANNEL_PAGE).await {
        Ok(channels) => channels,
        Err(SlackError::Slack(code)) => return ToolResponse::fail(format!("Failed to list channels: {code}")),
        Err(e) => {
            tracing::error!(user_id, "Slack channel list failed: {e}");
            return ToolResponse::fail("Failed to list Slack channels. Please try again.");
        }
    };
    if channels.is_empty() {
        return ToolResponse::ok(
            "I don't see any channels. Make sure the Maggie app has been added to your Slack workspace.",
        )
        .with_result(json!({ "channels": [] }));
    }

    let (private, public): (Vec<&SlackChannel>, Vec<&SlackChannel>) =
        channels.iter().partition(|c| c.is_private);
    let mut message = String::from("Here are your Slack channels:\n\n");
    if !public.is_empty() {
        message.push_str("Public channels:\n");
        message.push_str(&bullet_list(&public, LISTED_PUBLIC, |c| format!("• #{}", c.name)));
    }
    if !private.is_empty() {
        message.push_str("\n\nPrivate channels:\n");
        message.push_str(&bullet_list(&private, LISTED_PRIVATE, |c| format!("• 🔒 {}", c.name)));
    }
    message.push_str("\n\nYou can say \"send a message to #channel-name\" to post a message.");

    ToolResponse::ok(message).with_result(json!({ "channels": channels }))
}
