use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::contacts::resolve_recipient;
use super::{format_time, parse_args, parse_time, user_timezone, Mode, ToolResponse};
use crate::compliance;
use crate::models::{Direction, ScheduledAction, SmsMessage};
use crate::AppState;

#[derive(Deserialize)]
struct SendArgs {
    recipient: String,
    message: String,
    #[serde(default)]
    sender_number: Option<String>,
}

pub(super) async fn send(state: &AppState, user_id: &str, args: &Value, mode: Mode) -> ToolResponse {
    let args: SendArgs = match parse_args("send_sms", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let to = match resolve_recipient(state, user_id, &args.recipient, "text").await {
        Ok(to) => to,
        Err(resp) => return resp,
    };
    let sender = args.sender_number.filter(|s| !s.is_empty());

    if mode == Mode::Preview {
        let target = if to.contact_id.is_some() {
            format!("{} ({})", to.name, to.phone)
        } else {
            to.name.clone()
        };
        return ToolResponse::pending(
            "send_sms",
            format!("Send to {target}: \"{}\"", args.message),
            json!({
                "contact_id": to.contact_id,
                "phone_number": to.phone,
                "name": to.name,
                "message": args.message,
                "sender_number": sender,
            }),
        );
    }

    let store = state.store.as_ref();
    // An explicit sender wins; otherwise US recipients may go out on the campaign number.
    let from = match sender {
        Some(from) => from,
        None => match store.first_service_number(user_id).await {
            Ok(Some(number)) => {
                state
                    .area_codes
                    .sender_number(store, &state.config.sms, &to.phone, &number.phone_number)
                    .await
            }
            Ok(None) => return ToolResponse::fail("No service number available to send from"),
            Err(e) => {
                tracing::error!(user_id, "Service number lookup failed: {e}");
                return ToolResponse::fail("No service number available to send from");
            }
        },
    };

    if state.area_codes.is_us_number(store, &to.phone).await && compliance::is_opted_out(store, &to.phone).await {
        return ToolResponse::fail(format!("{} has opted out of text messages.", to.name));
    }

    let sid = match state.sms.send_message(&from, &to.phone, &args.message).await {
        Ok(sid) => sid,
        Err(e) => {
            tracing::error!(user_id, to = %to.phone, "Agent SMS failed: {e}");
            return ToolResponse::fail(format!("SMS failed: {e}"));
        }
    };

    let row = SmsMessage {
        user_id: user_id.to_string(),
        sender_number: from,
        recipient_number: to.phone.clone(),
        direction: Direction::Outbound,
        content: Some(args.message),
        status: "sent".into(),
        sent_at: Utc::now(),
        is_ai_generated: false,
        signalwire_message_sid: Some(sid.clone()),
        ..Default::default()
    };
    if let Err(e) = store.insert_sms(&row).await {
        tracing::error!(user_id, "Failed to log agent SMS: {e}");
    }
    tracing::info!(user_id, to = %to.phone, %sid, "SMS sent by agent tool");
    ToolResponse::ok("Message sent successfully.").with_result(json!({ "message_sid": sid }))
}

#[derive(Deserialize)]
struct ScheduleArgs {
    recipient: String,
    message: String,
    send_at: String,
    #[serde(default)]
    sender_number: Option<String>,
}

pub(super) async fn schedule(state: &AppState, user_id: &str, args: &Value, mode: Mode) -> ToolResponse {
    let args: ScheduleArgs = match parse_args("schedule_sms", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let tz = user_timezone(state, user_id).await;
    let Some(send_at) = parse_time(&args.send_at, tz) else {
        return ToolResponse::fail("Invalid date format");
    };
    if send_at <= Utc::now() {
        return ToolResponse::fail("Scheduled time must be in the future");
    }
    let to = match resolve_recipient(state, user_id, &args.recipient, "text").await {
        Ok(to) => to,
        Err(resp) => return resp,
    };
    let when = format_time(send_at, tz);

    if mode == Mode::Preview {
        return ToolResponse::pending(
            "schedule_sms",
            format!("Schedule SMS to {} for {when}:\n\"{}\"", to.name, args.message),
            json!({
                "phone_number": to.phone,
                "name": to.name,
                "message": args.message,
                "send_at": send_at.to_rfc3339(),
            }),
        );
    }

    let action = ScheduledAction {
        id: String::new(),
        user_id: user_id.to_string(),
        action_type: "send_sms".into(),
        scheduled_at: send_at,
        status: "pending".into(),
        parameters: json!({
            "recipient_phone": to.phone,
            "recipient_name": to.name,
            "message": args.message,
            "sender_number": args.sender_number,
        }),
        created_via: Some("agent".into()),
    };
    match state.store.insert_scheduled_action(&action).await {
        Ok(saved) => ToolResponse::ok(format!("Scheduled SMS to {} for {when}.", to.name))
            .with_result(json!({ "scheduled_action_id": saved.id, "send_at": send_at.to_rfc3339() })),
        Err(e) => {
            tracing::error!(user_id, "Failed to schedule SMS: {e}");
            ToolResponse::fail(format!("Failed to schedule SMS: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::call;
    use super::*;
    use crate::models::{Contact, ServiceNumber};
    use crate::testing::{harness, harness_with_config, Harness, ScriptedModel};
    use chrono::Duration;

    async fn setup() -> Harness {
        let h = harness(ScriptedModel::replying(""), "http://127.0.0.1:9");
        h.store
            .with(|t| {
                t.service_numbers.push(ServiceNumber {
                    id: "sn1".into(),
                    phone_number: "+14155559999".into(),
                    user_id: "u1".into(),
                    is_active: true,
                    ..Default::default()
                });
                t.contacts.push(Contact {
                    id: "c1".into(),
                    user_id: "u1".into(),
                    name: Some("Dana Scully".into()),
                    phone_number: Some("+14155550100".into()),
                    ..Default::default()
                });
            })
            .await;
        h
    }

    #[tokio::test]
    async fn send_previews_without_sending() {
        let h = setup().await;
        let args = json!({ "recipient": "Dana", "message": "Running late" });

        let preview = call(&h.state, "send_sms", args.clone(), Mode::Preview).await;
        let action = preview.pending_action.unwrap();
        assert_eq!(action.preview, "Send to Dana Scully (+14155550100): \"Running late\"");
        assert!(h.sms.sent().is_empty());
        assert!(h.store.with(|t| t.sms.is_empty()).await);

        let done = call(&h.state, "send_sms", args, Mode::Execute).await;
        assert_eq!(done.message.as_deref(), Some("Message sent successfully."));
        assert_eq!(done.result.unwrap()["message_sid"], "SM1");
        assert_eq!(
            h.sms.sent(),
            vec![("+14155559999".to_string(), "+14155550100".to_string(), "Running late".to_string())]
        );
        let rows = h.store.with(|t| t.sms.clone()).await;
        assert!(!rows[0].is_ai_generated);
        assert_eq!(rows[0].recipient_number, action.parameters["phone_number"].as_str().unwrap());
    }

    #[tokio::test]
    async fn send_to_raw_number_and_opted_out() {
        let h = setup().await;
        let preview = call(
            &h.state,
            "send_sms",
            json!({ "recipient": "415-555-0177", "message": "hi" }),
            Mode::Preview,
        )
        .await;
        assert_eq!(preview.pending_action.unwrap().preview, "Send to 415-555-0177: \"hi\"");

        crate::compliance::record_opt_out(h.store.as_ref(), "+14155550100").await.unwrap();
        let resp = call(
            &h.state,
            "send_sms",
            json!({ "recipient": "Dana", "message": "hi" }),
            Mode::Execute,
        )
        .await;
        assert!(!resp.success);
        assert!(h.sms.sent().is_empty());
    }

    #[tokio::test]
    async fn agent_sends_use_campaign_number_for_us_recipients() {
        let mut config = crate::config::Config::default();
        config.sms.use_campaign_number = true;
        let h = harness_with_config(config, ScriptedModel::replying(""), "http://127.0.0.1:9");
        h.store
            .with(|t| {
                t.service_numbers.push(ServiceNumber {
                    id: "sn1".into(),
                    phone_number: "+14155559999".into(),
                    user_id: "u1".into(),
                    is_active: true,
                    ..Default::default()
                })
            })
            .await;

        call(
            &h.state,
            "send_sms",
            json!({ "recipient": "+14155550177", "message": "hi" }),
            Mode::Execute,
        )
        .await;
        call(
            &h.state,
            "send_sms",
            json!({ "recipient": "+14155550177", "message": "again", "sender_number": "+14155559999" }),
            Mode::Execute,
        )
        .await;

        let sent = h.sms.sent();
        assert_eq!(sent[0].0, "+16503912711");
        assert_eq!(sent[1].0, "+14155559999");
    }

    #[tokio::test]
    async fn send_needs_a_service_number() {
        let h = harness(ScriptedModel::replying(""), "http://127.0.0.1:9");
        let resp = call(
            &h.state,
            "send_sms",
            json!({ "recipient": "+14155550177", "message": "hi" }),
            Mode::Execute,
        )
        .await;
        assert_eq!(resp.message.as_deref(), Some("No service number available to send from"));
    }

    #[tokio::test]
    async fn schedule_validates_time_and_stores_action() {
        let h = setup().await;

        let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let resp = call(
            &h.state,
            "schedule_sms",
            json!({ "recipient": "Dana", "message": "hi", "send_at": past }),
            Mode::Execute,
        )
        .await;
        assert_eq!(resp.message.as_deref(), Some("Scheduled time must be in the future"));

        let resp = call(
            &h.state,
            "schedule_sms",
            json!({ "recipient": "Dana", "message": "hi", "send_at": "someday" }),
            Mode::Execute,
        )
        .await;
        assert_eq!(resp.message.as_deref(), Some("Invalid date format"));

        let later = (Utc::now() + Duration::days(1)).to_rfc3339();
        let args = json!({ "recipient": "Dana", "message": "Happy birthday!", "send_at": later });
        let preview = call(&h.state, "schedule_sms", args.clone(), Mode::Preview).await;
        assert!(preview
            .pending_action
            .unwrap()
            .preview
            .starts_with("Schedule SMS to Dana Scully for "));
        assert!(h.store.with(|t| t.scheduled_actions.is_empty()).await);

        let done = call(&h.state, "schedule_sms", args, Mode::Execute).await;
        assert!(done.message.unwrap().starts_with("Scheduled SMS to Dana Scully for "));
        let actions = h.store.with(|t| t.scheduled_actions.clone()).await;
        assert_eq!(actions[0].action_type, "send_sms");
        assert_eq!(actions[0].status, "pending");
        assert_eq!(actions[0].parameters["recipient_phone"], "+14155550100");
        assert_eq!(actions[0].created_via.as_deref(), Some("agent"));
    }
}
