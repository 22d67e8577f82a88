use chrono::Utc;

use crate::credits::{self, Usage};
use crate::llm::{CompletionRequest, Message};
use crate::models::{Direction, PiiStorage, SmsMessage};
use crate::pii;
use crate::prefs;
use crate::signalwire::SmsError;
use crate::sms::notify::{self, SlackThread};
use crate::AppState;

pub const OPT_OUT_SUFFIX: &str = "\n\nSTOP to opt out";

/// A text sent on the user's behalf from one of their service numbers.
#[derive(Debug, Clone, Copy)]
pub struct Outgoing<'a> {
    pub user_id: &'a str,
    /// The service number; replies always leave from the number that was
    /// texted.
    pub from: &'a str,
    pub to: &'a str,
    pub body: &'a str,
    /// Append [`OPT_OUT_SUFFIX`] when sending from a US number.
    pub opt_out_suffix: bool,
    /// How much of the body the outbound row keeps.
    pub pii: PiiStorage,
}

impl<'a> Outgoing<'a> {
    pub fn reply(user_id: &'a str, from: &'a str, to: &'a str, body: &'a str) -> Self {
        Self {
            user_id,
            from,
            to,
            body,
            opt_out_suffix: true,
            pii: PiiStorage::Enabled,
        }
    }

    /// Compliance confirmations and auto-replies, sent without the suffix.
    pub fn notice(user_id: &'a str, from: &'a str, to: &'a str, body: &'a str) -> Self {
        Self {
            opt_out_suffix: false,
            ..Self::reply(user_id, from, to, body)
        }
    }

    pub fn with_pii(mut self, pii: PiiStorage) -> Self {
        self.pii = pii;
        self
    }
}

/// Sends the text, then logs it as an AI-generated outbound message and
/// charges for it. Returns the vendor message sid.
pub async fn send_sms(state: &AppState, msg: Outgoing<'_>) -> Result<String, SmsError> {
    let store = state.store.as_ref();
    let body = if msg.opt_out_suffix && state.area_codes.is_us_number(store, msg.from).await {
        format!("{}{OPT_OUT_SUFFIX}", msg.body)
    } else {
        msg.body.to_string()
    };

    let sid = state.sms.send_message(msg.from, msg.to, &body).await?;
    tracing::info!(from = msg.from, to = msg.to, %sid, "Outbound SMS sent");

    let content = match msg.pii {
        PiiStorage::Enabled => Some(msg.body.to_string()),
        PiiStorage::Redacted => Some(pii::redact(state.llm.as_ref(), msg.body).await),
        PiiStorage::Disabled => None,
    };
    let row = SmsMessage {
        user_id: msg.user_id.to_string(),
        sender_number: msg.from.to_string(),
        recipient_number: msg.to.to_string(),
        direction: Direction::Outbound,
        content,
        status: "sent".into(),
        sent_at: Utc::now(),
        is_ai_generated: true,
        signalwire_message_sid: Some(sid.clone()),
        ..Default::default()
    };
    if let Err(e) = store.insert_sms(&row).await {
        tracing::error!(user_id = msg.user_id, "Failed to log outbound SMS: {e}");
    }

    credits::charge(
        store,
        &state.config.pricing,
        msg.user_id,
        Usage::Sms {
            count: 1,
            ai_generated: true,
        },
    )
    .await;
    Ok(sid)
}

fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "fr" => "French",
        "es" => "Spanish",
        "de" => "German",
        other => other,
    }
}

/// One exchange to translate, identified by its route.
#[derive(Debug, Clone, Copy)]
pub struct Translation<'a> {
    pub user_id: &'a str,
    /// `source-target`, e.g. `fr-en`. Only the target matters.
    pub translate_to: &'a str,
    pub contact_phone: &'a str,
    pub service_number: &'a str,
    pub inbound: &'a str,
    pub outbound: &'a str,
}

/// Translates both sides of an exchange, stores the translations on the
/// newest matching rows and, when the Slack translations switch is on,
/// posts the inbound translation into the notification thread.
pub async fn translate_and_cache(
    state: &AppState,
    job: Translation<'_>,
    thread: Option<&SlackThread>,
    functions: Option<&serde_json::Value>,
) {
    let target = job.translate_to.rsplit('-').next().unwrap_or("en");
    let target = if target.is_empty() { "en" } else { target };
    let system = format!(
        "Translate to {}. Return a JSON array with exactly 2 strings: translation of first text, then second text.",
        language_name(target)
    );
    let texts = serde_json::json!([job.inbound, job.outbound]).to_string();
    let request = CompletionRequest::new(vec![Message::system(system), Message::user(texts)]).max_tokens(500);

    let raw = match state.llm.complete(request).await {
        Ok(reply) => reply.text().trim().to_string(),
        Err(e) => {
            tracing::error!("Translation failed: {e}");
            return;
        }
    };
    let translations = match crate::llm::parse_string_array(&raw) {
        Some(t) if t.len() >= 2 => t,
        _ => {
            tracing::error!(reply = %raw, "Unusable translation reply");
            return;
        }
    };

    let store = state.store.as_ref();
    let routes = [
        (job.contact_phone, job.service_number, Direction::Inbound, &translations[0]),
        (job.service_number, job.contact_phone, Direction::Outbound, &translations[1]),
    ];
    for (sender, recipient, direction, text) in routes {
        match store
            .set_latest_sms_translation(job.user_id, sender, recipient, direction, text)
            .await
        {
            Ok(Some(id)) => tracing::debug!(%id, ?direction, "Translation cached"),
            Ok(None) => tracing::debug!(?direction, "No message to attach translation to"),
            Err(e) => tracing::error!(?direction, "Failed to cache translation: {e}"),
        }
    }

    let slack_on = prefs::app_prefs(functions, "slack").translations;
    if let Some(thread) = thread.filter(|_| slack_on && !translations[0].is_empty()) {
        notify::post_translation(&state.slack, thread, &translations[0]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{harness, harness_with_config, ScriptedModel};

    #[tokio::test]
    async fn us_reply_gets_suffix_and_is_logged() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying("[REDACTED] asked"), &server.url());

        let msg = Outgoing::reply("u1", "+14155559999", "+14155550100", "Dana, see you at 5")
            .with_pii(PiiStorage::Redacted);
        let sid = send_sms(&h.state, msg).await.unwrap();
        assert_eq!(sid, "SM1");

        let sent = h.sms.sent();
        assert_eq!(sent[0].2, "Dana, see you at 5\n\nSTOP to opt out");

        let rows = h.store.with(|t| t.sms.clone()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content.as_deref(), Some("[REDACTED] asked"));
        assert_eq!(rows[0].direction, Direction::Outbound);
        assert!(rows[0].is_ai_generated);

        let deductions = h.store.with(|t| t.deductions.clone()).await;
        assert!((deductions[0].1 - 0.015).abs() < 1e-9);
    }

    #[tokio::test]
    async fn notices_and_foreign_numbers_skip_suffix() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying(""), &server.url());

        send_sms(&h.state, Outgoing::notice("u1", "+14155559999", "+14155550100", "Off duty."))
            .await
            .unwrap();
        send_sms(
            &h.state,
            Outgoing::reply("u1", "+447700900123", "+447700900456", "Hello").with_pii(PiiStorage::Disabled),
        )
        .await
        .unwrap();

        let sent = h.sms.sent();
        assert_eq!(sent[0].2, "Off duty.");
        assert_eq!(sent[1].2, "Hello");
        let rows = h.store.with(|t| t.sms.clone()).await;
        assert_eq!(rows[1].content, None, "disabled storage keeps no content");
    }

    #[tokio::test]
    async fn replies_leave_from_texted_number_with_campaign_routing() {
        let mut config = crate::config::Config::default();
        config.sms.use_campaign_number = true;
        let h = harness_with_config(config, ScriptedModel::replying(""), "http://127.0.0.1:9");

        send_sms(&h.state, Outgoing::reply("u1", "+14155559999", "+14155550100", "Hi"))
            .await
            .unwrap();
        send_sms(&h.state, Outgoing::notice("u1", "+14155559999", "+14155550100", "Opted out."))
            .await
            .unwrap();

        let sent = h.sms.sent();
        assert!(sent.iter().all(|(from, _, _)| from == "+14155559999"));
        assert_eq!(sent[0].2, "Hi\n\nSTOP to opt out");
        let rows = h.store.with(|t| t.sms.clone()).await;
        assert!(rows.iter().all(|r| r.sender_number == "+14155559999"));
    }

    #[tokio::test]
    async fn translations_land_on_latest_rows() {
        let server = mockito::Server::new_async().await;
        let h = harness(ScriptedModel::replying(r#"["Hello", "Hi there"]"#), &server.url());
        for (from, to, direction, body) in [
            ("+14155550100", "+14155559999", Direction::Inbound, "Bonjour"),
            ("+14155559999", "+14155550100", Direction::Outbound, "Salut"),
        ] {
            h.store
                .insert_sms(&SmsMessage {
                    user_id: "u1".into(),
                    sender_number: from.into(),
                    recipient_number: to.into(),
                    direction,
                    content: Some(body.into()),
                    sent_at: Utc::now(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let job = Translation {
            user_id: "u1",
            translate_to: "fr-en",
            contact_phone: "+14155550100",
            service_number: "+14155559999",
            inbound: "Bonjour",
            outbound: "Salut",
        };
        translate_and_cache(&h.state, job, None, None).await;

        let rows = h.store.with(|t| t.sms.clone()).await;
        assert_eq!(rows[0].translation.as_deref(), Some("Hello"));
        assert_eq!(rows[1].translation.as_deref(), Some("Hi there"));
        let system = h.llm.requests()[0].messages[0].text().to_string();
        assert!(system.starts_with("Translate to English."));
    }
}
