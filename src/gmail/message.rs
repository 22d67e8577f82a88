//! Gmail message payloads: header lookup, body extraction and raw reply
//! encoding.

use std::sync::LazyLock;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::models::Direction;

/// Gmail bodies are base64url, sometimes padded and sometimes not.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const SYSTEM_SENDERS: &[&str] = &[
    "mailer-daemon",
    "noreply",
    "no-reply",
    "postmaster",
    "notifications@",
    "notification@",
    "systemgenerated",
];

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+@[^>]+)>").expect("valid regex"));
static BARE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\s<>]+@[^\s<>]+)").expect("valid regex"));
static TRAILING_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("valid regex"));

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: MessagePart,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl MessagePart {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// A message reduced to the fields stored per email.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEmail {
    pub gmail_message_id: String,
    pub thread_id: String,
    /// RFC 2822 `Message-ID`, used for threading replies.
    pub message_id_header: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub direction: Direction,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Bodies {
    pub text: String,
    pub html: String,
}

/// Splits a `From` header into address and display name.
pub fn parse_from(header: &str) -> (String, Option<String>) {
    if let Some(caps) = ANGLE_ADDRESS.captures(header) {
        let email = caps[1].trim().to_string();
        let name = header
            .split('<')
            .next()
            .unwrap_or_default()
            .replace('"', "")
            .trim()
            .to_string();
        return (email, (!name.is_empty()).then_some(name));
    }
    let email = BARE_ADDRESS
        .captures(header)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| header.trim().to_string());
    (email, None)
}

fn decode_data(data: &str) -> String {
    match BODY_ENGINE.decode(data.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::debug!("Undecodable body part: {e}");
            String::new()
        }
    }
}

/// Plain-text and HTML bodies, walking nested multipart parts. Deeper parts
/// win over shallower ones.
pub fn extract_body(part: &MessagePart) -> Bodies {
    let mut bodies = Bodies::default();
    if let Some(data) = &part.body.data {
        match part.mime_type.as_str() {
            "text/plain" => bodies.text = decode_data(data),
            "text/html" => bodies.html = decode_data(data),
            _ => {}
        }
    }
    for child in &part.parts {
        let nested = extract_body(child);
        if !nested.text.is_empty() {
            bodies.text = nested.text;
        }
        if !nested.html.is_empty() {
            bodies.html = nested.html;
        }
    }
    bodies
}

fn parse_date(header: &str) -> Option<DateTime<Utc>> {
    let cleaned = TRAILING_COMMENT.replace(header.trim(), "");
    DateTime::parse_from_rfc2822(&cleaned)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn internal_date(msg: &GmailMessage) -> Option<DateTime<Utc>> {
    let millis: i64 = msg.internal_date.as_deref()?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Reduces a full-format message. Outbound when the sender is the mailbox
/// itself or its send-as alias.
pub fn parse_message(msg: &GmailMessage, mailbox: &str, send_as: Option<&str>) -> ParsedEmail {
    let payload = &msg.payload;
    let (from_email, from_name) = parse_from(payload.header("From").unwrap_or_default());

    let is_ours = |addr: &str| {
        addr.eq_ignore_ascii_case(mailbox) || send_as.is_some_and(|s| addr.eq_ignore_ascii_case(s))
    };
    let direction = if is_ours(&from_email) {
        Direction::Outbound
    } else {
        Direction::Inbound
    };

    let bodies = extract_body(payload);
    let received_at = payload
        .header("Date")
        .and_then(parse_date)
        .or_else(|| internal_date(msg))
        .unwrap_or_else(Utc::now);

    ParsedEmail {
        gmail_message_id: msg.id.clone(),
        thread_id: msg.thread_id.clone(),
        message_id_header: payload.header("Message-ID").map(str::to_string),
        from_email,
        from_name,
        to: payload.header("To").unwrap_or_default().to_string(),
        subject: payload.header("Subject").unwrap_or_default().to_string(),
        body_text: bodies.text,
        body_html: (!bodies.html.is_empty()).then_some(bodies.html),
        direction,
        received_at,
    }
}

/// Bounces, no-reply senders and other automated mail.
pub fn is_system_email(from: &str) -> bool {
    let from = from.to_lowercase();
    SYSTEM_SENDERS.iter().any(|s| from.contains(s))
}

/// `Re: ` unless the subject already carries it.
pub fn reply_subject(subject: &str) -> String {
    if subject.starts_with("Re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

pub struct Reply<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub in_reply_to: Option<&'a str>,
    pub body: &'a str,
}

/// RFC 2822 text/plain message, base64url without padding as the `raw`
/// field of `messages.send` expects.
pub fn encode_reply(reply: &Reply<'_>) -> String {
    let mut lines = vec![
        format!("From: {}", reply.from),
        format!("To: {}", reply.to),
        format!("Subject: {}", reply.subject),
    ];
    if let Some(id) = reply.in_reply_to {
        lines.push(format!("In-Reply-To: {id}"));
        lines.push(format!("References: {id}"));
    }
    lines.push("Content-Type: text/plain; charset=UTF-8".to_string());
    let raw = format!("{}\r\n\r\n{}", lines.join("\r\n"), reply.body);
    URL_SAFE_NO_PAD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn b64(s: &str) -> String {
        URL_SAFE_NO_PAD.encode(s)
    }

    fn message(from: &str, parts: serde_json::Value) -> GmailMessage {
        serde_json::from_value(json!({
            "id": "m1",
            "threadId": "t1",
            "internalDate": "1767607200000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": from},
                    {"name": "To", "value": "support@acme.test"},
                    {"name": "Subject", "value": "Invoice question"},
                    {"name": "Message-ID", "value": "<abc@mail.example>"},
                    {"name": "Date", "value": "Mon, 5 Jan 2026 09:30:00 -0800 (PST)"}
                ],
                "parts": parts
            }
        }))
        .unwrap()
    }

    #[test]
    fn from_header_variants() {
        assert_eq!(
            parse_from("\"Dana Reyes\" <dana@example.com>"),
            ("dana@example.com".to_string(), Some("Dana Reyes".to_string()))
        );
        assert_eq!(parse_from("dana@example.com"), ("dana@example.com".to_string(), None));
        assert_eq!(parse_from("<dana@example.com>"), ("dana@example.com".to_string(), None));
    }

    #[test]
    fn nested_parts_are_decoded() {
        let msg = message(
            "Dana <dana@example.com>",
            json!([
                {"mimeType": "multipart/related", "parts": [
                    {"mimeType": "text/plain", "body": {"data": b64("Where is my invoice?")}},
                    {"mimeType": "text/html", "body": {"data": b64("<p>Where is my invoice?</p>")}}
                ]}
            ]),
        );
        let parsed = parse_message(&msg, "support@acme.test", None);
        assert_eq!(parsed.body_text, "Where is my invoice?");
        assert_eq!(parsed.body_html.as_deref(), Some("<p>Where is my invoice?</p>"));
        assert_eq!(parsed.direction, Direction::Inbound);
        assert_eq!(parsed.message_id_header.as_deref(), Some("<abc@mail.example>"));
        assert_eq!(parsed.received_at.to_rfc3339(), "2026-01-05T17:30:00+00:00");
    }

    #[test]
    fn padded_bodies_decode_too() {
        let part = MessagePart {
            mime_type: "text/plain".into(),
            body: PartBody {
                data: Some("aGk=".into()),
            },
            ..Default::default()
        };
        assert_eq!(extract_body(&part).text, "hi");
    }

    #[test]
    fn send_as_alias_is_outbound() {
        let msg = message("Team <hello@acme.test>", json!([]));
        let parsed = parse_message(&msg, "support@acme.test", Some("hello@acme.test"));
        assert_eq!(parsed.direction, Direction::Outbound);
    }

    #[test]
    fn system_senders() {
        assert!(is_system_email("MAILER-DAEMON@googlemail.com"));
        assert!(is_system_email("no-reply@service.example"));
        assert!(!is_system_email("dana@example.com"));
    }

    #[test]
    fn reply_is_threaded_and_unpadded() {
        assert_eq!(reply_subject("Invoice"), "Re: Invoice");
        assert_eq!(reply_subject("Re: Invoice"), "Re: Invoice");

        let raw = encode_reply(&Reply {
            from: "support@acme.test",
            to: "dana@example.com",
            subject: "Re: Invoice",
            in_reply_to: Some("<abc@mail.example>"),
            body: "Sent today.",
        });
        assert!(!raw.contains('='));
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(raw).unwrap()).unwrap();
        assert!(decoded.contains("In-Reply-To: <abc@mail.example>\r\nReferences: <abc@mail.example>"));
        assert!(decoded.ends_with("charset=UTF-8\r\n\r\nSent today."));
    }
}
