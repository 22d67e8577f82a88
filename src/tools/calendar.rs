use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{format_time, parse_args, parse_time, user_timezone, Mode, ToolResponse};
use crate::integrations::calcom::BookingRequest;
use crate::models::UserIntegration;
use crate::AppState;

const PROVIDER: &str = "cal_com";
const NOT_CONNECTED: &str = "Cal.com is not connected. Please connect your calendar in Settings → Apps.";
const LISTED_SLOTS: usize = 12;

fn default_duration() -> i64 {
    30
}

async fn calendar(state: &AppState, user_id: &str) -> Result<(UserIntegration, String), ToolResponse> {
    let integration = match state.store.integration(user_id, PROVIDER).await {
        Ok(Some(i)) => i,
        Ok(None) => return Err(ToolResponse::fail(NOT_CONNECTED)),
        Err(e) => {
            tracing::error!(user_id, "Calendar integration lookup failed: {e}");
            return Err(ToolResponse::fail(NOT_CONNECTED));
        }
    };
    match integration.access_token.clone().filter(|t| !t.is_empty()) {
        Some(token) => Ok((integration, token)),
        None => Err(ToolResponse::fail(NOT_CONNECTED)),
    }
}

async fn event_type(state: &AppState, integration: &UserIntegration, token: &str) -> Result<i64, ToolResponse> {
    let configured = integration
        .config
        .as_ref()
        .and_then(|c| c["default_event_type_id"].as_i64());
    if let Some(id) = configured {
        return Ok(id);
    }
    state
        .calcom
        .first_event_type(token)
        .await
        .map_err(|e| ToolResponse::fail(format!("Failed to check calendar: {e}")))
}

/// Midnight-to-midnight in `tz` for a `YYYY-MM-DD` (or full timestamp).
fn day_bounds(raw: &str, tz: Tz) -> Option<(NaiveDate, DateTime<Utc>, DateTime<Utc>)> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_time(raw, tz).map(|at| at.with_timezone(&tz).date_naive()))?;
    let start = tz.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).earliest()?;
    let start = start.with_timezone(&Utc);
    Some((date, start, start + Duration::days(1)))
}

#[derive(Deserialize)]
struct AvailabilityArgs {
    date: String,
    #[serde(default = "default_duration")]
    duration: i64,
}

pub(super) async fn availability(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: AvailabilityArgs = match parse_args("check_calendar_availability", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let tz = user_timezone(state, user_id).await;
    let Some((date, start, end)) = day_bounds(&args.date, tz) else {
        return ToolResponse::fail("Invalid date format");
    };
    let (integration, token) = match calendar(state, user_id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let event_type_id = match event_type(state, &integration, &token).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let slots = match state
        .calcom
        .available_slots(&token, event_type_id, start, end, args.duration)
        .await
    {
        Ok(slots) => slots,
        Err(e) => {
            tracing::error!(user_id, "Slot lookup failed: {e}");
            return ToolResponse::fail(format!("Failed to check calendar: {e}"));
        }
    };

    let day = date.format("%A, %B %-d");
    if slots.is_empty() {
        return ToolResponse::ok(format!("There are no open slots on {day}.")).with_result(json!({ "slots": [] }));
    }
    let lines: Vec<String> = slots
        .iter()
        .take(LISTED_SLOTS)
        .map(|s| format!("• {}", s.start.with_timezone(&tz).format("%-I:%M %p")))
        .collect();
    let mut message = format!("Here are the available slots on {day}:\n{}", lines.join("\n"));
    if slots.len() > LISTED_SLOTS {
        message.push_str(&format!("\n...and {} more", slots.len() - LISTED_SLOTS));
    }
    ToolResponse::ok(message).with_result(json!({ "slots": slots }))
}

#[derive(Deserialize)]
struct BookArgs {
    title: String,
    start_time: String,
    attendee_name: String,
    #[serde(default)]
    attendee_email: Option<String>,
    #[serde(default)]
    attendee_phone: Option<String>,
    #[serde(default = "default_duration")]
    duration: i64,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
}

pub(super) async fn book(state: &AppState, user_id: &str, args: &Value, mode: Mode) -> ToolResponse {
    let args: BookArgs = match parse_args("book_calendar_appointment", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let tz = user_timezone(state, user_id).await;
    let Some(start) = parse_time(&args.start_time, tz) else {
        return ToolResponse::fail("Invalid date format");
    };
    let when = format_time(start, tz);
    let location = args.location.filter(|l| !l.trim().is_empty());

    if mode == Mode::Preview {
        let at = location.as_deref().map(|l| format!(" at {l}")).unwrap_or_default();
        return ToolResponse::pending(
            "book_calendar_appointment",
            format!("Book \"{}\" with {} at {when}{at}?", args.title, args.attendee_name),
            json!({
                "title": args.title,
                "start": start.to_rfc3339(),
                "attendee_name": args.attendee_name,
                "attendee_email": args.attendee_email,
                "attendee_phone": args.attendee_phone,
                "duration": args.duration,
                "location": location,
                "notes": args.purpose,
            }),
        );
    }

    let (integration, token) = match calendar(state, user_id).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let event_type_id = match event_type(state, &integration, &token).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let request = BookingRequest {
        event_type_id,
        title: args.title,
        start,
        duration_minutes: args.duration,
        attendee_name: args.attendee_name,
        attendee_email: args.attendee_email,
        attendee_phone: args.attendee_phone,
        location,
        notes: args.purpose,
        time_zone: tz.name().to_string(),
    };
    match state.calcom.create_booking(&token, &request).await {
        Ok(booking) => ToolResponse::ok(format!(
            "Booked \"{}\" for {}. It's on your calendar!",
            booking.title,
            format_time(booking.start, tz)
        ))
        .with_result(serde_json::to_value(&booking).unwrap_or(Value::Null)),
        Err(e) => {
            tracing::error!(user_id, "Booking failed: {e}");
            ToolResponse::fail(format!("Failed to book appointment: {e}"))
        }
    }
}
