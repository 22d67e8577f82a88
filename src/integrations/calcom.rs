use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Cal.com API v2 client.
pub struct CalComClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub event_type_id: i64,
    pub title: String,
    pub start: DateTime<Utc>,
    pub duration_minutes: i64,
    pub attendee_name: String,
    pub attendee_email: Option<String>,
    pub attendee_phone: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub time_zone: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Booking {
    pub id: Value,
    pub uid: Option<String>,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendee_email: String,
    pub status: String,
}

#[derive(Deserialize)]
struct RawSlot {
    time: DateTime<Utc>,
}

impl BookingRequest {
    /// Cal.com requires an attendee email; callers without one get a
    /// placeholder derived from the name.
    pub fn attendee_email_or_placeholder(&self) -> String {
        match &self.attendee_email {
            Some(email) if !email.is_empty() => email.clone(),
            _ => {
                let local = self
                    .attendee_name
                    .to_lowercase()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(".");
                format!("{local}@placeholder.booking")
            }
        }
    }
}

impl CalComClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, CalendarError> {
        let resp = req
            .send()
            .await
            .map_err(|e| CalendarError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v["message"]
                        .as_str()
                        .or_else(|| v["error"]["message"].as_str())
                        .or_else(|| v["error"].as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("{status}: {body}"));
            return Err(CalendarError::Api(message));
        }
        resp.json().await.map_err(|e| CalendarError::Request(e.to_string()))
    }

    /// The account's first event type.
    pub async fn first_event_type(&self, token: &str) -> Result<i64, CalendarError> {
        let body = self
            .send(self.client.get(format!("{}/event-types", self.base_url)).bearer_auth(token))
            .await?;
        body["data"]
            .as_array()
            .and_then(|types| types.first())
            .and_then(|t| t["id"].as_i64())
            .ok_or(CalendarError::NoEventTypes)
    }

    pub async fn available_slots(
        &self,
        token: &str,
        event_type_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Result<Vec<Slot>, CalendarError> {
        let req = self
            .client
            .get(format!("{}/slots/available", self.base_url))
            .bearer_auth(token)
            .query(&[
                ("startTime", start.to_rfc3339()),
                ("endTime", end.to_rfc3339()),
                ("eventTypeId", event_type_id.to_string()),
                ("duration", duration_minutes.to_string()),
            ]);
        let body = self.send(req).await?;
        let raw: Vec<RawSlot> = serde_json::from_value(body["data"]["slots"].clone()).unwrap_or_default();
        Ok(raw
            .into_iter()
            .map(|s| Slot {
                start: s.time,
                end: s.time + Duration::minutes(duration_minutes),
            })
            .collect())
    }

    pub async fn create_booking(
        &self,
        token: &str,
        request: &BookingRequest,
    ) -> Result<Booking, CalendarError> {
        let email = request.attendee_email_or_placeholder();

        let mut responses = json!({ "name": request.attendee_name, "email": email });
        if let Some(phone) = &request.attendee_phone {
            responses["phone"] = json!(phone);
        }
        if let Some(notes) = &request.notes {
            responses["notes"] = json!(notes);
        }
        let mut metadata = json!({ "title": request.title, "source": "magpipe_agent" });
        if let Some(location) = &request.location {
            metadata["location"] = json!(location);
        }

        let payload = json!({
            "eventTypeId": request.event_type_id,
            "start": request.start.to_rfc3339(),
            "responses": responses,
            "metadata": metadata,
            "timeZone": request.time_zone,
            "language": "en",
        });

        let body = self
            .send(
                self.client
                    .post(format!("{}/bookings", self.base_url))
                    .bearer_auth(token)
                    .json(&payload),
            )
            .await?;

        let data = &body["data"];
        let start = data["startTime"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(request.start);

        tracing::info!(event_type_id = request.event_type_id, %start, "Cal.com booking created");
        Ok(Booking {
            id: data["id"].clone(),
            uid: data["uid"].as_str().map(str::to_string),
            title: request.title.clone(),
            start,
            end: start + Duration::minutes(request.duration_minutes),
            attendee_email: email,
            status: data["status"].as_str().unwrap_or("confirmed").to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("{0}")]
    Api(String),
    #[error("No event types found. Please create an event type in Cal.com first.")]
    NoEventTypes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;

    fn request() -> BookingRequest {
        BookingRequest {
            event_type_id: 7,
            title: "Consultation".into(),
            start: Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap(),
            duration_minutes: 30,
            attendee_name: "Mary Jane  Watson".into(),
            attendee_email: None,
            attendee_phone: Some("+14155550100".into()),
            location: None,
            notes: None,
            time_zone: "America/Los_Angeles".into(),
        }
    }

    #[test]
    fn placeholder_email_from_name() {
        assert_eq!(
            request().attendee_email_or_placeholder(),
            "mary.jane.watson@placeholder.booking"
        );
    }

    #[tokio::test]
    async fn slots_get_end_from_duration() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/slots/available")
            .match_query(Matcher::UrlEncoded("eventTypeId".into(), "7".into()))
            .with_body(r#"{"data":{"slots":[{"time":"2026-03-02T17:00:00Z"}]}}"#)
            .create_async()
            .await;

        let cal = CalComClient::new(&server.url());
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let slots = cal
            .available_slots("t", 7, start, start + Duration::days(1), 45)
            .await
            .unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].end - slots[0].start, Duration::minutes(45));
    }

    #[tokio::test]
    async fn booking_error_message_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/bookings")
            .with_status(400)
            .with_body(r#"{"status":"error","error":{"message":"no_available_users_found_error"}}"#)
            .create_async()
            .await;

        let err = CalComClient::new(&server.url())
            .create_booking("t", &request())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no_available_users_found_error");
    }

    #[tokio::test]
    async fn booking_sends_placeholder_email() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/bookings")
            .match_body(Matcher::PartialJson(json!({
                "eventTypeId": 7,
                "responses": {"email": "mary.jane.watson@placeholder.booking"}
            })))
            .with_body(r#"{"data":{"id":99,"uid":"bk_1","startTime":"2026-03-02T17:00:00.000Z"}}"#)
            .create_async()
            .await;

        let booking = CalComClient::new(&server.url())
            .create_booking("t", &request())
            .await
            .unwrap();
        assert_eq!(booking.uid.as_deref(), Some("bk_1"));
        assert_eq!(booking.status, "confirmed");
        mock.assert_async().await;
    }
}
