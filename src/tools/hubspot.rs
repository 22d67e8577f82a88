use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::integrations::{access_token, Access};
use super::{parse_args, ToolResponse};
use crate::integrations::hubspot::{ContactProperties, HubSpotContact, HubSpotError};
use crate::AppState;

const PROVIDER: &str = "hubspot";
const TOKEN_TTL_SECS: i64 = 1800;
const SEARCH_LIMIT: u32 = 10;

async fn token(state: &AppState, user_id: &str) -> Result<String, ToolResponse> {
    let access = access_token(state, user_id, PROVIDER, TOKEN_TTL_SECS, |refresh| async move {
        state.hubspot.refresh_token(&refresh).await
    })
    .await;
    match access {
        Access::Token(token) => Ok(token),
        Access::NotConnected => Err(ToolResponse::fail(
            "HubSpot is not connected. Please connect HubSpot in Settings → Apps.",
        )),
        Access::Expired => Err(ToolResponse::fail(
            "Your HubSpot connection has expired. Please reconnect it in Settings.",
        )),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn display_name(contact: &HubSpotContact) -> String {
    contact.full_name().unwrap_or_else(|| "Unknown".to_string())
}

fn contact_json(contact: &HubSpotContact) -> Value {
    json!({
        "id": contact.id,
        "email": contact.properties.email,
        "name": display_name(contact),
        "phone": contact.properties.phone,
        "company": contact.properties.company,
    })
}

#[derive(Deserialize)]
struct CreateContactArgs {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    firstname: Option<String>,
    #[serde(default)]
    lastname: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    company: Option<String>,
}

/// Creates the contact, or updates it when the email is already known.
pub(super) async fn create_contact(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: CreateContactArgs = match parse_args("hubspot_create_contact", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let Some(email) = non_empty(args.email) else {
        return ToolResponse::fail("Email is required to create a HubSpot contact.");
    };
    let token = match token(state, user_id).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let properties = ContactProperties {
        email: Some(email.clone()),
        firstname: non_empty(args.firstname),
        lastname: non_empty(args.lastname),
        phone: non_empty(args.phone),
        company: non_empty(args.company),
    };
    let existing = match state.hubspot.search_by_email(&token, &email).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(user_id, "HubSpot lookup before create failed: {e}");
            None
        }
    };

    if let Some(existing) = existing {
        return match state.hubspot.update_contact(&token, &existing.id, &properties).await {
            Ok(updated) => ToolResponse::ok(format!("Updated contact {email} in HubSpot."))
                .with_result(json!({ "contact_id": updated.id, "email": email, "updated": true })),
            Err(e) => ToolResponse::fail(format!("Failed to update HubSpot contact: {e}")),
        };
    }
    match state.hubspot.create_contact(&token, &properties).await {
        Ok(created) => {
            tracing::info!(user_id, contact_id = %created.id, "HubSpot contact created");
            ToolResponse::ok(format!("Created contact {email} in HubSpot."))
                .with_result(json!({ "contact_id": created.id, "email": email, "created": true }))
        }
        Err(HubSpotError::Conflict) => {
            ToolResponse::fail(format!("A contact with email {email} already exists in HubSpot."))
        }
        Err(HubSpotError::Request(e)) => {
            tracing::error!(user_id, "HubSpot create failed: {e}");
            ToolResponse::fail("Failed to create contact in HubSpot. Please try again.")
        }
        Err(e) => ToolResponse::fail(format!("Failed to create HubSpot contact: {e}")),
    }
}

#[derive(Deserialize)]
struct SearchArgs {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

pub(super) async fn search_contacts(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: SearchArgs = match parse_args("hubspot_search_contacts", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let Some(query) = non_empty(args.query) else {
        return ToolResponse::fail("Please provide a search query.");
    };
    let token = match token(state, user_id).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let contacts = match state
        .hubspot
        .search(&token, &query, args.limit.unwrap_or(SEARCH_LIMIT))
        .await
    {
        Ok(found) => found,
        Err(HubSpotError::Request(e)) => {
            tracing::error!(user_id, "HubSpot search failed: {e}");
            return ToolResponse::fail("Failed to search HubSpot. Please try again.");
        }
        Err(e) => return ToolResponse::fail(format!("Failed to search HubSpot: {e}")),
    };
    if contacts.is_empty() {
        return ToolResponse::ok(format!("No contacts found matching \"{query}\" in HubSpot."))
            .with_result(json!({ "contacts": [] }));
    }

    let lines: Vec<String> = contacts
        .iter()
        .map(|c| {
            let email = c.properties.email.as_deref().unwrap_or_default();
            let phone = c
                .properties
                .phone
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("• {} ({email}){phone}", display_name(c))
        })
        .collect();
    ToolResponse::ok(format!(
        "Found {} contact(s) in HubSpot:\n{}",
        contacts.len(),
        lines.join("\n")
    ))
    .with_result(json!({ "contacts": contacts.iter().map(contact_json).collect::<Vec<_>>() }))
}

#[derive(Deserialize)]
struct EmailArgs {
    #[serde(default)]
    email: Option<String>,
}

pub(super) async fn get_contact(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: EmailArgs = match parse_args("hubspot_get_contact", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let Some(email) = non_empty(args.email) else {
        return ToolResponse::fail("Please provide an email address.");
    };
    let token = match token(state, user_id).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match state.hubspot.search_by_email(&token, &email).await {
        Ok(Some(contact)) => {
            let phone = contact
                .properties
                .phone
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            let shown_email = contact.properties.email.clone().unwrap_or_else(|| email.clone());
            ToolResponse::ok(format!("Found contact: {} ({shown_email}){phone}", display_name(&contact)))
                .with_result(json!({ "found": true, "contact": contact_json(&contact) }))
        }
        Ok(None) => ToolResponse::ok(format!("No contact found with email {email} in HubSpot."))
            .with_result(json!({ "found": false })),
        Err(e) => {
            tracing::error!(user_id, "HubSpot contact lookup failed: {e}");
            ToolResponse::fail(format!("Failed to look up HubSpot contact: {e}"))
        }
    }
}

#[derive(Deserialize)]
struct NoteArgs {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    subject: Option<String>,
}

/// Adds a note to a contact and logs it as an SMS communication so the
/// contact's "last contacted" date moves.
pub(super) async fn create_note(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: NoteArgs = match parse_args("hubspot_create_note", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let Some(email) = non_empty(args.email) else {
        return ToolResponse::fail("Email is required to create a note for a HubSpot contact.");
    };
    let Some(content) = non_empty(args.content) else {
        return ToolResponse::fail("Note content is required.");
    };
    let token = match token(state, user_id).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let contact = match state.hubspot.search_by_email(&token, &email).await {
        Ok(Some(contact)) => contact,
        Ok(None) => {
            return ToolResponse::fail(format!(
                "No contact found with email {email} in HubSpot. Create the contact first."
            ))
        }
        Err(e) => {
            tracing::error!(user_id, "HubSpot contact lookup failed: {e}");
            return ToolResponse::fail("Failed to create note in HubSpot. Please try again.");
        }
    };

    let body = match non_empty(args.subject) {
        Some(subject) => format!("**{subject}**\n\n{content}"),
        None => content,
    };
    let now = Utc::now();
    let note_id = match state.hubspot.create_note(&token, &contact.id, &body, now).await {
        Ok(id) => id,
        Err(e) => return ToolResponse::fail(format!("Failed to create note in HubSpot: {e}")),
    };
    if let Err(e) = state.hubspot.log_sms_communication(&token, &contact.id, &body, now).await {
        tracing::warn!(user_id, contact_id = %contact.id, "Failed to log SMS communication: {e}");
    }

    let name = contact.full_name().unwrap_or_else(|| email.clone());
    ToolResponse::ok(format!("Created note for {name} in HubSpot.")).with_result(json!({
        "note_id": note_id,
        "contact_id": contact.id,
        "contact_email": email,
    }))
}
