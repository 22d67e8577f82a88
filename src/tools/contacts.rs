use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Mode, ToolResponse};
use crate::contacts::normalize_phone;
use crate::models::Contact;
use crate::AppState;

const LISTED: usize = 10;
const RETURNED: usize = 20;

/// Contacts whose name contains `identifier` (case-insensitive) or whose
/// phone contains its digits, when it has at least three.
pub(super) async fn find_contacts(state: &AppState, user_id: &str, identifier: &str) -> Vec<Contact> {
    let term = identifier.to_lowercase();
    let digits: String = identifier.chars().filter(|c| c.is_ascii_digit()).collect();
    let contacts = match state.store.list_contacts(user_id).await {
        Ok(contacts) => contacts,
        Err(e) => {
            tracing::error!(user_id, "Failed to load contacts: {e}");
            return Vec::new();
        }
    };
    contacts
        .into_iter()
        .filter(|c| {
            let by_name = c
                .name
                .as_deref()
                .is_some_and(|n| n.to_lowercase().contains(&term));
            let by_phone = digits.len() >= 3
                && c.phone_number.as_deref().is_some_and(|p| p.contains(&digits));
            by_name || by_phone
        })
        .collect()
}

fn contact_json(c: &Contact) -> Value {
    json!({ "id": c.id, "name": c.display_name(), "phone_number": c.phone_number })
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    search_term: Option<String>,
}

pub(super) async fn list(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: ListArgs = match parse_args("list_contacts", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let term = args.search_term.filter(|t| !t.trim().is_empty());

    let contacts = match &term {
        Some(term) => find_contacts(state, user_id, term).await,
        None => match state.store.list_contacts(user_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(user_id, "Failed to load contacts: {e}");
                return ToolResponse::fail("Failed to load contacts");
            }
        },
    };

    if contacts.is_empty() {
        let message = match term {
            Some(term) => format!("No contacts found matching \"{term}\"."),
            None => "You don't have any contacts yet. Would you like to add one?".to_string(),
        };
        return ToolResponse::ok(message).with_result(json!({ "contacts": [] }));
    }

    let mut message = String::from("Here are your contacts:\n");
    let lines: Vec<String> = contacts
        .iter()
        .take(LISTED)
        .map(|c| format!("• {}: {}", c.display_name(), c.phone_number.as_deref().unwrap_or("no phone")))
        .collect();
    message.push_str(&lines.join("\n"));
    if contacts.len() > LISTED {
        message.push_str(&format!("\n\n...and {} more", contacts.len() - LISTED));
    }

    let listed: Vec<Value> = contacts.iter().take(RETURNED).map(contact_json).collect();
    ToolResponse::ok(message).with_result(json!({ "contacts": listed }))
}

#[derive(Deserialize)]
struct AddArgs {
    name: String,
    phone_number: String,
    #[serde(default)]
    notes: Option<String>,
}

pub(super) async fn add(state: &AppState, user_id: &str, args: &Value, mode: Mode) -> ToolResponse {
    let args: AddArgs = match parse_args("add_contact", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let name = args.name.trim().to_string();
    let phone = normalize_phone(&args.phone_number);
    let notes = args.notes.filter(|n| !n.trim().is_empty());

    match state.store.find_contact_by_phone(user_id, &phone).await {
        Ok(Some(existing)) => {
            return ToolResponse::fail(format!(
                "A contact with that phone number already exists: {}. Would you like to update their information instead?",
                existing.display_name()
            ))
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(user_id, "Duplicate contact check failed: {e}"),
    }

    let parameters = json!({ "name": name, "phone_number": phone, "notes": notes });
    if mode == Mode::Preview {
        let suffix = notes.as_deref().map(|n| format!(" - {n}")).unwrap_or_default();
        return ToolResponse::pending("add_contact", format!("Add contact: {name} ({phone}){suffix}"), parameters);
    }

    let (first_name, last_name) = match name.split_once(' ') {
        Some((first, last)) => (Some(first.to_string()), Some(last.trim().to_string())),
        None => (Some(name.clone()), None),
    };
    let contact = Contact {
        user_id: user_id.to_string(),
        name: Some(name.clone()),
        first_name,
        last_name,
        phone_number: Some(phone),
        notes,
        ..Default::default()
    };
    match state.store.insert_contact(&contact).await {
        Ok(created) => {
            tracing::info!(user_id, contact_id = %created.id, "Contact added by agent");
            ToolResponse::ok(format!("Added {name} to your contacts.")).with_result(contact_json(&created))
        }
        Err(e) => {
            tracing::error!(user_id, "Failed to add contact: {e}");
            ToolResponse::fail(format!("Failed to add contact: {e}"))
        }
    }
}

/// Who a message or call goes to.
#[derive(Debug, Clone)]
pub(super) struct Recipient {
    pub contact_id: Option<String>,
    pub name: String,
    pub phone: String,
}

/// One contact matching `identifier`, or a bare number of at least ten
/// digits. Several matches ask the user to narrow it down to whom they'd
/// like to `verb`.
pub(super) async fn resolve_recipient(
    state: &AppState,
    user_id: &str,
    identifier: &str,
    verb: &str,
) -> Result<Recipient, ToolResponse> {
    let identifier = identifier.trim();
    let matches = find_contacts(state, user_id, identifier).await;
    match matches.as_slice() {
        [only] => Ok(Recipient {
            contact_id: Some(only.id.clone()),
            name: only.display_name().to_string(),
            phone: only.phone_number.clone().unwrap_or_default(),
        }),
        [] => {
            let digits = identifier.chars().filter(|c| c.is_ascii_digit()).count();
            if digits < 10 {
                return Err(ToolResponse::fail(format!(
                    "I couldn't find a contact matching \"{identifier}\". Try using their full name or phone number."
                )));
            }
            Ok(Recipient {
                contact_id: None,
                name: identifier.to_string(),
                phone: normalize_phone(identifier),
            })
        }
        many => {
            let lines: Vec<String> = many
                .iter()
                .map(|c| format!("• {}: {}", c.display_name(), c.phone_number.as_deref().unwrap_or("no phone")))
                .collect();
            Err(ToolResponse::fail(format!(
                "I found multiple contacts matching \"{identifier}\":\n{}\n\nPlease be more specific about who you'd like to {verb}.",
                lines.join("\n")
            ))
            .with_result(json!({ "contacts": many.iter().map(contact_json).collect::<Vec<_>>() })))
        }
    }
}

#[derive(Deserialize)]
struct CallArgs {
    contact_identifier: String,
    #[serde(default)]
    caller_id: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    goal: Option<String>,
}

/// Resolves who to call. Placing the call happens client-side after the
/// user confirms, so this tool only ever previews.
pub(super) async fn call(state: &AppState, user_id: &str, args: &Value) -> ToolResponse {
    let args: CallArgs = match parse_args("call_contact", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let to = match resolve_recipient(state, user_id, &args.contact_identifier, "call").await {
        Ok(to) => to,
        Err(resp) => return resp,
    };

    let mut preview = format!("Call {} at {}?", to.name, to.phone);
    if let Some(purpose) = args.purpose.as_deref().filter(|p| !p.is_empty()) {
        preview.push_str(&format!("\n\nPurpose: {purpose}"));
    }
    if let Some(goal) = args.goal.as_deref().filter(|g| !g.is_empty()) {
        preview.push_str(&format!("\nGoal: {goal}"));
    }
    ToolResponse::pending(
        "call_contact",
        preview,
        json!({
            "contact_id": to.contact_id,
            "contact_name": to.name,
            "phone_number": to.phone,
            "caller_id": args.caller_id,
            "purpose": args.purpose,
            "goal": args.goal,
        }),
    )
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    location: Option<String>,
}

pub(super) async fn search_business(state: &AppState, args: &Value) -> ToolResponse {
    let args: SearchArgs = match parse_args("search_business", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    if !state.places.is_configured() {
        return ToolResponse::fail("Business search is not configured");
    }
    let location = args.location.filter(|l| !l.trim().is_empty());
    let query = match &location {
        Some(loc) => format!("{} near {loc}", args.query),
        None => args.query.clone(),
    };

    let not_found = || {
        let near = location.as_deref().map(|l| format!(" near {l}")).unwrap_or_default();
        ToolResponse::fail(format!(
            "I couldn't find any businesses matching \"{}\"{near}. Try being more specific or adding a location.",
            args.query
        ))
    };

    let first = match state.places.text_search(&query).await {
        Ok(results) => match results.into_iter().next() {
            Some(first) => first,
            None => return not_found(),
        },
        Err(e) => {
            tracing::error!(%query, "Business search failed: {e}");
            return ToolResponse::fail("Business search failed. Please try again.");
        }
    };
    let details = match state.places.details(&first.place_id).await {
        Ok(Some(details)) => details,
        Ok(None) => return not_found(),
        Err(e) => {
            tracing::error!(place_id = %first.place_id, "Place details failed: {e}");
            return ToolResponse::fail("Business search failed. Please try again.");
        }
    };

    let address = details
        .formatted_address
        .clone()
        .or(first.formatted_address)
        .unwrap_or_default();
    let Some(phone) = details
        .international_phone_number
        .clone()
        .or(details.formatted_phone_number.clone())
    else {
        return ToolResponse::fail(format!(
            "I found {} at {address}, but they don't have a phone number listed.",
            details.name
        ));
    };

    let info = json!({
        "name": details.name,
        "phone": details.formatted_phone_number.clone().unwrap_or_else(|| phone.clone()),
        "phone_number": normalize_phone(&phone),
        "address": address,
        "website": details.website,
    });
    ToolResponse {
        business_info: Some(info),
        ..ToolResponse::ok(format!("I found {}:", details.name))
    }
}
