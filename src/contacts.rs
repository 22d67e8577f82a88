//! Phone normalization and automatic contact creation for new senders.

use chrono::Utc;

use crate::integrations::relay::{LookupContact, LookupKey, RelayClient};
use crate::models::Contact;
use crate::store::{Store, StoreError};

/// Digits only, `+1` for ten-digit numbers, `+` otherwise.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 {
        format!("+1{digits}")
    } else {
        format!("+{digits}")
    }
}

/// Keeps numbers that already carry a `+`; strips everything else to digits.
pub fn to_e164(raw: &str) -> String {
    if raw.starts_with('+') {
        raw.to_string()
    } else {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        format!("+{digits}")
    }
}

fn split_name(name: &str) -> (Option<String>, Option<String>) {
    let mut parts = name.split_whitespace();
    let first = parts.next().map(str::to_string);
    let rest: Vec<&str> = parts.collect();
    (first, (!rest.is_empty()).then(|| rest.join(" ")))
}

async fn lookup(relay: &RelayClient, key: LookupKey<'_>) -> Option<LookupContact> {
    match relay.lookup_contact(key).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(?key, "Contact lookup failed: {e}");
            None
        }
    }
}

fn apply_profile(contact: &mut Contact, found: LookupContact) {
    contact.address = found.address;
    contact.company = found.company;
    contact.job_title = found.job_title;
    contact.avatar_url = found.avatar_url;
    contact.linkedin_url = found.linkedin_url;
    contact.twitter_url = found.twitter_url;
    contact.facebook_url = found.facebook_url;
    contact.enriched_at = Some(Utc::now());
}

/// Creates a contact for a phone number the user has not seen before,
/// filled from the lookup endpoint when it knows the number. Returns the
/// created contact, `None` when one already existed.
pub async fn enrich_phone_contact(
    store: &dyn Store,
    relay: &RelayClient,
    user_id: &str,
    phone: &str,
) -> Result<Option<Contact>, StoreError> {
    let phone = to_e164(phone);
    if store.find_contact_by_phone(user_id, &phone).await?.is_some() {
        tracing::debug!(%phone, "Contact already exists");
        return Ok(None);
    }

    let mut contact = Contact {
        user_id: user_id.to_string(),
        phone_number: Some(phone.clone()),
        ..Default::default()
    };
    match lookup(relay, LookupKey::Phone(&phone)).await {
        Some(found) => {
            let (split_first, split_last) = found.name.as_deref().map(split_name).unwrap_or_default();
            let first = found.first_name.clone().or(split_first).unwrap_or_else(|| "Unknown".into());
            let last = found.last_name.clone().or(split_last);
            let full = found.name.clone().unwrap_or_else(|| match &last {
                Some(last) => format!("{first} {last}"),
                None => first.clone(),
            });
            contact.name = Some(full);
            contact.first_name = Some(first);
            contact.last_name = last;
            contact.email = found.email.clone();
            apply_profile(&mut contact, found);
            tracing::info!(%phone, "Creating enriched contact");
        }
        None => {
            contact.name = Some("Unknown".into());
            contact.first_name = Some("Unknown".into());
            tracing::info!(%phone, "No enrichment data, creating basic contact");
        }
    }
    store.insert_contact(&contact).await.map(Some)
}

/// Email counterpart of [`enrich_phone_contact`]. Without lookup data the
/// name comes from the `From` display name, else the address local part.
pub async fn enrich_email_contact(
    store: &dyn Store,
    relay: &RelayClient,
    user_id: &str,
    email: &str,
    from_name: Option<&str>,
) -> Result<Option<Contact>, StoreError> {
    let email = email.trim().to_lowercase();
    if store.find_contact_by_email(user_id, &email).await?.is_some() {
        tracing::debug!(%email, "Contact already exists");
        return Ok(None);
    }

    let local_part = email.split('@').next().unwrap_or_default().to_string();
    let (name_first, name_last) = from_name.map(split_name).unwrap_or_default();

    let mut contact = Contact {
        user_id: user_id.to_string(),
        email: Some(email.clone()),
        ..Default::default()
    };
    match lookup(relay, LookupKey::Email(&email)).await {
        Some(found) => {
            let first = found.first_name.clone().or(name_first).unwrap_or(local_part);
            let last = found.last_name.clone().or(name_last);
            let full = found.name.clone().unwrap_or_else(|| match &last {
                Some(last) => format!("{first} {last}"),
                None => first.clone(),
            });
            contact.name = Some(full);
            contact.first_name = Some(first);
            contact.last_name = last;
            contact.phone_number = found.phone.clone();
            apply_profile(&mut contact, found);
            tracing::info!(%email, "Creating enriched email contact");
        }
        None => {
            let first = name_first.unwrap_or(local_part);
            contact.name = Some(from_name.map(str::to_string).unwrap_or_else(|| first.clone()));
            contact.first_name = Some(first);
            contact.last_name = name_last;
            tracing::info!(%email, "No enrichment data, creating basic email contact");
        }
    }
    store.insert_contact(&contact).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationsConfig;
    use crate::store::memory::MemoryStore;

    fn no_lookup() -> RelayClient {
        RelayClient::new(&NotificationsConfig::default(), "svc")
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("(415) 555-0100"), "+14155550100");
        assert_eq!(normalize_phone("+44 7700 900123"), "+447700900123");
        assert_eq!(to_e164("+14155550100"), "+14155550100");
        assert_eq!(to_e164("1 415 555 0100"), "+14155550100");
    }

    #[tokio::test]
    async fn unknown_number_gets_basic_contact_once() {
        let store = MemoryStore::default();
        let created = enrich_phone_contact(&store, &no_lookup(), "u1", "14155550100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.phone_number.as_deref(), Some("+14155550100"));
        assert_eq!(created.display_name(), "Unknown");
        assert!(created.enriched_at.is_none());

        let again = enrich_phone_contact(&store, &no_lookup(), "u1", "+14155550100")
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.list_contacts("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lookup_data_fills_the_contact() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/lookup")
            .with_body(r#"{"success":true,"contact":{"name":"Dana Q Reyes","company":"Acme","phone":"+14155550100"}}"#)
            .create_async()
            .await;
        let relay = RelayClient::new(
            &NotificationsConfig {
                relay_url: None,
                contact_lookup_url: Some(format!("{}/lookup", server.url())),
            },
            "svc",
        );

        let store = MemoryStore::default();
        let created = enrich_email_contact(&store, &relay, "u1", " Dana@Example.com ", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.email.as_deref(), Some("dana@example.com"));
        assert_eq!(created.name.as_deref(), Some("Dana Q Reyes"));
        assert_eq!(created.first_name.as_deref(), Some("dana"), "no From name, so the local part");
        assert_eq!(created.company.as_deref(), Some("Acme"));
        assert_eq!(created.phone_number.as_deref(), Some("+14155550100"));
        assert!(created.enriched_at.is_some());
    }

    #[tokio::test]
    async fn email_contact_falls_back_to_from_name_or_local_part() {
        let store = MemoryStore::default();
        let named = enrich_email_contact(&store, &no_lookup(), "u1", "dana@example.com", Some("Dana Reyes"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(named.name.as_deref(), Some("Dana Reyes"));
        assert_eq!(named.last_name.as_deref(), Some("Reyes"));

        let bare = enrich_email_contact(&store, &no_lookup(), "u1", "ops@acme.test", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bare.name.as_deref(), Some("ops"));
        assert_eq!(bare.first_name.as_deref(), Some("ops"));
    }
}
