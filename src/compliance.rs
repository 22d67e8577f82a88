//! US SMS compliance: STOP/START keywords, opt-out records and US/Canada
//! classification for +1 numbers.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::config::SmsConfig;
use crate::models::{OptStatus, SmsOptOut};
use crate::store::{Store, StoreError};

const OPT_OUT_KEYWORDS: &[&str] = &["stop", "stopall", "unsubscribe", "cancel", "end", "quit"];
const OPT_IN_KEYWORDS: &[&str] = &["start", "unstop", "yes"];

const AREA_CODE_TTL: Duration = Duration::from_secs(60 * 60);

pub const OPT_OUT_CONFIRMATION: &str =
    "You have been unsubscribed from SMS messages. Reply START to opt back in.";
pub const OPT_IN_CONFIRMATION: &str =
    "You have been subscribed to SMS messages. Reply STOP to unsubscribe.";

pub fn is_opt_out_message(message: &str) -> bool {
    OPT_OUT_KEYWORDS.contains(&message.trim().to_lowercase().as_str())
}

pub fn is_opt_in_message(message: &str) -> bool {
    OPT_IN_KEYWORDS.contains(&message.trim().to_lowercase().as_str())
}

/// Canadian area codes, reloaded from the store at most once an hour.
#[derive(Default)]
pub struct AreaCodeCache {
    inner: Mutex<Option<(Instant, HashSet<String>)>>,
}

impl AreaCodeCache {
    async fn canadian(&self, store: &dyn Store) -> HashSet<String> {
        let mut guard = self.inner.lock().await;
        if let Some((loaded, codes)) = guard.as_ref() {
            if loaded.elapsed() < AREA_CODE_TTL {
                return codes.clone();
            }
        }

        match store.canadian_area_codes().await {
            Ok(codes) => {
                let codes: HashSet<String> = codes.into_iter().collect();
                *guard = Some((Instant::now(), codes.clone()));
                codes
            }
            Err(e) => {
                // Not cached, so the next call retries
                tracing::error!("Failed to load Canadian area codes: {e}");
                HashSet::new()
            }
        }
    }

    /// A +1 number whose area code is not Canadian.
    pub async fn is_us_number(&self, store: &dyn Store, phone: &str) -> bool {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        if !digits.starts_with('1') || digits.len() != 11 {
            return false;
        }
        let area_code = &digits[1..4];
        !self.canadian(store).await.contains(area_code)
    }

    /// Number to send from: the campaign number for US recipients when
    /// campaign routing is on, otherwise `default_from`.
    pub async fn sender_number(
        &self,
        store: &dyn Store,
        sms: &SmsConfig,
        recipient: &str,
        default_from: &str,
    ) -> String {
        if sms.use_campaign_number && self.is_us_number(store, recipient).await {
            tracing::debug!(recipient, "US recipient, using campaign number");
            return sms.campaign_number.clone();
        }
        default_from.to_string()
    }
}

pub async fn is_opted_out(store: &dyn Store, phone: &str) -> bool {
    match store.opt_out_status(phone).await {
        Ok(Some(row)) => row.status == OptStatus::OptedOut,
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(phone, "Opt-out lookup failed: {e}");
            false
        }
    }
}

pub async fn record_opt_out(store: &dyn Store, phone: &str) -> Result<(), StoreError> {
    let now = Utc::now();
    store
        .upsert_opt_out(&SmsOptOut {
            phone_number: phone.to_string(),
            status: OptStatus::OptedOut,
            opted_out_at: Some(now),
            opted_in_at: None,
            updated_at: now,
        })
        .await
}

pub async fn record_opt_in(store: &dyn Store, phone: &str) -> Result<(), StoreError> {
    let now = Utc::now();
    store
        .upsert_opt_out(&SmsOptOut {
            phone_number: phone.to_string(),
            status: OptStatus::OptedIn,
            opted_out_at: None,
            opted_in_at: Some(now),
            updated_at: now,
        })
        .await
}
