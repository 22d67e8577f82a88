//! Per-message usage charges.

use crate::config::PricingConfig;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Usage {
    Sms { count: u32, ai_generated: bool },
    Email { count: u32 },
}

fn round4(amount: f64) -> f64 {
    (amount * 10_000.0).round() / 10_000.0
}

fn plural(count: u32) -> &'static str {
    if count > 1 {
        "s"
    } else {
        ""
    }
}

impl Usage {
    pub fn cost(&self, pricing: &PricingConfig) -> f64 {
        match *self {
            Usage::Sms { count, ai_generated } => {
                let base = f64::from(count) * pricing.sms_rate;
                let surcharge = if ai_generated {
                    round4(f64::from(count) * pricing.sms_ai_rate)
                } else {
                    0.0
                };
                round4(base + surcharge)
            }
            Usage::Email { count } => round4(f64::from(count) * pricing.email_rate),
        }
    }

    pub fn description(&self) -> String {
        match *self {
            Usage::Sms { count, ai_generated } => format!(
                "SMS - {count} message{}{}",
                plural(count),
                if ai_generated { " (AI reply)" } else { "" }
            ),
            Usage::Email { count } => format!("Email - {count} message{}", plural(count)),
        }
    }

    fn reference_type(&self) -> &'static str {
        match self {
            Usage::Sms { .. } => "sms",
            Usage::Email { .. } => "email",
        }
    }
}

/// Deducts the charge for `usage`. Failures are logged, never raised.
pub async fn charge(store: &dyn Store, pricing: &PricingConfig, user_id: &str, usage: Usage) {
    let cost = usage.cost(pricing);
    match store
        .deduct_credits(user_id, cost, &usage.description(), usage.reference_type())
        .await
    {
        Ok(result) => {
            tracing::info!(user_id, cost, balance = result.balance_after, "Credits deducted");
            if result.needs_recharge {
                tracing::info!(user_id, "Balance below recharge threshold");
            }
        }
        Err(e) => tracing::error!(user_id, cost, "Failed to deduct credits: {e}"),
    }
}
