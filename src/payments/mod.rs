pub mod clerk;
pub mod paypal;
pub mod signature;
pub mod stripe;

use crate::{
    AppState,
    error::ServiceError,
    http::build_client,
    idempotency::{self, Claim},
    store::StoreError,
};
use paypal::PaypalConfig;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Duration;
use stripe::StripeConfig;
use thiserror::Error;
use tracing::info;

pub const CURRENCY: &str = "php";

/// Providers keep redelivering an event for up to three days.
const DELIVERY_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// A purchasable credit pack. `amount` is in centavos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditBundle {
    pub credits: u32,
    pub amount: i64,
    #[serde(skip)]
    pub paypal_value: &'static str,
}

pub const CREDIT_BUNDLES: [CreditBundle; 3] = [
    CreditBundle {
        credits: 30,
        amount: 100_000,
        paypal_value: "1000.00",
    },
    CreditBundle {
        credits: 100,
        amount: 200_000,
        paypal_value: "2000.00",
    },
    CreditBundle {
        credits: 200,
        amount: 350_000,
        paypal_value: "3500.00",
    },
];

pub fn bundle_for_credits(credits: u32) -> Option<&'static CreditBundle> {
    CREDIT_BUNDLES.iter().find(|b| b.credits == credits)
}

/// Credits bought by a Stripe `amount_total`; unknown amounts buy nothing.
pub fn credits_for_amount(amount_total: i64) -> u32 {
    CREDIT_BUNDLES
        .iter()
        .find(|b| b.amount == amount_total)
        .map_or(0, |b| b.credits)
}

/// Credits bought by a PayPal capture `amount.value`.
pub fn credits_for_paypal_value(value: &str) -> u32 {
    let value = value.trim();
    CREDIT_BUNDLES
        .iter()
        .find(|b| b.paypal_value == value)
        .map_or(0, |b| b.credits)
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("missing signature header")]
    MissingSignature,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("unhandled event type `{0}`")]
    UnhandledEvent(String),
    #[error("provider call failed: {0}")]
    Provider(String),
    #[error("event `{0}` is already being processed")]
    InProgress(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WebhookError {
    pub fn service_error(self, stage: &'static str) -> ServiceError {
        match self {
            WebhookError::NotConfigured(_) => ServiceError::internal(stage, self.to_string()),
            WebhookError::MissingSignature
            | WebhookError::InvalidSignature
            | WebhookError::Expired
            | WebhookError::Payload(_)
            | WebhookError::UnhandledEvent(_) => {
                ServiceError::invalid_input(stage, self.to_string())
            }
            WebhookError::Provider(_) => ServiceError::upstream(stage, self.to_string()),
            WebhookError::InProgress(_) => ServiceError::conflict(stage, self.to_string()),
            WebhookError::Store(err) => err.service_error(stage),
        }
    }
}

/// Runs `handle` at most once per provider event id. Redeliveries of a
/// handled event are acknowledged without effect; a failed attempt frees the
/// id for the provider's next retry.
pub async fn once_per_event<F, Fut>(
    state: &AppState,
    provider: &str,
    event_id: Option<&str>,
    handle: F,
) -> Result<(), WebhookError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), WebhookError>>,
{
    let Some(event_id) = event_id.filter(|id| !id.trim().is_empty()) else {
        return handle().await;
    };
    let key = idempotency::cache_key(&format!("webhook.{provider}"), event_id);
    match state.idempotency.claim::<Value>(&key, DELIVERY_TTL).await {
        Claim::Replay(_) => {
            info!(target = "designgenius.payments", provider, event_id, "duplicate delivery ignored");
            return Ok(());
        }
        Claim::InFlight => return Err(WebhookError::InProgress(event_id.to_string())),
        Claim::Acquired => {}
    }
    let result = handle().await;
    match &result {
        Ok(()) => {
            state
                .idempotency
                .complete(&key, &json!({ "handled": true }), DELIVERY_TTL)
                .await
        }
        Err(_) => state.idempotency.release(&key).await,
    }
    result
}

/// Provider credentials for checkout and webhook verification.
pub struct Payments {
    pub stripe: StripeConfig,
    pub paypal: PaypalConfig,
    pub clerk_signing_secret: Option<String>,
    pub http: Client,
}

impl Payments {
    pub fn from_env() -> Self {
        Self {
            stripe: StripeConfig::from_env(),
            paypal: PaypalConfig::from_env(),
            clerk_signing_secret: std::env::var("CLERK_SIGNING_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            http: build_client(),
        }
    }
}
