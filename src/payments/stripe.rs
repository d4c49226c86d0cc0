use super::{
    CURRENCY, WebhookError, bundle_for_credits, credits_for_amount, once_per_event, signature,
};
use crate::{
    AppError, AppState,
    error::ServiceError,
    http::body_excerpt,
    metrics,
    security::Session,
};
use axum::{Extension, Json, body::Bytes, extract::State, http::HeaderMap};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

const WEBHOOK_STAGE: &str = "stripe_webhook";
const CHECKOUT_STAGE: &str = "checkout";

pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub api_base: String,
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub checkout_origin: String,
}

impl StripeConfig {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_base: non_empty("STRIPE_API_BASE")
                .unwrap_or_else(|| "https://api.stripe.com".into())
                .trim_end_matches('/')
                .to_string(),
            secret_key: non_empty("STRIPE_SECRET_KEY"),
            webhook_secret: non_empty("STRIPE_WEBHOOK_SECRET"),
            checkout_origin: non_empty("CHECKOUT_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".into())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against
/// the raw payload.
pub fn verify_stripe_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    now: i64,
) -> Result<(), WebhookError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let Some(timestamp) = timestamp else {
        return Err(WebhookError::MissingSignature);
    };
    if candidates.is_empty() {
        return Err(WebhookError::MissingSignature);
    }
    if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookError::Expired);
    }
    let t = timestamp.to_string();
    let signed: [&[u8]; 3] = [t.as_bytes(), b".", payload];
    if candidates
        .iter()
        .any(|candidate| signature::verify_hex(secret.as_bytes(), &signed, candidate))
    {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: CheckoutSessionObject,
}

#[derive(Debug, Default, Deserialize)]
struct CheckoutSessionObject {
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

/// Stripe webhook receiver.
///
/// - Method: `POST`
/// - Path: `/api/webhook/stripe`
/// - Auth: `Stripe-Signature` over the raw body
///
/// Completed checkouts grant the bundle matching `amount_total`.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/webhook/stripe");
    process_webhook(&state, &headers, &body)
        .await
        .map_err(|err| {
            warn!(target = "designgenius.payments", error = %err, "stripe webhook rejected");
            AppError::from(err.service_error(WEBHOOK_STAGE))
        })?;
    Ok(Json(json!({ "received": true })))
}

async fn process_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), WebhookError> {
    let secret = state
        .payments
        .stripe
        .webhook_secret
        .as_deref()
        .ok_or(WebhookError::NotConfigured("STRIPE_WEBHOOK_SECRET"))?;
    let header = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingSignature)?;
    verify_stripe_signature(header, body, secret, Utc::now().timestamp())?;

    let event: StripeEvent =
        serde_json::from_slice(body).map_err(|err| WebhookError::Payload(err.to_string()))?;
    if event.kind != "checkout.session.completed" {
        info!(target = "designgenius.payments", event = %event.kind, "ignoring stripe event");
        return Ok(());
    }
    let checkout = event.data.object;
    once_per_event(state, "stripe", event.id.as_deref(), || {
        credit_checkout(state, checkout)
    })
    .await
}

async fn credit_checkout(
    state: &AppState,
    checkout: CheckoutSessionObject,
) -> Result<(), WebhookError> {
    let amount = checkout.amount_total.unwrap_or_default();
    let credits = credits_for_amount(amount);
    if credits == 0 {
        warn!(target = "designgenius.payments", amount, "unknown checkout amount, nothing granted");
        return Ok(());
    }

    let email = checkout
        .customer_email
        .or_else(|| checkout.customer_details.and_then(|d| d.email));
    let by_email = match email.as_deref() {
        Some(email) => state.store.find_user_by_email(email).await?,
        None => None,
    };
    let user_id = match (by_email, checkout.client_reference_id) {
        (Some(user), _) => user.id,
        (None, Some(id)) => id,
        (None, None) => {
            return Err(WebhookError::Payload(
                "checkout session names no customer".into(),
            ));
        }
    };
    let balance = state.store.grant(&user_id, credits).await?;
    info!(
        target = "designgenius.payments",
        user_id = %user_id,
        credits,
        balance,
        "stripe checkout credited"
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    credits: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    session_id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionCreated {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

/// Starts a Stripe Checkout for one of the credit bundles.
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    metrics::inc_requests("/api/create-checkout-session");
    let bundle = bundle_for_credits(req.credits).ok_or_else(|| {
        ServiceError::invalid_input(CHECKOUT_STAGE, format!("unknown_bundle: {}", req.credits))
    })?;
    let config = &state.payments.stripe;
    let secret_key = config.secret_key.as_deref().ok_or_else(|| {
        WebhookError::NotConfigured("STRIPE_SECRET_KEY").service_error(CHECKOUT_STAGE)
    })?;
    let account = state
        .store
        .ensure_user(&session.user_id, session.email.as_deref())
        .await
        .map_err(|err| err.service_error(CHECKOUT_STAGE))?;

    let mut form: Vec<(&str, String)> = vec![
        ("mode", "payment".into()),
        (
            "success_url",
            format!("{}/dream?checkout=success", config.checkout_origin),
        ),
        ("cancel_url", format!("{}/pricing", config.checkout_origin)),
        ("client_reference_id", account.id.clone()),
        ("line_items[0][quantity]", "1".into()),
        ("line_items[0][price_data][currency]", CURRENCY.into()),
        (
            "line_items[0][price_data][unit_amount]",
            bundle.amount.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]",
            format!("{} DesignGenius credits", bundle.credits),
        ),
        ("metadata[credits]", bundle.credits.to_string()),
    ];
    if let Some(email) = account.email.as_deref() {
        form.push(("customer_email", email.to_string()));
    }

    let response = state
        .payments
        .http
        .post(format!("{}/v1/checkout/sessions", config.api_base))
        .bearer_auth(secret_key)
        .form(&form)
        .send()
        .await
        .map_err(|err| ServiceError::upstream(CHECKOUT_STAGE, err.to_string()))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| ServiceError::upstream(CHECKOUT_STAGE, err.to_string()))?;
    if !status.is_success() {
        return Err(ServiceError::upstream(
            CHECKOUT_STAGE,
            format!("stripe returned {status}: {}", body_excerpt(&text)),
        )
        .into());
    }
    let created: CheckoutSessionCreated = serde_json::from_str(&text).map_err(|err| {
        ServiceError::upstream(CHECKOUT_STAGE, format!("invalid checkout session: {err}"))
    })?;
    info!(
        target = "designgenius.payments",
        user_id = %account.id,
        credits = bundle.credits,
        session_id = %created.id,
        "checkout session created"
    );
    Ok(Json(CheckoutResponse {
        session_id: created.id,
        url: created.url,
    }))
}
