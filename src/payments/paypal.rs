use super::{WebhookError, credits_for_paypal_value, once_per_event};
use crate::{AppError, AppState, http::body_excerpt, metrics};
use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

const STAGE: &str = "paypal_webhook";

/// Headers PayPal signs each delivery with, paired with the field names the
/// verification API expects.
const TRANSMISSION_HEADERS: [(&str, &str); 5] = [
    ("paypal-auth-algo", "auth_algo"),
    ("paypal-cert-url", "cert_url"),
    ("paypal-transmission-id", "transmission_id"),
    ("paypal-transmission-sig", "transmission_sig"),
    ("paypal-transmission-time", "transmission_time"),
];

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub api_base: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub webhook_id: Option<String>,
}

impl PaypalConfig {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_base: non_empty("PAYPAL_API_BASE")
                .unwrap_or_else(|| "https://api-m.sandbox.paypal.com".into())
                .trim_end_matches('/')
                .to_string(),
            client_id: non_empty("PAYPAL_CLIENT_ID"),
            client_secret: non_empty("PAYPAL_CLIENT_SECRET"),
            webhook_id: non_empty("PAYPAL_WEBHOOK_ID"),
        }
    }

    async fn access_token(&self, http: &Client) -> Result<String, WebhookError> {
        let (Some(id), Some(secret)) = (&self.client_id, &self.client_secret) else {
            return Err(WebhookError::NotConfigured("PAYPAL_CLIENT_ID/PAYPAL_CLIENT_SECRET"));
        };
        let response = http
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(id, Some(secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|err| WebhookError::Provider(err.to_string()))?;
        let token: TokenResponse = parse_json(response).await?;
        Ok(token.access_token)
    }

    /// Asks PayPal whether the delivery carrying `headers` and `event` is
    /// authentic.
    pub async fn verify(
        &self,
        http: &Client,
        headers: &HeaderMap,
        event: &Value,
    ) -> Result<(), WebhookError> {
        let webhook_id = self
            .webhook_id
            .as_deref()
            .ok_or(WebhookError::NotConfigured("PAYPAL_WEBHOOK_ID"))?;
        let mut body = serde_json::Map::new();
        for (header, field) in TRANSMISSION_HEADERS {
            let value = headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                .ok_or(WebhookError::MissingSignature)?;
            body.insert(field.into(), Value::String(value.to_string()));
        }
        body.insert("webhook_id".into(), Value::String(webhook_id.to_string()));
        body.insert("webhook_event".into(), event.clone());

        let token = self.access_token(http).await?;
        let response = http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.api_base
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| WebhookError::Provider(err.to_string()))?;
        let verdict: VerificationResponse = parse_json(response).await?;
        if verdict.verification_status == "SUCCESS" {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    verification_status: String,
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, WebhookError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| WebhookError::Provider(err.to_string()))?;
    if !status.is_success() {
        return Err(WebhookError::Provider(format!(
            "HTTP {status}: {}",
            body_excerpt(&text)
        )));
    }
    serde_json::from_str(&text).map_err(|err| WebhookError::Provider(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct CaptureEvent {
    #[serde(default)]
    id: Option<String>,
    event_type: String,
    #[serde(default)]
    resource: Option<CaptureResource>,
}

#[derive(Debug, Deserialize)]
struct CaptureResource {
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    amount: Option<CaptureAmount>,
}

#[derive(Debug, Deserialize)]
struct CaptureAmount {
    value: String,
}

/// PayPal webhook receiver.
///
/// - Method: `POST`
/// - Path: `/api/webhook/paypal`
/// - Auth: PayPal transmission headers, checked with PayPal's verification API
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/webhook/paypal");
    process_webhook(&state, &headers, &body)
        .await
        .map_err(|err| {
            warn!(target = "designgenius.payments", error = %err, "paypal webhook rejected");
            AppError::from(err.service_error(STAGE))
        })?;
    Ok(Json(json!({ "status": "success" })))
}

async fn process_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), WebhookError> {
    let raw: Value =
        serde_json::from_slice(body).map_err(|err| WebhookError::Payload(err.to_string()))?;
    state
        .payments
        .paypal
        .verify(&state.payments.http, headers, &raw)
        .await?;

    let event: CaptureEvent =
        serde_json::from_value(raw).map_err(|err| WebhookError::Payload(err.to_string()))?;
    if event.event_type != "PAYMENT.CAPTURE.COMPLETED" {
        info!(target = "designgenius.payments", event = %event.event_type, "ignoring paypal event");
        return Ok(());
    }
    let resource = event
        .resource
        .ok_or_else(|| WebhookError::Payload("capture without resource".into()))?;
    once_per_event(state, "paypal", event.id.as_deref(), || {
        credit_capture(state, resource)
    })
    .await
}

async fn credit_capture(state: &AppState, resource: CaptureResource) -> Result<(), WebhookError> {
    let user_id = resource
        .custom_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| WebhookError::Payload("capture without custom_id".into()))?;
    let value = resource.amount.map(|a| a.value).unwrap_or_default();
    let credits = credits_for_paypal_value(&value);
    if credits == 0 {
        warn!(target = "designgenius.payments", user_id = %user_id, value = %value, "unknown capture amount, nothing granted");
        return Ok(());
    }
    let balance = state.store.grant(&user_id, credits).await?;
    info!(
        target = "designgenius.payments",
        user_id = %user_id,
        credits,
        balance,
        "paypal capture credited"
    );
    Ok(())
}
