use super::{WebhookError, signature};
use crate::{AppError, AppState, error::ServiceError, metrics};
use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

const STAGE: &str = "clerk_webhook";

#[derive(Debug, Deserialize)]
struct IdentityEvent {
    #[serde(rename = "type")]
    kind: String,
    data: IdentityUser,
}

#[derive(Debug, Deserialize)]
struct IdentityUser {
    id: String,
    #[serde(default)]
    primary_email_address_id: Option<String>,
    #[serde(default)]
    email_addresses: Vec<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    id: Option<String>,
    email_address: String,
}

impl IdentityUser {
    /// The primary address, or the first one listed.
    fn primary_email(&self) -> Option<&str> {
        let primary = self.primary_email_address_id.as_deref();
        self.email_addresses
            .iter()
            .find(|e| primary.is_some() && e.id.as_deref() == primary)
            .or_else(|| self.email_addresses.first())
            .map(|e| e.email_address.as_str())
    }
}

/// Identity-provider webhook.
///
/// - Method: `POST`
/// - Path: `/api/webhook/clerk`
/// - Auth: `clerk-signature`, hex HMAC-SHA256 of the raw body
///
/// `user.created` opens an account; `user.deleted` removes it with its history.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/webhook/clerk");
    let secret = state.payments.clerk_signing_secret.as_deref().ok_or_else(|| {
        WebhookError::NotConfigured("CLERK_SIGNING_SECRET").service_error(STAGE)
    })?;
    let presented = headers
        .get("clerk-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !signature::verify_hex(secret.as_bytes(), &[&body[..]], presented) {
        warn!(target = "designgenius.payments", "clerk webhook signature mismatch");
        return Err(ServiceError::unauthorized(STAGE, "invalid_signature").into());
    }

    let event: IdentityEvent = serde_json::from_slice(&body)
        .map_err(|err| WebhookError::Payload(err.to_string()).service_error(STAGE))?;
    let message = match event.kind.as_str() {
        "user.created" => {
            let account = state
                .store
                .ensure_user(&event.data.id, event.data.primary_email())
                .await
                .map_err(|err| err.service_error(STAGE))?;
            info!(target = "designgenius.payments", user_id = %account.id, "account created from identity event");
            "User initialized"
        }
        "user.deleted" => {
            let removed = state
                .store
                .delete_user(&event.data.id)
                .await
                .map_err(|err| err.service_error(STAGE))?;
            info!(target = "designgenius.payments", user_id = %event.data.id, removed, "account deleted from identity event");
            "User and related data deleted"
        }
        other => {
            return Err(WebhookError::UnhandledEvent(other.to_string())
                .service_error(STAGE)
                .into());
        }
    };
    Ok(Json(json!({ "message": message })))
}
