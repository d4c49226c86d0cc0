use crate::{AppError, AppState, error::ServiceError, metrics, security::Session};
use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

const STAGE: &str = "credits";

#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    credits: u32,
}

/// Balance of the caller, opening the account on first use.
pub async fn get_credits(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<CreditsResponse>, AppError> {
    metrics::inc_requests("/api/get-credits");
    let account = state
        .store
        .ensure_user(&session.user_id, session.email.as_deref())
        .await
        .map_err(|err| err.service_error(STAGE))?;
    Ok(Json(CreditsResponse {
        credits: account.credits,
    }))
}

/// Path ids naming anyone but the caller are reported as missing.
fn owned_by_caller(session: &Session, user_id: &str) -> Result<(), ServiceError> {
    if session.user_id == user_id {
        Ok(())
    } else {
        Err(ServiceError::not_found(STAGE, "not_found"))
    }
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(user_id): Path<String>,
) -> Result<Json<CreditsResponse>, AppError> {
    metrics::inc_requests("/api/user/{userId}");
    owned_by_caller(&session, &user_id)?;
    let account = state
        .store
        .get_user(&user_id)
        .await
        .map_err(|err| err.service_error(STAGE))?;
    Ok(Json(CreditsResponse {
        credits: account.credits,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    amount: i64,
}

pub async fn deduct_credits(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(user_id): Path<String>,
    Json(req): Json<DeductRequest>,
) -> Result<Json<CreditsResponse>, AppError> {
    metrics::inc_requests("/api/user/{userId}/deduct-credits");
    owned_by_caller(&session, &user_id)?;
    let amount = u32::try_from(req.amount)
        .ok()
        .filter(|amount| *amount >= 1)
        .ok_or_else(|| ServiceError::invalid_input(STAGE, "amount must be a positive integer"))?;
    let credits = state
        .store
        .deduct(&user_id, amount)
        .await
        .map_err(|err| err.service_error(STAGE))?;
    info!(target = "designgenius.credits", user_id = %user_id, amount, credits, "credits deducted");
    Ok(Json(CreditsResponse { credits }))
}

#[derive(Debug, Default, Deserialize)]
pub struct InitRequest {
    #[serde(default)]
    email: Option<String>,
}

/// Registers the caller if needed; existing accounts are left untouched.
pub async fn initialize_user(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<InitRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/api/user-initialization");
    let email = req
        .email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .or(session.email.as_deref())
        .ok_or_else(|| ServiceError::invalid_input(STAGE, "email is required"))?;
    state
        .store
        .ensure_user(&session.user_id, Some(email))
        .await
        .map_err(|err| err.service_error(STAGE))?;
    Ok(Json(json!({ "message": "User registered successfully" })))
}
