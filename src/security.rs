use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AuthState {
    verifier: Arc<SessionVerifier>,
    limiter: Arc<TokenBuckets>,
}

/// Authenticated caller, inserted as a request extension.
#[derive(Clone, Debug)]
pub struct Session {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct SessionClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    exp: usize,
}

struct SessionVerifier {
    jwt: Option<(DecodingKey, Validation)>,
    dev_tokens: HashMap<String, String>,
}

impl SessionVerifier {
    fn verify(&self, token: &str) -> Option<Session> {
        if let Some(user_id) = self.dev_tokens.get(token) {
            return Some(Session {
                user_id: user_id.clone(),
                email: None,
            });
        }
        let (key, validation) = self.jwt.as_ref()?;
        match decode::<SessionClaims>(token, key, validation) {
            Ok(data) if !data.claims.sub.trim().is_empty() => Some(Session {
                user_id: data.claims.sub,
                email: data.claims.email,
            }),
            Ok(_) => None,
            Err(err) => {
                debug!(target = "designgenius.auth", error = %err, "session token rejected");
                None
            }
        }
    }
}

impl AuthState {
    pub fn from_env() -> Self {
        let jwt = jwt_from_env();
        let dev_tokens = load_dev_tokens_from_env(jwt.is_none());
        Self {
            verifier: Arc::new(SessionVerifier { jwt, dev_tokens }),
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }

    /// Static `token -> user id` table with a generous limiter.
    #[cfg(test)]
    pub fn with_tokens(tokens: &[(&str, &str)]) -> Self {
        let dev_tokens = tokens
            .iter()
            .map(|(user, token)| (token.to_string(), user.to_string()))
            .collect();
        Self {
            verifier: Arc::new(SessionVerifier {
                jwt: None,
                dev_tokens,
            }),
            limiter: Arc::new(TokenBuckets::new(1000.0, 1000.0)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<Session> {
        self.verifier.verify(presented)
    }

    async fn consume(&self, user_id: &str) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(user_id).await
    }
}

pub async fn require_session(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_session_token(request.headers()) else {
        let response = unauthorized_response(
            "missing_session",
            "Provide Authorization: Bearer <token> or X-Session-Token",
        );
        return Ok(response);
    };

    let Some(session) = state.authenticate(&presented) else {
        let response = unauthorized_response("invalid_session", "Session token not recognized");
        return Ok(response);
    };

    match state.consume(&session.user_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(session);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = too_many_requests("rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_session_token(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|token| !token.is_empty());
    }
    headers
        .get("X-Session-Token")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ApiError::new(code, message))).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    (StatusCode::TOO_MANY_REQUESTS, Json(ApiError::new(code, message))).into_response()
}

fn jwt_from_env() -> Option<(DecodingKey, Validation)> {
    if let Ok(pem) = env::var("CLERK_JWT_KEY") {
        match DecodingKey::from_rsa_pem(pem.replace("\\n", "\n").as_bytes()) {
            Ok(key) => {
                info!(target = "designgenius.auth", "verifying sessions with RS256 key");
                return Some((key, validation(Algorithm::RS256)));
            }
            Err(err) => warn!(
                target = "designgenius.auth",
                error = %err,
                "CLERK_JWT_KEY is not a valid RSA public key"
            ),
        }
    }
    let secret = env::var("SESSION_JWT_SECRET")
        .ok()
        .filter(|v| !v.trim().is_empty())?;
    info!(target = "designgenius.auth", "verifying sessions with HS256 secret");
    Some((
        DecodingKey::from_secret(secret.as_bytes()),
        validation(Algorithm::HS256),
    ))
}

fn validation(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.validate_aud = false;
    validation
}

fn load_dev_tokens_from_env(allow_demo: bool) -> HashMap<String, String> {
    let raw = match env::var("DEV_SESSION_TOKENS") {
        Ok(raw) => raw,
        Err(_) if allow_demo => "demo-user:demo-token".to_string(),
        Err(_) => return HashMap::new(),
    };
    let mut entries = HashMap::new();
    for token in raw.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let user_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (user_id, secret) {
            (Some(user), Some(secret)) => {
                entries.insert(secret.to_string(), user.to_string());
            }
            _ => warn!(
                target = "designgenius.auth",
                "ignored malformed DEV_SESSION_TOKENS entry: {trimmed}"
            ),
        }
    }

    if !entries.is_empty() {
        info!(
            target = "designgenius.auth",
            token_count = entries.len(),
            "loaded development session tokens"
        );
    }
    entries
}

#[derive(Clone)]
struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_number(headers, "X-RateLimit-Limit", self.capacity as u64);
        insert_number(headers, "X-RateLimit-Remaining", remaining);
        insert_number(headers, "X-RateLimit-Reset", reset);
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(1.0) as u64;
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry));
        insert_number(headers, "X-RateLimit-Limit", self.capacity as u64);
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_number(headers, "X-RateLimit-Reset", reset);
    }
}

fn insert_number(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}
