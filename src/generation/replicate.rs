use crate::http::{body_excerpt, build_client};
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::poll::PollStatus;

static DEFAULT_BASE_URL: Lazy<String> = Lazy::new(|| "https://api.replicate.com".to_string());

/// ControlNet interior model used for room redesigns.
pub const DEFAULT_MODEL_VERSION: &str =
    "854e8727697a057c525cdb45ab037f64ecca770a1769cc52287c2e56472a247b";

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_version: String,
}

impl ReplicateConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("REPLICATE_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| DEFAULT_BASE_URL.clone()),
            api_key: std::env::var("REPLICATE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            model_version: std::env::var("REPLICATE_MODEL_VERSION")
                .unwrap_or_else(|_| DEFAULT_MODEL_VERSION.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("REPLICATE_API_KEY is not configured")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ReplicateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ReplicateError::Timeout
        } else {
            ReplicateError::Http(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    pub urls: PredictionUrls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionUrls {
    pub get: String,
}

impl Prediction {
    pub fn status(self) -> PollStatus<Prediction> {
        match self.status.as_str() {
            "succeeded" => PollStatus::Succeeded(self),
            "failed" | "canceled" => {
                let reason = match &self.error {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Null) | None => format!("prediction {}", self.status),
                    Some(other) => other.to_string(),
                };
                PollStatus::Failed(reason)
            }
            _ => PollStatus::Pending,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatePrediction<'a> {
    version: &'a str,
    input: PredictionInput<'a>,
}

#[derive(Debug, Serialize)]
struct PredictionInput<'a> {
    image: &'a str,
    prompt: &'a str,
    n_prompt: &'a str,
}

pub struct ReplicateClient {
    http: Client,
    config: ReplicateConfig,
}

impl ReplicateClient {
    pub fn new(config: ReplicateConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    fn api_key(&self) -> Result<&str, ReplicateError> {
        self.config
            .api_key
            .as_deref()
            .ok_or(ReplicateError::MissingApiKey)
    }

    pub async fn create_prediction(
        &self,
        image: &str,
        prompt: &str,
        negative_prompt: &str,
    ) -> Result<Prediction, ReplicateError> {
        let key = self.api_key()?;
        let body = CreatePrediction {
            version: &self.config.model_version,
            input: PredictionInput {
                image,
                prompt,
                n_prompt: negative_prompt,
            },
        };
        let response = self
            .http
            .post(format!("{}/v1/predictions", self.config.base_url))
            .header("Authorization", format!("Token {key}"))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplicateError::Status {
                status: status.as_u16(),
                body: body_excerpt(&body),
            });
        }
        response
            .json::<Prediction>()
            .await
            .map_err(|err| ReplicateError::InvalidResponse(err.to_string()))
    }

    /// One status check. A gateway timeout from the status endpoint is
    /// reported as still pending.
    pub async fn fetch_prediction(
        &self,
        url: &str,
    ) -> Result<PollStatus<Prediction>, ReplicateError> {
        let key = self.api_key()?;
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Token {key}"))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::GATEWAY_TIMEOUT {
            return Ok(PollStatus::Pending);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplicateError::Status {
                status: status.as_u16(),
                body: body_excerpt(&body),
            });
        }
        let prediction = response
            .json::<Prediction>()
            .await
            .map_err(|err| ReplicateError::InvalidResponse(err.to_string()))?;
        Ok(prediction.status())
    }
}
