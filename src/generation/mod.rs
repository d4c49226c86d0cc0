pub mod poll;
pub mod replicate;

use crate::{
    error::ServiceError,
    metrics,
    models::{RoomType, Theme},
};
use poll::{PollOutcome, PollPolicy, PollStatus, poll_until_settled};
use replicate::{Prediction, ReplicateClient, ReplicateConfig, ReplicateError};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const NEGATIVE_PROMPT: &str = "blurry, cartoonish, illustration, surreal, people, humans, distorted, lowres, bad anatomy, extra limbs, missing fingers, low quality, watermark, logo, text, abstract, overexposed, grainy, poorly framed, over-saturated, unnatural lighting, artificial elements, HDR";

/// Validated input for one redesign.
#[derive(Debug, Clone)]
pub struct RedesignRequest {
    pub source_image_url: Url,
    pub room: RoomType,
    pub theme: Theme,
}

impl RedesignRequest {
    pub fn prompt(&self) -> String {
        format!(
            "A photo of a {} {}, 4k photo, highly detailed, stylish furniture, intricate textures, sharp focus, realistic shadows, and photorealistic lighting",
            self.theme, self.room
        )
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub image_url: String,
    pub output: Vec<String>,
    pub prediction_id: String,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Replicate(#[from] ReplicateError),
    #[error("prediction {id} failed: {reason}")]
    Failed { id: String, reason: String },
    #[error("prediction {id} did not settle after {attempts} attempts")]
    TimedOut { id: String, attempts: u32 },
    #[error("prediction {0} succeeded without an image")]
    EmptyOutput(String),
}

impl From<GenerationError> for ServiceError {
    fn from(err: GenerationError) -> Self {
        const STAGE: &str = "generate_image";
        match &err {
            GenerationError::Replicate(ReplicateError::MissingApiKey) => {
                ServiceError::internal(STAGE, err.to_string())
            }
            GenerationError::Replicate(ReplicateError::Timeout)
            | GenerationError::TimedOut { .. } => {
                ServiceError::upstream_timeout(STAGE, err.to_string())
            }
            _ => ServiceError::upstream(STAGE, err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Redesigner {
    client: Arc<ReplicateClient>,
    policy: PollPolicy,
}

impl Redesigner {
    pub fn new(config: ReplicateConfig, policy: PollPolicy) -> Self {
        Self {
            client: Arc::new(ReplicateClient::new(config)),
            policy,
        }
    }

    pub fn from_env() -> Self {
        Self::new(ReplicateConfig::from_env(), PollPolicy::from_env())
    }

    /// Submits the prediction and waits for it within the poll policy.
    pub async fn generate(
        &self,
        request: &RedesignRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        let prompt = request.prompt();
        let created = self
            .client
            .create_prediction(request.source_image_url.as_str(), &prompt, NEGATIVE_PROMPT)
            .await?;
        let id = created.id.clone();
        let status_url = created.urls.get.clone();
        info!(
            target = "designgenius.generation",
            prediction_id = %id,
            room = %request.room,
            theme = %request.theme,
            "prediction submitted"
        );

        let outcome = match created.status() {
            PollStatus::Succeeded(prediction) => PollOutcome::Succeeded {
                value: prediction,
                attempts: 0,
            },
            PollStatus::Failed(reason) => PollOutcome::Failed {
                reason,
                attempts: 0,
            },
            PollStatus::Pending => {
                let client = self.client.clone();
                poll_until_settled(&self.policy, |attempt| {
                    let client = client.clone();
                    let url = status_url.clone();
                    let id = id.clone();
                    async move {
                        metrics::poll_attempt(&id, attempt);
                        client.fetch_prediction(&url).await
                    }
                })
                .await?
            }
        };

        match outcome {
            PollOutcome::Succeeded { value, attempts } => {
                let output = output_urls(&value);
                let image_url = output
                    .last()
                    .cloned()
                    .ok_or_else(|| GenerationError::EmptyOutput(id.clone()))?;
                info!(
                    target = "designgenius.generation",
                    prediction_id = %id,
                    attempts,
                    "prediction succeeded"
                );
                Ok(GenerationOutcome {
                    image_url,
                    output,
                    prediction_id: id,
                    attempts,
                })
            }
            PollOutcome::Failed { reason, attempts } => {
                warn!(
                    target = "designgenius.generation",
                    prediction_id = %id,
                    attempts,
                    reason = %reason,
                    "prediction failed"
                );
                Err(GenerationError::Failed { id, reason })
            }
            PollOutcome::Exhausted { attempts, elapsed } => {
                warn!(
                    target = "designgenius.generation",
                    prediction_id = %id,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "prediction poll exhausted"
                );
                Err(GenerationError::TimedOut { id, attempts })
            }
        }
    }
}

/// Output URLs in model order. ControlNet models put the control map first
/// and the generated image last.
fn output_urls(prediction: &Prediction) -> Vec<String> {
    match &prediction.output {
        Some(Value::String(url)) if !url.trim().is_empty() => vec![url.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .filter(|url| !url.trim().is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
