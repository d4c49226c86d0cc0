use super::geometry::{BoundingBox, ImageDimensions, Region};
use crate::{
    http::{body_excerpt, build_client},
    models::RoomType,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

const MODEL_SUFFIX: &str = "roomfurnituredetector";

/// Workflow id of the detector trained for `room_type`. Unknown labels are
/// slugged so custom workflows can still be addressed.
pub fn detector_model_id(room_type: &str) -> String {
    let prefix = match RoomType::parse(room_type) {
        Some(room) => room.detector_slug().to_string(),
        None => room_type
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect(),
    };
    format!("{prefix}{MODEL_SUFFIX}")
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub workflow_url: Option<String>,
    pub api_key: Option<String>,
}

impl DetectorConfig {
    pub fn from_env() -> Self {
        Self {
            workflow_url: std::env::var("ROBOFLOW_WORKFLOW_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            api_key: std::env::var("ROBOFLOW_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("furniture detector is not configured")]
    NotConfigured,
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("malformed detector response: {0}")]
    InvalidResponse(String),
    #[error("no furniture detected")]
    NoDetections,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceImage {
    pub url: String,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropImage {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFurnitureItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: u8,
    pub plot: BoundingBox,
    pub region: Region,
    pub image: CropImage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub image: SourceImage,
    pub furnitures: Vec<DetectedFurnitureItem>,
}

#[derive(Debug, Deserialize)]
struct WorkflowResponse {
    outputs: Vec<WorkflowOutput>,
}

#[derive(Debug, Deserialize)]
struct WorkflowOutput {
    #[serde(rename = "Furniture_Predictions")]
    predictions: PredictionBlock,
    #[serde(rename = "Furniture_Images", default)]
    images: Vec<RawCrop>,
}

#[derive(Debug, Deserialize)]
struct PredictionBlock {
    image: RawDimensions,
    #[serde(default)]
    predictions: Vec<RawPrediction>,
}

#[derive(Debug, Deserialize)]
struct RawDimensions {
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
struct RawPrediction {
    class: String,
    confidence: f64,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCrop {
    Tagged { value: String },
    Bare(String),
}

impl RawCrop {
    fn into_value(self) -> String {
        match self {
            RawCrop::Tagged { value } | RawCrop::Bare(value) => value,
        }
    }
}

pub struct FurnitureDetector {
    http: Client,
    config: DetectorConfig,
}

impl FurnitureDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub async fn detect(
        &self,
        image_url: &str,
        room_type: &str,
    ) -> Result<DetectionResult, DetectorError> {
        let (Some(base), Some(key)) = (
            self.config.workflow_url.as_deref(),
            self.config.api_key.as_deref(),
        ) else {
            return Err(DetectorError::NotConfigured);
        };
        let model = detector_model_id(room_type);
        debug!(target = "designgenius.scan", model = %model, "calling furniture detector");

        let body = json!({
            "api_key": key,
            "inputs": {"image": {"type": "url", "value": image_url}},
        });
        let response = self
            .http
            .post(format!("{base}{model}"))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DetectorError::Timeout
                } else {
                    DetectorError::Http(err.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DetectorError::Http(format!(
                "HTTP {status}: {}",
                body_excerpt(&text)
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| DetectorError::InvalidResponse(err.to_string()))?;
        parse_detection(image_url, payload)
    }
}

pub fn parse_detection(image_url: &str, payload: Value) -> Result<DetectionResult, DetectorError> {
    let parsed: WorkflowResponse = serde_json::from_value(payload)
        .map_err(|err| DetectorError::InvalidResponse(err.to_string()))?;
    let output = parsed
        .outputs
        .into_iter()
        .next()
        .ok_or_else(|| DetectorError::InvalidResponse("empty outputs".into()))?;

    let RawDimensions { width, height } = output.predictions.image;
    let source = ImageDimensions::new(width, height).ok_or_else(|| {
        DetectorError::InvalidResponse(format!("invalid source dimensions {width}x{height}"))
    })?;

    let predictions = output.predictions.predictions;
    if predictions.is_empty() {
        return Err(DetectorError::NoDetections);
    }
    if predictions.len() != output.images.len() {
        return Err(DetectorError::InvalidResponse(format!(
            "{} predictions but {} crops",
            predictions.len(),
            output.images.len()
        )));
    }

    let furnitures = predictions
        .into_iter()
        .zip(output.images)
        .map(|(prediction, crop)| {
            let plot = BoundingBox {
                x: prediction.x,
                y: prediction.y,
                width: prediction.width,
                height: prediction.height,
            };
            DetectedFurnitureItem {
                kind: prediction.class,
                confidence: (prediction.confidence * 100.0).round().clamp(0.0, 100.0) as u8,
                region: plot.to_region(source),
                plot,
                image: CropImage {
                    kind: "base64".into(),
                    value: crop.into_value(),
                },
            }
        })
        .collect();

    Ok(DetectionResult {
        image: SourceImage {
            url: image_url.to_string(),
            width,
            height,
        },
        furnitures,
    })
}
