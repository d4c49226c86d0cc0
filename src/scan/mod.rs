pub mod describer;
pub mod detector;
pub mod geometry;
pub mod products;

use crate::{
    error::ServiceError,
    http::ensure_image_url,
    llm::{LlmClient, LlmConfig, LlmError},
    models::StageReport,
    session::DesignSession,
};
use describer::{DescribeError, FurnitureDescriber};
use geometry::{AffineTransform, DisplayRect, Fit, ImageDimensions};
use detector::{
    DetectedFurnitureItem, DetectionResult, DetectorConfig, DetectorError, FurnitureDetector,
    SourceImage,
};
use products::{ProductMatch, ProductSearch, SearchConfig, SearchError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use std::{future::Future, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

const DETECT_STAGE: &str = "detect_furniture";
const DESCRIBE_STAGE: &str = "describe_item";
const SEARCH_STAGE: &str = "search_products";

impl From<DetectorError> for ServiceError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::NotConfigured => ServiceError::internal(DETECT_STAGE, err.to_string()),
            DetectorError::Timeout => ServiceError::upstream_timeout(DETECT_STAGE, err.to_string()),
            DetectorError::NoDetections => {
                ServiceError::not_found(DETECT_STAGE, "no_furniture_detected")
            }
            DetectorError::Http(_) | DetectorError::InvalidResponse(_) => {
                ServiceError::upstream(DETECT_STAGE, err.to_string())
            }
        }
    }
}

impl From<DescribeError> for ServiceError {
    fn from(err: DescribeError) -> Self {
        match err {
            DescribeError::InvalidImage(_) | DescribeError::MissingRoomType => {
                ServiceError::invalid_input(DESCRIBE_STAGE, err.to_string())
            }
            DescribeError::Llm(LlmError::MissingApiKey) => {
                ServiceError::internal(DESCRIBE_STAGE, err.to_string())
            }
            DescribeError::Llm(LlmError::Timeout) => {
                ServiceError::upstream_timeout(DESCRIBE_STAGE, err.to_string())
            }
            DescribeError::Llm(_) | DescribeError::NotJson | DescribeError::MissingDescription => {
                ServiceError::upstream(DESCRIBE_STAGE, err.to_string())
            }
        }
    }
}

impl From<SearchError> for ServiceError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::EmptyQuery => ServiceError::invalid_input(SEARCH_STAGE, err.to_string()),
            SearchError::MissingApiKey => ServiceError::internal(SEARCH_STAGE, err.to_string()),
            SearchError::Timeout => ServiceError::upstream_timeout(SEARCH_STAGE, err.to_string()),
            SearchError::Http(_) | SearchError::MissingResults | SearchError::InvalidResponse(_) => {
                ServiceError::upstream(SEARCH_STAGE, err.to_string())
            }
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub image_url: String,
    pub room_type: String,
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Rendered size of the image on the client; when present every item
    /// also carries its box in display pixels.
    #[serde(default)]
    pub display: Option<DisplayTarget>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DisplayTarget {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub fit: Fit,
}

impl ScanRequest {
    pub fn from_session(session: &DesignSession) -> Option<Self> {
        let image_url = session.output_image_url.clone()?;
        let room = session.room?;
        Some(Self {
            image_url,
            room_type: room.label().to_string(),
            max_items: None,
            display: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub stage: String,
    pub error: String,
    pub detail: String,
}

impl From<&ServiceError> for ItemError {
    fn from(err: &ServiceError) -> Self {
        Self {
            stage: err.stage().to_string(),
            error: err.kind().code().to_string(),
            detail: err.detail().to_string(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedItem {
    pub index: usize,
    #[serde(flatten)]
    pub furniture: DetectedFurnitureItem,
    pub display: Option<DisplayRect>,
    pub description: Option<String>,
    #[serde(default)]
    pub products: Vec<ProductMatch>,
    pub error: Option<ItemError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub image: SourceImage,
    pub items: Vec<ScannedItem>,
    pub stages: Vec<StageReport>,
}

/// Incremental progress of a scan, one SSE event each.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Detected {
        image: SourceImage,
        furnitures: Vec<DetectedFurnitureItem>,
    },
    Described {
        index: usize,
        #[serde(rename = "type")]
        kind: String,
        description: String,
    },
    Matched {
        index: usize,
        products: Vec<ProductMatch>,
    },
    ItemFailed {
        index: usize,
        #[serde(flatten)]
        error: ItemError,
    },
    Completed {
        items: usize,
        failed: usize,
    },
    Failed {
        #[serde(flatten)]
        error: ItemError,
    },
}

impl ScanEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ScanEvent::Detected { .. } => "detected",
            ScanEvent::Described { .. } => "described",
            ScanEvent::Matched { .. } => "matched",
            ScanEvent::ItemFailed { .. } => "item_failed",
            ScanEvent::Completed { .. } => "completed",
            ScanEvent::Failed { .. } => "failed",
        }
    }
}

pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[derive(Clone)]
pub struct ScanPipeline {
    detector: Arc<FurnitureDetector>,
    describer: Arc<FurnitureDescriber>,
    search: Arc<ProductSearch>,
    max_items: usize,
    products_per_item: usize,
}

impl ScanPipeline {
    pub fn new(
        detector: FurnitureDetector,
        describer: FurnitureDescriber,
        search: ProductSearch,
    ) -> Self {
        Self {
            detector: Arc::new(detector),
            describer: Arc::new(describer),
            search: Arc::new(search),
            max_items: 8,
            products_per_item: 5,
        }
    }

    pub fn from_env() -> Self {
        let env_usize = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
        };
        let mut pipeline = Self::new(
            FurnitureDetector::new(DetectorConfig::from_env()),
            FurnitureDescriber::new(LlmClient::new(LlmConfig::from_env())),
            ProductSearch::new(SearchConfig::from_env()),
        );
        if let Some(max) = env_usize("SCAN_MAX_ITEMS") {
            pipeline.max_items = max;
        }
        if let Some(per_item) = env_usize("SCAN_PRODUCTS_PER_ITEM") {
            pipeline.products_per_item = per_item;
        }
        pipeline
    }

    pub async fn detect(
        &self,
        image_url: &str,
        room_type: &str,
    ) -> Result<DetectionResult, ServiceError> {
        let url = ensure_image_url(DETECT_STAGE, image_url)?;
        if room_type.trim().is_empty() {
            return Err(ServiceError::invalid_input(DETECT_STAGE, "room type is required"));
        }
        Ok(self.detector.detect(url.as_str(), room_type.trim()).await?)
    }

    pub async fn describe(
        &self,
        base64_image: &str,
        kind: &str,
        room_type: &str,
    ) -> Result<String, ServiceError> {
        Ok(self.describer.describe(base64_image, kind, room_type).await?)
    }

    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ProductMatch>, ServiceError> {
        Ok(self.search.search(query, limit).await?)
    }

    /// Detect, then describe and match every item. Per-item failures are
    /// recorded on the item; a detection failure aborts the scan.
    pub async fn execute(
        &self,
        request: ScanRequest,
        events: Option<&mpsc::Sender<ScanEvent>>,
    ) -> Result<ScanReport, ServiceError> {
        let result = self.run(request, events).await;
        if let Err(err) = &result {
            emit(events, ScanEvent::Failed { error: err.into() }).await;
        }
        result
    }

    async fn run(
        &self,
        request: ScanRequest,
        events: Option<&mpsc::Sender<ScanEvent>>,
    ) -> Result<ScanReport, ServiceError> {
        let room_type = request.room_type.trim().to_string();
        let limit = request
            .max_items
            .unwrap_or(self.max_items)
            .clamp(1, self.max_items);
        let mut stages = Vec::new();

        let detection = self
            .capture_stage(DETECT_STAGE, &mut stages, async {
                let result = self.detect(&request.image_url, &room_type).await?;
                let output = json!({
                    "model": detector::detector_model_id(&room_type),
                    "detected": result.furnitures.len(),
                    "source": {"width": result.image.width, "height": result.image.height},
                });
                Ok(StageOutcome::new(result, output))
            })
            .await?;
        let DetectionResult { image, furnitures } = detection;
        let transform = request.display.and_then(|target| {
            let source = ImageDimensions::new(image.width, image.height)?;
            let display = ImageDimensions::new(target.width, target.height)?;
            Some(AffineTransform::between(source, display, target.fit))
        });
        info!(
            target = "designgenius.scan",
            detected = furnitures.len(),
            limit,
            "furniture detected"
        );
        let connected = emit(
            events,
            ScanEvent::Detected {
                image: image.clone(),
                furnitures: furnitures.clone(),
            },
        )
        .await;
        if !connected {
            return Err(disconnected());
        }

        let mut items = Vec::new();
        for (index, furniture) in furnitures.into_iter().take(limit).enumerate() {
            let mut item = ScannedItem {
                index,
                display: transform.map(|t| t.map_box(&furniture.plot)),
                furniture,
                description: None,
                products: Vec::new(),
                error: None,
            };
            let event = match self
                .scan_item(&mut item, &room_type, &mut stages, events)
                .await
            {
                Ok(products) => ScanEvent::Matched { index, products },
                Err(err) => {
                    warn!(
                        target = "designgenius.scan",
                        index,
                        stage = err.stage(),
                        error = %err,
                        "scan item failed"
                    );
                    let error = ItemError::from(&err);
                    item.error = Some(error.clone());
                    ScanEvent::ItemFailed { index, error }
                }
            };
            if !emit(events, event).await {
                return Err(disconnected());
            }
            items.push(item);
        }

        let failed = items.iter().filter(|item| item.error.is_some()).count();
        emit(
            events,
            ScanEvent::Completed {
                items: items.len(),
                failed,
            },
        )
        .await;
        Ok(ScanReport {
            image,
            items,
            stages,
        })
    }

    async fn scan_item(
        &self,
        item: &mut ScannedItem,
        room_type: &str,
        stages: &mut Vec<StageReport>,
        events: Option<&mpsc::Sender<ScanEvent>>,
    ) -> Result<Vec<ProductMatch>, ServiceError> {
        let index = item.index;
        let kind = item.furniture.kind.clone();
        let crop = item.furniture.image.value.clone();
        let description = self
            .capture_stage(DESCRIBE_STAGE, stages, async {
                let text = self.describe(&crop, &kind, room_type).await?;
                let output = json!({"index": index, "type": kind, "chars": text.chars().count()});
                Ok(StageOutcome::new(text, output))
            })
            .await?;
        item.description = Some(description.clone());
        let described = ScanEvent::Described {
            index,
            kind: kind.clone(),
            description: description.clone(),
        };
        if !emit(events, described).await {
            return Err(disconnected());
        }

        let products = self
            .capture_stage(SEARCH_STAGE, stages, async {
                let products = self
                    .search(&description, Some(self.products_per_item))
                    .await?;
                let output = json!({"index": index, "matches": products.len()});
                Ok(StageOutcome::new(products, output))
            })
            .await?;
        item.products = products.clone();
        Ok(products)
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, ServiceError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, ServiceError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        match result {
            Ok(outcome) => {
                stages.push(StageReport::new(name, elapsed_ms, outcome.output));
                Ok(outcome.value)
            }
            Err(err) => {
                stages.push(StageReport::new(
                    name,
                    elapsed_ms,
                    json!({"error": err.kind().code(), "detail": err.detail()}),
                ));
                Err(err)
            }
        }
    }
}

/// Returns false once the stream consumer has gone away.
async fn emit(events: Option<&mpsc::Sender<ScanEvent>>, event: ScanEvent) -> bool {
    match events {
        Some(tx) => tx.send(event).await.is_ok(),
        None => true,
    }
}

fn disconnected() -> ServiceError {
    ServiceError::internal("scan_stream", "client_disconnected")
}
