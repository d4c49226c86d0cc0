use crate::http::{body_excerpt, build_client};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub location: String,
    pub gl: String,
}

impl SearchConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("SERPER_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "https://google.serper.dev".into()),
            api_key: std::env::var("SERPER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            location: std::env::var("SERPER_LOCATION").unwrap_or_else(|_| "Philippines".into()),
            gl: std::env::var("SERPER_GL").unwrap_or_else(|_| "ph".into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query is required")]
    EmptyQuery,
    #[error("SERPER_API_KEY is not configured")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("no shopping results returned")]
    MissingResults,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMatch {
    pub title: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub rating_count: Option<u64>,
    #[serde(default)]
    pub delivery: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub product_id: Option<String>,
}

pub struct ProductSearch {
    http: Client,
    config: SearchConfig,
}

impl ProductSearch {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    /// Shopping results in upstream rank order.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ProductMatch>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(SearchError::MissingApiKey)?;
        let body = json!({
            "q": query,
            "location": self.config.location,
            "gl": self.config.gl,
        });
        let response = self
            .http
            .post(format!("{}/shopping", self.config.base_url))
            .header("X-API-KEY", key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SearchError::Timeout
                } else {
                    SearchError::Http(err.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SearchError::Http(format!(
                "HTTP {status}: {}",
                body_excerpt(&text)
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| SearchError::InvalidResponse(err.to_string()))?;
        parse_shopping(payload, limit)
    }
}

pub fn parse_shopping(
    mut payload: Value,
    limit: Option<usize>,
) -> Result<Vec<ProductMatch>, SearchError> {
    let shopping = payload
        .get_mut("shopping")
        .map(Value::take)
        .ok_or(SearchError::MissingResults)?;
    let mut items: Vec<ProductMatch> = serde_json::from_value(shopping)
        .map_err(|err| SearchError::InvalidResponse(err.to_string()))?;
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    Ok(items)
}
