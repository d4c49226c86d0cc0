use crate::{
    error::ServiceError,
    http::{body_excerpt, build_client},
    supabase::{SupabaseClient, SupabaseError},
};
use axum::body::Bytes;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

const MAX_REMOTE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported content type `{0}`")]
    UnsupportedType(String),
    #[error("upload is empty")]
    Empty,
    #[error("image exceeds {0} bytes")]
    TooLarge(usize),
    #[error("fetching source image failed: {0}")]
    Fetch(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] SupabaseError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        const STAGE: &str = "upload";
        match err {
            StorageError::UnsupportedType(_) | StorageError::Empty | StorageError::TooLarge(_) => {
                ServiceError::invalid_input(STAGE, err.to_string())
            }
            StorageError::Fetch(_) => ServiceError::upstream(STAGE, err.to_string()),
            StorageError::Backend(_) => ServiceError::internal(STAGE, err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
}

#[derive(Clone)]
struct MemoryBucket {
    objects: Arc<Mutex<HashMap<String, (String, Bytes)>>>,
    public_base: String,
}

impl MemoryBucket {
    fn new(public_base: &str) -> Self {
        Self {
            objects: Arc::default(),
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Clone)]
enum Backend {
    Memory(MemoryBucket),
    Supabase {
        client: SupabaseClient,
        bucket: String,
        public_base: Option<String>,
    },
}

/// Where uploaded and copied room photos live.
#[derive(Clone)]
pub struct ObjectStorage {
    backend: Backend,
    http: Client,
    max_remote_bytes: usize,
}

impl ObjectStorage {
    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            http: build_client(),
            max_remote_bytes: MAX_REMOTE_BYTES,
        }
    }

    /// Objects kept in process, served back under `{public_base}/uploads/`.
    pub fn memory(public_base: &str) -> Self {
        Self::with_backend(Backend::Memory(MemoryBucket::new(public_base)))
    }

    pub fn from_env() -> Self {
        let public_base = std::env::var("STORAGE_PUBLIC_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        match SupabaseClient::from_env() {
            Some(client) => Self::with_backend(Backend::Supabase {
                client,
                bucket: std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "designs".into()),
                public_base,
            }),
            None => {
                let port = std::env::var("PORT").unwrap_or_else(|_| "8000".into());
                let base = public_base.unwrap_or_else(|| format!("http://localhost:{port}"));
                Self::memory(&base)
            }
        }
    }

    #[cfg(test)]
    fn with_max_remote_bytes(mut self, limit: usize) -> Self {
        self.max_remote_bytes = limit;
        self
    }

    pub async fn put(
        &self,
        user_id: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<StoredObject, StorageError> {
        let content_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let ext = extension_for(&content_type)
            .ok_or_else(|| StorageError::UnsupportedType(content_type.clone()))?;
        if bytes.is_empty() {
            return Err(StorageError::Empty);
        }
        let key = object_key(user_id, ext);
        let url = match &self.backend {
            Backend::Memory(bucket) => {
                bucket
                    .objects
                    .lock()
                    .await
                    .insert(key.clone(), (content_type.clone(), bytes));
                format!("{}/uploads/{key}", bucket.public_base)
            }
            Backend::Supabase {
                client,
                bucket,
                public_base,
            } => {
                client
                    .upload_object(bucket, &key, &content_type, bytes.to_vec())
                    .await?;
                match public_base {
                    Some(base) => format!("{}/{key}", base.trim_end_matches('/')),
                    None => client.public_object_url(bucket, &key),
                }
            }
        };
        info!(target = "designgenius.storage", key = %key, "stored image");
        Ok(StoredObject { key, url })
    }

    /// Downloads a remote image and stores a copy. The body is read
    /// incrementally and abandoned once it passes the size cap.
    pub async fn copy_remote(
        &self,
        user_id: &str,
        source: &str,
    ) -> Result<StoredObject, StorageError> {
        let limit = self.max_remote_bytes;
        let response = self
            .http
            .get(source)
            .send()
            .await
            .map_err(|err| StorageError::Fetch(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Fetch(format!(
                "HTTP {status}: {}",
                body_excerpt(&body)
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            return Err(StorageError::TooLarge(limit));
        }
        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|err| StorageError::Fetch(err.to_string()))?;
            if body.len() + chunk.len() > limit {
                return Err(StorageError::TooLarge(limit));
            }
            body.extend_from_slice(&chunk);
        }
        self.put(user_id, &content_type, Bytes::from(body)).await
    }

    /// Reads back an object from the in-memory bucket.
    pub async fn get(&self, key: &str) -> Option<(String, Bytes)> {
        match &self.backend {
            Backend::Memory(bucket) => bucket.objects.lock().await.get(key).cloned(),
            Backend::Supabase { .. } => None,
        }
    }
}

pub fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/jpeg" | "image/jpg" => Some(".jpg"),
        "image/png" => Some(".png"),
        "image/webp" => Some(".webp"),
        "image/gif" => Some(".gif"),
        "image/heic" => Some(".heic"),
        "image/avif" => Some(".avif"),
        _ => None,
    }
}

/// `{user}_{millis}_{uuid}{ext}` with the user id reduced to url-safe chars.
pub fn object_key(user_id: &str, ext: &str) -> String {
    let owner: String = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    format!(
        "{owner}_{}_{}{ext}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_image_host, spawn_upstream};
    use axum::{Router, http::header, routing::get};

    #[test]
    fn keys_are_prefixed_by_owner() {
        let key = object_key("user_2ab/../x", ".png");
        assert!(key.starts_with("user_2abx_"));
        assert!(key.ends_with(".png"));
    }

    #[tokio::test]
    async fn memory_bucket_round_trips() {
        let storage = ObjectStorage::memory("http://localhost:8000/");
        let stored = storage
            .put("user_1", "image/jpeg; charset=binary", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();
        assert!(stored.url.starts_with("http://localhost:8000/uploads/user_1_"));
        let (content_type, bytes) = storage.get(&stored.key).await.unwrap();
        assert_eq!(content_type, "image/jpeg");
        assert_eq!(&bytes[..], b"jpeg");
    }

    #[tokio::test]
    async fn rejects_non_images_and_empty_bodies() {
        let storage = ObjectStorage::memory("http://localhost");
        let err = storage
            .put("u", "text/html", Bytes::from_static(b"<html>"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedType(_)));
        let err = storage.put("u", "image/png", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Empty));
    }

    #[tokio::test]
    async fn copies_remote_images() {
        let base = spawn_upstream(|_| {
            Router::new().route(
                "/room.webp",
                get(|| async { ([(header::CONTENT_TYPE, "image/webp")], "RIFFdata") }),
            )
        })
        .await;
        let storage = ObjectStorage::memory("http://localhost");
        let stored = storage
            .copy_remote("user_1", &format!("{base}/room.webp"))
            .await
            .unwrap();
        assert!(stored.key.ends_with(".webp"));

        let err = storage
            .copy_remote("user_1", &format!("{base}/missing.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fetch(_)));
    }

    #[tokio::test]
    async fn oversized_remote_images_are_refused() {
        let base = fake_image_host(256 * 1024).await;
        let storage = ObjectStorage::memory("http://localhost").with_max_remote_bytes(100 * 1024);

        let err = storage
            .copy_remote("user_1", &format!("{base}/declared.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TooLarge(limit) if limit == 100 * 1024));

        let err = storage
            .copy_remote("user_1", &format!("{base}/huge.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TooLarge(_)));

        let stored = storage
            .copy_remote("user_1", &format!("{base}/small.png"))
            .await
            .unwrap();
        let (_, bytes) = storage.get(&stored.key).await.unwrap();
        assert_eq!(bytes.len(), 16);
    }
}
