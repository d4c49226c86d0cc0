use crate::http::{body_excerpt, build_client};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub credits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: Uuid,
    pub user_id: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, &service_key))
    }

    fn rest(&self, table: &str, query: &str) -> String {
        format!("{}/rest/v1/{table}?{query}", self.base_url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, SupabaseError> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupabaseError::Status {
                status: status.as_u16(),
                body: body_excerpt(&body),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    pub async fn fetch_user(&self, id: &str) -> Result<Option<UserRow>, SupabaseError> {
        let url = self.rest(
            "users",
            &format!("id=eq.{}&select=*&limit=1", urlencoding::encode(id)),
        );
        let mut rows: Vec<UserRow> = self.send(self.http.get(url)).await?;
        Ok(rows.pop())
    }

    pub async fn fetch_user_by_email(&self, email: &str) -> Result<Option<UserRow>, SupabaseError> {
        let url = self.rest(
            "users",
            &format!("email=eq.{}&select=*&limit=1", urlencoding::encode(email)),
        );
        let mut rows: Vec<UserRow> = self.send(self.http.get(url)).await?;
        Ok(rows.pop())
    }

    /// Inserts unless the id exists; `None` means a row was already there.
    pub async fn insert_user(&self, row: &UserRow) -> Result<Option<UserRow>, SupabaseError> {
        let url = self.rest("users", "on_conflict=id");
        let mut rows: Vec<UserRow> = self
            .send(
                self.http
                    .post(url)
                    .header("Prefer", "resolution=ignore-duplicates,return=representation")
                    .json(&[row]),
            )
            .await?;
        Ok(rows.pop())
    }

    pub async fn delete_user(&self, id: &str) -> Result<bool, SupabaseError> {
        let encoded = urlencoding::encode(id);
        let _: Vec<HistoryRow> = self
            .send(
                self.http
                    .delete(self.rest("room_history", &format!("user_id=eq.{encoded}")))
                    .header("Prefer", "return=representation"),
            )
            .await?;
        let rows: Vec<UserRow> = self
            .send(
                self.http
                    .delete(self.rest("users", &format!("id=eq.{encoded}")))
                    .header("Prefer", "return=representation"),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Compare-and-swap on the balance. `None` when the stored balance no
    /// longer equals `expected`.
    pub async fn update_credits_if(
        &self,
        id: &str,
        expected: i64,
        next: i64,
    ) -> Result<Option<UserRow>, SupabaseError> {
        let url = self.rest(
            "users",
            &format!("id=eq.{}&credits=eq.{expected}", urlencoding::encode(id)),
        );
        let mut rows: Vec<UserRow> = self
            .send(
                self.http
                    .patch(url)
                    .header("Prefer", "return=representation")
                    .json(&json!({"credits": next})),
            )
            .await?;
        Ok(rows.pop())
    }

    pub async fn list_history(&self, user_id: &str) -> Result<Vec<HistoryRow>, SupabaseError> {
        let url = self.rest(
            "room_history",
            &format!(
                "user_id=eq.{}&select=*&order=created_at.desc",
                urlencoding::encode(user_id)
            ),
        );
        self.send(self.http.get(url)).await
    }

    pub async fn insert_history(&self, row: &HistoryRow) -> Result<HistoryRow, SupabaseError> {
        let mut rows: Vec<HistoryRow> = self
            .send(
                self.http
                    .post(self.rest("room_history", "select=*"))
                    .header("Prefer", "return=representation")
                    .json(&[row]),
            )
            .await?;
        rows.pop()
            .ok_or_else(|| SupabaseError::Deserialize("insert returned no rows".into()))
    }

    /// Deletes the caller's rows among `ids`; returns the ids actually removed.
    pub async fn delete_history(
        &self,
        user_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, SupabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.rest(
            "room_history",
            &format!(
                "user_id=eq.{}&id=in.({list})",
                urlencoding::encode(user_id)
            ),
        );
        let rows: Vec<HistoryRow> = self
            .send(
                self.http
                    .delete(url)
                    .header("Prefer", "return=representation"),
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    pub async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), SupabaseError> {
        let url = format!(
            "{}/storage/v1/object/{bucket}/{}",
            self.base_url,
            urlencoding::encode(key)
        );
        let _: serde_json::Value = self
            .send(
                self.http
                    .post(url)
                    .header("Content-Type", content_type)
                    .header("x-upsert", "false")
                    .body(bytes),
            )
            .await?;
        Ok(())
    }

    pub fn public_object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{bucket}/{}",
            self.base_url,
            urlencoding::encode(key)
        )
    }
}
