use crate::{
    error::ServiceError,
    metrics,
    supabase::{HistoryRow, SupabaseClient, SupabaseError, UserRow},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_CREDITS: u32 = 5;

const CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub email: Option<String>,
    pub credits: u32,
}

impl From<UserRow> for UserAccount {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            credits: u32::try_from(row.credits.max(0)).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub user_id: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl From<HistoryRow> for HistoryEntry {
    fn from(row: HistoryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            image_url: row.image_url,
            created_at: row.created_at,
        }
    }
}

impl From<&HistoryEntry> for HistoryRow {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            id: entry.id,
            user_id: entry.user_id.clone(),
            image_url: entry.image_url.clone(),
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user `{0}` not found")]
    UserNotFound(String),
    #[error("insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: u32, requested: u32 },
    #[error("history entry not found")]
    EntryNotFound,
    #[error("balance changed concurrently too many times")]
    Contention,
    #[error("store backend error: {0}")]
    Backend(#[from] SupabaseError),
}

impl StoreError {
    pub fn service_error(self, stage: &'static str) -> ServiceError {
        match self {
            StoreError::UserNotFound(_) | StoreError::EntryNotFound => {
                ServiceError::not_found(stage, "not_found")
            }
            StoreError::InsufficientCredits { .. } => {
                ServiceError::insufficient_credits(stage, self.to_string())
            }
            StoreError::Contention | StoreError::Backend(_) => {
                ServiceError::internal(stage, self.to_string())
            }
        }
    }
}

#[derive(Default)]
struct MemoryTables {
    users: HashMap<String, UserAccount>,
    history: Vec<HistoryEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
}

/// Accounts, balances and generation history.
#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    Supabase(SupabaseClient),
}

impl Store {
    pub fn from_env() -> Self {
        match SupabaseClient::from_env() {
            Some(client) => {
                info!(target = "designgenius.store", "using supabase store");
                Store::Supabase(client)
            }
            None => {
                warn!(
                    target = "designgenius.store",
                    "SUPABASE_URL not set; accounts and history are kept in memory"
                );
                Store::memory()
            }
        }
    }

    pub fn memory() -> Self {
        Store::Memory(MemoryStore::default())
    }

    /// Returns the account, creating it with the starting balance if absent.
    pub async fn ensure_user(
        &self,
        id: &str,
        email: Option<&str>,
    ) -> Result<UserAccount, StoreError> {
        match self {
            Store::Memory(mem) => {
                let mut tables = mem.tables.lock().await;
                let account = tables
                    .users
                    .entry(id.to_string())
                    .or_insert_with(|| UserAccount {
                        id: id.to_string(),
                        email: email.map(str::to_string),
                        credits: DEFAULT_CREDITS,
                    });
                if account.email.is_none() {
                    account.email = email.map(str::to_string);
                }
                Ok(account.clone())
            }
            Store::Supabase(client) => {
                if let Some(row) = client.fetch_user(id).await? {
                    return Ok(row.into());
                }
                let row = UserRow {
                    id: id.to_string(),
                    email: email.map(str::to_string),
                    credits: DEFAULT_CREDITS as i64,
                };
                match client.insert_user(&row).await? {
                    Some(created) => Ok(created.into()),
                    None => client
                        .fetch_user(id)
                        .await?
                        .map(UserAccount::from)
                        .ok_or_else(|| StoreError::UserNotFound(id.to_string())),
                }
            }
        }
    }

    pub async fn get_user(&self, id: &str) -> Result<UserAccount, StoreError> {
        let found = match self {
            Store::Memory(mem) => mem.tables.lock().await.users.get(id).cloned(),
            Store::Supabase(client) => client.fetch_user(id).await?.map(UserAccount::from),
        };
        found.ok_or_else(|| StoreError::UserNotFound(id.to_string()))
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        let needle = email.trim();
        match self {
            Store::Memory(mem) => Ok(mem
                .tables
                .lock()
                .await
                .users
                .values()
                .find(|user| {
                    user.email
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case(needle))
                })
                .cloned()),
            Store::Supabase(client) => Ok(client
                .fetch_user_by_email(needle)
                .await?
                .map(UserAccount::from)),
        }
    }

    /// Removes the account and its history.
    pub async fn delete_user(&self, id: &str) -> Result<bool, StoreError> {
        match self {
            Store::Memory(mem) => {
                let mut tables = mem.tables.lock().await;
                tables.history.retain(|entry| entry.user_id != id);
                Ok(tables.users.remove(id).is_some())
            }
            Store::Supabase(client) => Ok(client.delete_user(id).await?),
        }
    }

    /// Takes one credit for an in-flight generation.
    pub async fn reserve_credit(&self, id: &str) -> Result<u32, StoreError> {
        let balance = self.adjust(id, -1).await?;
        metrics::credits_changed(id, -1, "reserve");
        Ok(balance)
    }

    /// Returns a reserved credit after a failed generation.
    pub async fn release_credit(&self, id: &str) -> Result<u32, StoreError> {
        let balance = self.adjust(id, 1).await?;
        metrics::credits_changed(id, 1, "release");
        Ok(balance)
    }

    pub async fn deduct(&self, id: &str, amount: u32) -> Result<u32, StoreError> {
        let balance = self.adjust(id, -i64::from(amount)).await?;
        metrics::credits_changed(id, -i64::from(amount), "deduct");
        Ok(balance)
    }

    pub async fn grant(&self, id: &str, amount: u32) -> Result<u32, StoreError> {
        let balance = self.adjust(id, i64::from(amount)).await?;
        metrics::credits_changed(id, i64::from(amount), "grant");
        Ok(balance)
    }

    /// Applies `delta` to the balance; never lets it go negative.
    async fn adjust(&self, id: &str, delta: i64) -> Result<u32, StoreError> {
        match self {
            Store::Memory(mem) => {
                let mut tables = mem.tables.lock().await;
                let account = tables
                    .users
                    .get_mut(id)
                    .ok_or_else(|| StoreError::UserNotFound(id.to_string()))?;
                let next = next_balance(account.credits, delta)?;
                account.credits = next;
                Ok(next)
            }
            Store::Supabase(client) => {
                for _ in 0..CAS_ATTEMPTS {
                    let current = client
                        .fetch_user(id)
                        .await?
                        .ok_or_else(|| StoreError::UserNotFound(id.to_string()))?;
                    let balance = u32::try_from(current.credits.max(0)).unwrap_or(u32::MAX);
                    let next = next_balance(balance, delta)?;
                    if let Some(row) = client
                        .update_credits_if(id, current.credits, i64::from(next))
                        .await?
                    {
                        return Ok(UserAccount::from(row).credits);
                    }
                }
                Err(StoreError::Contention)
            }
        }
    }

    /// Newest first.
    pub async fn list_history(&self, user_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        match self {
            Store::Memory(mem) => {
                let tables = mem.tables.lock().await;
                let mut entries: Vec<HistoryEntry> = tables
                    .history
                    .iter()
                    .rev()
                    .filter(|entry| entry.user_id == user_id)
                    .cloned()
                    .collect();
                entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(entries)
            }
            Store::Supabase(client) => Ok(client
                .list_history(user_id)
                .await?
                .into_iter()
                .map(HistoryEntry::from)
                .collect()),
        }
    }

    pub async fn create_history(
        &self,
        user_id: &str,
        image_url: &str,
    ) -> Result<HistoryEntry, StoreError> {
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            image_url: image_url.to_string(),
            created_at: Utc::now(),
        };
        match self {
            Store::Memory(mem) => {
                mem.tables.lock().await.history.push(entry.clone());
                Ok(entry)
            }
            Store::Supabase(client) => Ok(client
                .insert_history(&HistoryRow::from(&entry))
                .await?
                .into()),
        }
    }

    /// Deletes one entry owned by `user_id`. Entries owned by someone else
    /// are reported as missing.
    pub async fn delete_history(&self, user_id: &str, id: Uuid) -> Result<(), StoreError> {
        let deleted = self.delete_history_many(user_id, &[id]).await?;
        if deleted.is_empty() {
            return Err(StoreError::EntryNotFound);
        }
        Ok(())
    }

    /// Deletes the caller's entries among `ids`; unknown or foreign ids are
    /// skipped. Returns the removed ids.
    pub async fn delete_history_many(
        &self,
        user_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        match self {
            Store::Memory(mem) => {
                let mut tables = mem.tables.lock().await;
                let mut removed = Vec::new();
                tables.history.retain(|entry| {
                    let hit = entry.user_id == user_id && ids.contains(&entry.id);
                    if hit {
                        removed.push(entry.id);
                    }
                    !hit
                });
                Ok(removed)
            }
            Store::Supabase(client) => Ok(client.delete_history(user_id, ids).await?),
        }
    }
}

fn next_balance(balance: u32, delta: i64) -> Result<u32, StoreError> {
    let next = i64::from(balance) + delta;
    if next < 0 {
        return Err(StoreError::InsufficientCredits {
            balance,
            requested: u32::try_from(-delta).unwrap_or(u32::MAX),
        });
    }
    Ok(u32::try_from(next).unwrap_or(u32::MAX))
}
