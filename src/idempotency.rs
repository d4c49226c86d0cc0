use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

const IN_FLIGHT: &str = "__in_flight__";

/// Redis key for a replayable response, scoped to the caller.
pub fn cache_key(scope: &str, key: &str) -> String {
    format!("designgenius:idem:{scope}:{key}")
}

pub fn ttl_from_env() -> Duration {
    let secs = std::env::var("IDEMPOTENCY_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3600);
    Duration::from_secs(secs)
}

/// Result of claiming a key before running the work it guards.
#[derive(Debug)]
pub enum Claim<T> {
    /// The caller owns the key and must `complete` or `release` it.
    Acquired,
    /// Another request holds the key and has not finished yet.
    InFlight,
    Replay(T),
}

#[derive(Debug, Clone)]
enum Slot {
    InFlight,
    Done(String),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

/// Claims and stored responses, in redis when configured and in process
/// memory otherwise (or while redis is unreachable).
#[derive(Clone, Default)]
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    memory: Arc<Mutex<HashMap<String, Entry>>>,
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>) -> Self {
        Self {
            redis,
            memory: Arc::default(),
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        Self::new(redis)
    }

    pub async fn claim<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Claim<T> {
        if let Some(client) = &self.redis {
            match redis_claim(client, key, ttl).await {
                Ok(claim) => return claim,
                Err(err) => warn!(
                    target = "designgenius.idempotency",
                    error = %err,
                    "redis unavailable, claiming in memory"
                ),
            }
        }
        self.memory_claim(key, ttl).await
    }

    /// Stores the response for replay and ends the claim.
    pub async fn complete<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(err) => {
                warn!(target = "designgenius.idempotency", error = %err, "response not cacheable");
                self.release(key).await;
                return;
            }
        };
        if let Some(client) = &self.redis
            && let Err(err) = redis_store(client, key, &json, ttl).await
        {
            warn!(target = "designgenius.idempotency", error = %err, "redis store failed");
        }
        if let Some(entry) = self.memory.lock().await.get_mut(key) {
            entry.slot = Slot::Done(json);
            entry.expires_at = Instant::now() + ttl;
        }
    }

    /// Drops an unfinished claim so the key can be retried.
    pub async fn release(&self, key: &str) {
        if let Some(client) = &self.redis
            && let Err(err) = redis_release(client, key).await
        {
            warn!(target = "designgenius.idempotency", error = %err, "redis release failed");
        }
        let mut memory = self.memory.lock().await;
        if matches!(memory.get(key), Some(Entry { slot: Slot::InFlight, .. })) {
            memory.remove(key);
        }
    }

    async fn memory_claim<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Claim<T> {
        let now = Instant::now();
        let mut memory = self.memory.lock().await;
        memory.retain(|_, entry| entry.expires_at > now);
        match memory.get(key).map(|entry| entry.slot.clone()) {
            Some(Slot::InFlight) => Claim::InFlight,
            Some(Slot::Done(json)) => decode_stored(&json),
            None => {
                memory.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::InFlight,
                        expires_at: now + ttl,
                    },
                );
                Claim::Acquired
            }
        }
    }

    #[cfg(test)]
    async fn memory_len(&self) -> usize {
        self.memory.lock().await.len()
    }
}

fn decode_stored<T: DeserializeOwned>(json: &str) -> Claim<T> {
    match serde_json::from_str(json) {
        Ok(value) => Claim::Replay(value),
        Err(err) => {
            warn!(target = "designgenius.idempotency", error = %err, "stored response unreadable");
            Claim::InFlight
        }
    }
}

async fn redis_claim<T: DeserializeOwned>(
    client: &redis::Client,
    key: &str,
    ttl: Duration,
) -> redis::RedisResult<Claim<T>> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let claimed: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(IN_FLIGHT)
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .query_async(&mut conn)
        .await?;
    if claimed.is_some() {
        return Ok(Claim::Acquired);
    }
    let stored: Option<String> = conn.get(key).await?;
    Ok(match stored.as_deref() {
        Some(IN_FLIGHT) | None => Claim::InFlight,
        Some(json) => decode_stored(json),
    })
}

async fn redis_store(
    client: &redis::Client,
    key: &str,
    json: &str,
    ttl: Duration,
) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.set_ex(key, json, ttl.as_secs().max(1)).await
}

async fn redis_release(client: &redis::Client, key: &str) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let stored: Option<String> = conn.get(key).await?;
    if stored.as_deref() == Some(IN_FLIGHT) {
        let _: i64 = conn.del(key).await?;
    }
    Ok(())
}
