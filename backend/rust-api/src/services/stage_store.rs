use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::metrics::{record_cache_hit, record_cache_miss, track_cache_operation};
use crate::models::stage::STAGE_RECORD_VERSION;
use crate::models::{StageKey, StageRecord};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

/// Session-scoped storage of serialized stage records.
#[async_trait]
pub trait StageStore: Send + Sync {
    async fn load_raw(&self, key: &StageKey) -> Result<Option<String>>;
    async fn save_raw(&self, key: &StageKey, json: String) -> Result<()>;
    async fn clear(&self, key: &StageKey) -> Result<()>;
}

pub struct RedisStageStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisStageStore {
    pub fn new(redis: ConnectionManager, ttl_seconds: u64) -> Self {
        Self { redis, ttl_seconds }
    }
}

#[async_trait]
impl StageStore for RedisStageStore {
    async fn load_raw(&self, key: &StageKey) -> Result<Option<String>> {
        let cache_key = key.cache_key();
        retry_async_with_config(RetryConfig::default(), || async {
            let mut conn = self.redis.clone();
            track_cache_operation("get", async {
                redis::cmd("GET")
                    .arg(&cache_key)
                    .query_async::<Option<String>>(&mut conn)
                    .await
                    .context("Failed to load stage from Redis")
            })
            .await
        })
        .await
    }

    async fn save_raw(&self, key: &StageKey, json: String) -> Result<()> {
        let mut conn = self.redis.clone();
        let cache_key = key.cache_key();
        track_cache_operation("setex", async {
            redis::cmd("SETEX")
                .arg(&cache_key)
                .arg(self.ttl_seconds)
                .arg(json)
                .query_async::<()>(&mut conn)
                .await
                .context("Failed to save stage to Redis")
        })
        .await
    }

    async fn clear(&self, key: &StageKey) -> Result<()> {
        let mut conn = self.redis.clone();
        let cache_key = key.cache_key();
        track_cache_operation("del", async {
            redis::cmd("DEL")
                .arg(&cache_key)
                .query_async::<()>(&mut conn)
                .await
                .context("Failed to delete stage from Redis")
        })
        .await
    }
}

/// Process-local stage store with the same TTL semantics as Redis.
pub struct InMemoryStageStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl InMemoryStageStore {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_seconds),
        }
    }

    /// Overwrites the raw payload; used to simulate corrupted sessions.
    pub fn put_raw(&self, key: &StageKey, json: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("stage store lock poisoned"))?;
        entries.insert(key.cache_key(), (json.to_string(), Instant::now() + self.ttl));
        Ok(())
    }
}

#[async_trait]
impl StageStore for InMemoryStageStore {
    async fn load_raw(&self, key: &StageKey) -> Result<Option<String>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("stage store lock poisoned"))?;
        let cache_key = key.cache_key();
        match entries.get(&cache_key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(&cache_key);
                Ok(None)
            }
            Some((json, _)) => Ok(Some(json.clone())),
            None => Ok(None),
        }
    }

    async fn save_raw(&self, key: &StageKey, json: String) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("stage store lock poisoned"))?;
        entries.insert(key.cache_key(), (json, Instant::now() + self.ttl));
        Ok(())
    }

    async fn clear(&self, key: &StageKey) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("stage store lock poisoned"))?;
        entries.remove(&key.cache_key());
        Ok(())
    }
}

/// The stage record of one cycle, loaded once per request.
///
/// Mutations stay local until [`StageHandle::store`] flushes them.
pub struct StageHandle {
    key: StageKey,
    store: Arc<dyn StageStore>,
    record: Option<StageRecord>,
    dirty: bool,
}

impl StageHandle {
    pub async fn open(store: Arc<dyn StageStore>, key: StageKey) -> Result<Self> {
        let raw = store.load_raw(&key).await?;
        if raw.is_some() {
            record_cache_hit();
        } else {
            record_cache_miss();
        }

        let record = match raw {
            Some(json) => match serde_json::from_str::<StageRecord>(&json) {
                Ok(record) if record.version == STAGE_RECORD_VERSION => Some(record),
                Ok(record) => {
                    tracing::warn!(
                        "Discarding stage {} with version {} (expected {})",
                        key.cache_key(),
                        record.version,
                        STAGE_RECORD_VERSION
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!("Discarding unreadable stage {}: {}", key.cache_key(), e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            key,
            store,
            record,
            dirty: false,
        })
    }

    pub fn get(&self) -> Option<&StageRecord> {
        self.record.as_ref()
    }

    /// Applies `f` to the record, creating an empty one if none exists yet.
    pub fn update<F>(&mut self, f: F)
    where
        F: FnOnce(&mut StageRecord),
    {
        let record = self.record.get_or_insert_with(StageRecord::default);
        f(record);
        self.dirty = true;
    }

    pub async fn store(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(record) = &self.record {
            let json = serde_json::to_string(record).context("Failed to serialize stage")?;
            self.store.save_raw(&self.key, json).await?;
        }
        self.dirty = false;
        Ok(())
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.record = None;
        self.dirty = false;
        self.store.clear(&self.key).await
    }
}
