//! Two-tier response cache backed by a durable key-value table.
//!
//! Entries live in a bounded LRU tier or an unbounded pinned tier, selected
//! per request. Every in-memory mutation has a matching row operation, so
//! after `init` the memory state is a full mirror of the database. Database
//! errors never surface to callers; the in-memory view stays authoritative
//! until the next process restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::lru::LruMap;

pub const DEFAULT_LRU_CAPACITY: usize = 100;
const SCHEMA_VERSION: i64 = 1000;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub is_lru: bool,
    pub created_at: DateTime<Utc>,
    pub duration: Option<Duration>,
}

impl CacheEntry {
    /// Expired iff a duration is set and `created_at + duration` is in the
    /// past. Entries without a duration never expire.
    pub fn is_expired(&self) -> bool {
        match self.duration {
            Some(duration) => {
                let ttl = chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX);
                Utc::now().signed_duration_since(self.created_at) > ttl
            }
            None => false,
        }
    }
}

struct Tiers {
    lru: LruMap<String, CacheEntry>,
    pinned: HashMap<String, CacheEntry>,
}

pub struct CacheStore {
    state: Mutex<Tiers>,
    /// Keys evicted from the LRU tier, awaiting row deletion. Filled by the
    /// eviction handler, drained after every mutation.
    pending_deletes: Arc<Mutex<Vec<String>>>,
    pool: Arc<OnceLock<SqlitePool>>,
    initialized: AtomicBool,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LRU_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let pending_deletes: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = pending_deletes.clone();
        let lru = LruMap::with_eviction_handler(capacity, move |key: &String, _: &CacheEntry| {
            sink.lock().push(key.clone());
        });

        Self {
            state: Mutex::new(Tiers {
                lru,
                pinned: HashMap::new(),
            }),
            pending_deletes,
            pool: Arc::new(OnceLock::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Open the database, create the schema, and mirror all persisted rows
    /// into the two tiers. Until this completes every public operation is a
    /// no-op returning none.
    pub async fn init(&self, database_url: &str) -> anyhow::Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        // A single connection serializes row writes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                id VARCHAR(64) PRIMARY KEY,
                data TEXT NOT NULL,
                is_lru TINYINT NOT NULL,
                create_time VARCHAR(32) NOT NULL,
                duration INTEGER NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&pool)
            .await?;

        // One scan per tier.
        let lru_rows = Self::fetch_tier(&pool, true).await?;
        let pinned_rows = Self::fetch_tier(&pool, false).await?;
        {
            let mut state = self.state.lock();
            for entry in lru_rows {
                state.lru.insert(entry.key.clone(), entry);
            }
            for entry in pinned_rows {
                state.pinned.insert(entry.key.clone(), entry);
            }
        }

        let _ = self.pool.set(pool);
        self.initialized.store(true, Ordering::SeqCst);

        // Rows beyond LRU capacity were evicted during the mirror scan.
        self.flush_evictions().await;
        debug!("cache store initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Store a payload under `key` in the selected tier, stamping it with the
    /// current time. Tier identity is immutable per key; a save never
    /// migrates an entry out of the other tier.
    pub async fn save(&self, key: &str, data: Value, duration: Option<Duration>, use_lru: bool) {
        if !self.is_initialized() {
            return;
        }

        let key = key.to_ascii_lowercase();
        let entry = CacheEntry {
            key: key.clone(),
            data,
            is_lru: use_lru,
            created_at: Utc::now(),
            duration,
        };

        {
            let mut state = self.state.lock();
            if use_lru {
                state.lru.insert(key.clone(), entry.clone());
            } else {
                state.pinned.insert(key.clone(), entry.clone());
            }
        }

        self.flush_evictions().await;
        self.upsert_row(&entry).await;
    }

    /// Look up a payload in the selected tier. Expired entries are removed
    /// from memory and the database and report a miss. Hits refresh the LRU
    /// order.
    pub async fn load(&self, key: &str, use_lru: bool) -> Option<Value> {
        if !self.is_initialized() {
            return None;
        }

        let key = key.to_ascii_lowercase();
        let (hit, expired) = {
            let mut state = self.state.lock();
            if use_lru {
                match state.lru.get(&key) {
                    Some(entry) if entry.is_expired() => {
                        state.lru.remove(&key);
                        (None, true)
                    }
                    Some(entry) => (Some(entry.data.clone()), false),
                    None => (None, false),
                }
            } else {
                match state.pinned.get(&key) {
                    Some(entry) if entry.is_expired() => {
                        state.pinned.remove(&key);
                        (None, true)
                    }
                    Some(entry) => (Some(entry.data.clone()), false),
                    None => (None, false),
                }
            }
        };

        if expired {
            self.delete_row(&key).await;
        }
        hit
    }

    /// Truncate both tiers and the backing table.
    pub async fn clear(&self) {
        if !self.is_initialized() {
            return;
        }

        {
            let mut state = self.state.lock();
            state.lru.clear();
            state.pinned.clear();
        }

        if let Some(pool) = self.pool.get() {
            if let Err(error) = sqlx::query("DELETE FROM cache").execute(pool).await {
                warn!(error = %error, "failed to truncate cache table");
            }
        }
    }

    /// Close the database pool. In-memory state is dropped with the store.
    pub async fn release(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    pub fn contains(&self, key: &str, use_lru: bool) -> bool {
        let key = key.to_ascii_lowercase();
        let state = self.state.lock();
        if use_lru {
            state.lru.contains_key(&key)
        } else {
            state.pinned.contains_key(&key)
        }
    }

    pub fn entry_count(&self) -> usize {
        let state = self.state.lock();
        state.lru.len() + state.pinned.len()
    }

    async fn fetch_tier(pool: &SqlitePool, is_lru: bool) -> anyhow::Result<Vec<CacheEntry>> {
        let rows = sqlx::query("SELECT id, data, create_time, duration FROM cache WHERE is_lru = ?")
            .bind(is_lru as i64)
            .fetch_all(pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("id");
            let data = match serde_json::from_str(row.get::<String, _>("data").as_str()) {
                Ok(value) => value,
                Err(error) => {
                    warn!(key = %key, error = %error, "dropping unreadable cache row");
                    continue;
                }
            };
            let created_at = match DateTime::parse_from_rfc3339(row.get::<String, _>("create_time").as_str()) {
                Ok(ts) => ts.with_timezone(&Utc),
                Err(error) => {
                    warn!(key = %key, error = %error, "dropping cache row with bad timestamp");
                    continue;
                }
            };
            let duration = row
                .get::<Option<i64>, _>("duration")
                .map(|secs| Duration::from_secs(secs.max(0) as u64));

            entries.push(CacheEntry {
                key,
                data,
                is_lru,
                created_at,
                duration,
            });
        }
        Ok(entries)
    }

    async fn upsert_row(&self, entry: &CacheEntry) {
        let Some(pool) = self.pool.get() else {
            return;
        };

        let data = match serde_json::to_string(&entry.data) {
            Ok(json) => json,
            Err(error) => {
                warn!(key = %entry.key, error = %error, "cache payload not serializable");
                return;
            }
        };
        let create_time = entry.created_at.to_rfc3339();
        let duration = entry.duration.map(|d| d.as_secs() as i64);

        let inserted = sqlx::query(
            "INSERT INTO cache (id, data, is_lru, create_time, duration) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.key)
        .bind(&data)
        .bind(entry.is_lru as i64)
        .bind(&create_time)
        .bind(duration)
        .execute(pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                let updated = sqlx::query(
                    "UPDATE cache SET data = ?, is_lru = ?, create_time = ?, duration = ? WHERE id = ?",
                )
                .bind(&data)
                .bind(entry.is_lru as i64)
                .bind(&create_time)
                .bind(duration)
                .bind(&entry.key)
                .execute(pool)
                .await;
                if let Err(error) = updated {
                    warn!(key = %entry.key, error = %error, "failed to update cache row");
                }
            }
            Err(error) => {
                warn!(key = %entry.key, error = %error, "failed to insert cache row");
            }
        }
    }

    async fn delete_row(&self, key: &str) {
        let Some(pool) = self.pool.get() else {
            return;
        };
        if let Err(error) = sqlx::query("DELETE FROM cache WHERE id = ?")
            .bind(key)
            .execute(pool)
            .await
        {
            warn!(key = %key, error = %error, "failed to delete cache row");
        }
    }

    async fn flush_evictions(&self) {
        let keys: Vec<String> = std::mem::take(&mut *self.pending_deletes.lock());
        for key in keys {
            self.delete_row(&key).await;
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
