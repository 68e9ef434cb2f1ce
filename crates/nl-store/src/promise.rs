//! Durable per-business queue of requests awaiting a successful response.
//!
//! Enlisted requests are serialized to a `promise` table keyed by their
//! UUIDv5 promise key and rehydrated on `init`, so they survive process
//! restarts and can be replayed until they complete without an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use nl_common::{
    Body, CacheSettings, ContentType, HttpMethod, MockSettings, PromiseSettings, Request,
    ResponseType, RetryConfig, RetryPolicy,
};

const SCHEMA_VERSION: i64 = 1000;

pub struct PromiseStore {
    /// Per-business lists in insertion order.
    state: Mutex<HashMap<String, Vec<Request>>>,
    pool: OnceLock<SqlitePool>,
    initialized: AtomicBool,
}

impl PromiseStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            pool: OnceLock::new(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Open the database and rehydrate every persisted request, grouped by
    /// business identifier.
    pub async fn init(&self, database_url: &str) -> anyhow::Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS promise (
                id VARCHAR(64) PRIMARY KEY,
                business_id VARCHAR(64) NOT NULL,
                path VARCHAR(128) NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_promise_business_path ON promise (business_id, path)")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&pool)
            .await?;

        let rows = sqlx::query("SELECT id, business_id, data FROM promise ORDER BY rowid")
            .fetch_all(&pool)
            .await?;
        {
            let mut state = self.state.lock();
            for row in rows {
                let id: String = row.get("id");
                let business: String = row.get("business_id");
                let stored: StoredRequest =
                    match serde_json::from_str(row.get::<String, _>("data").as_str()) {
                        Ok(stored) => stored,
                        Err(error) => {
                            warn!(key = %id, error = %error, "dropping unreadable promise row");
                            continue;
                        }
                    };
                state.entry(business).or_default().push(stored.into_request());
            }
        }

        let _ = self.pool.set(pool);
        self.initialized.store(true, Ordering::SeqCst);
        debug!("promise store initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Persist an enlisted request. The request must already carry its
    /// promise key and a serializable body.
    pub async fn save(&self, request: &Request) -> anyhow::Result<()> {
        if !self.is_initialized() {
            bail!("promise store not initialized");
        }

        let stored = StoredRequest::from_request(request)?;
        let key = stored.promise.key.clone();
        let payload = serde_json::to_string(&stored).context("serializing request")?;

        {
            let mut state = self.state.lock();
            let list = state.entry(request.business.clone()).or_default();
            match list.iter_mut().find(|r| r.promise.key().as_deref() == Some(key.as_str())) {
                Some(slot) => *slot = request.clone(),
                None => list.push(request.clone()),
            }
        }

        self.upsert_row(&key, &request.business, &request.api_path, &payload)
            .await;
        Ok(())
    }

    /// All pending requests for a business, or the subset whose `api_path`
    /// is in `paths` when the filter is non-empty. Insertion order is kept.
    pub fn business_requests(&self, business: &str, paths: &[String]) -> Vec<Request> {
        let state = self.state.lock();
        let Some(list) = state.get(business) else {
            return Vec::new();
        };
        if paths.is_empty() {
            return list.clone();
        }
        list.iter()
            .filter(|r| paths.iter().any(|p| p == &r.api_path))
            .cloned()
            .collect()
    }

    /// Drop a completed enlistment by promise key.
    pub async fn delete(&self, business: &str, promise_key: &str) {
        if !self.is_initialized() {
            return;
        }

        {
            let mut state = self.state.lock();
            if let Some(list) = state.get_mut(business) {
                list.retain(|r| r.promise.key().as_deref() != Some(promise_key));
            }
        }

        if let Some(pool) = self.pool.get() {
            if let Err(error) = sqlx::query("DELETE FROM promise WHERE id = ?")
                .bind(promise_key)
                .execute(pool)
                .await
            {
                warn!(key = %promise_key, error = %error, "failed to delete promise row");
            }
        }
    }

    /// Drop all in-memory lists and truncate the table.
    pub async fn clear(&self) {
        if !self.is_initialized() {
            return;
        }

        self.state.lock().clear();
        if let Some(pool) = self.pool.get() {
            if let Err(error) = sqlx::query("DELETE FROM promise").execute(pool).await {
                warn!(error = %error, "failed to truncate promise table");
            }
        }
    }

    pub async fn release(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    async fn upsert_row(&self, key: &str, business: &str, path: &str, payload: &str) {
        let Some(pool) = self.pool.get() else {
            return;
        };

        let inserted = sqlx::query("INSERT INTO promise (id, business_id, path, data) VALUES (?, ?, ?, ?)")
            .bind(key)
            .bind(business)
            .bind(path)
            .bind(payload)
            .execute(pool)
            .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                let updated = sqlx::query("UPDATE promise SET business_id = ?, path = ?, data = ? WHERE id = ?")
                    .bind(business)
                    .bind(path)
                    .bind(payload)
                    .bind(key)
                    .execute(pool)
                    .await;
                if let Err(error) = updated {
                    warn!(key = %key, error = %error, "failed to update promise row");
                }
            }
            Err(error) => {
                warn!(key = %key, error = %error, "failed to insert promise row");
            }
        }
    }
}

impl Default for PromiseStore {
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

/// The durable form of a request. Only identity and configuration are
/// recorded; runtime state (completion slot, attempt count, cancel token,
/// start time) is rebuilt fresh on rehydration.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRequest {
    business_identifier: String,
    method: HttpMethod,
    api_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path_param: Option<String>,
    #[serde(default)]
    query_params: Map<String, Value>,
    content_type: ContentType,
    response_type: ResponseType,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    send_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    receive_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<StoredBody>,
    retry: StoredRetry,
    cache: StoredCache,
    promise: StoredPromise,
    mock: StoredMock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra_tag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
enum StoredBody {
    Json(Map<String, Value>),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRetry {
    policy: u8,
    max: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCache {
    enable: bool,
    use_lru: bool,
    ignore_once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPromise {
    enable: bool,
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMock {
    enable: bool,
    project_id: i64,
    origin_path: String,
}

impl StoredRequest {
    fn from_request(request: &Request) -> anyhow::Result<Self> {
        let body = match &request.body {
            Body::Empty => None,
            Body::Json(map) => Some(StoredBody::Json(map.clone())),
            Body::Text(text) => Some(StoredBody::Text(text.clone())),
            Body::Stream(_) => bail!("streaming bodies are not persistable"),
        };
        let Some(key) = request.promise.key() else {
            bail!("request has no promise key");
        };

        Ok(Self {
            business_identifier: request.business.clone(),
            method: request.method,
            api_path: request.api_path.clone(),
            path_param: request.path_param.clone(),
            query_params: request.query.clone(),
            content_type: request.content_type,
            response_type: request.response_type,
            headers: request.headers.clone(),
            send_timeout_ms: request.send_timeout.map(|d| d.as_millis() as u64),
            receive_timeout_ms: request.recv_timeout.map(|d| d.as_millis() as u64),
            body,
            retry: StoredRetry {
                policy: request.retry.policy.index(),
                max: request.retry.max,
                interval_ms: request.retry.interval.map(|d| d.as_millis() as u64),
            },
            cache: StoredCache {
                enable: request.cache.enable,
                use_lru: request.cache.use_lru,
                ignore_once: request.cache.ignore_once,
                duration_secs: request.cache.duration.map(|d| d.as_secs()),
            },
            promise: StoredPromise {
                enable: request.promise.enable,
                key,
            },
            mock: StoredMock {
                enable: request.mock.enable,
                project_id: request.mock.project_id,
                origin_path: request.mock.origin_path.clone(),
            },
            extra_tag: request.extra_tag.clone(),
        })
    }

    fn into_request(self) -> Request {
        let mut request = Request::new(self.business_identifier, self.method, self.api_path);
        request.path_param = self.path_param;
        request.query = self.query_params;
        request.content_type = self.content_type;
        request.response_type = self.response_type;
        request.headers = self.headers;
        request.send_timeout = self.send_timeout_ms.map(Duration::from_millis);
        request.recv_timeout = self.receive_timeout_ms.map(Duration::from_millis);
        request.body = match self.body {
            Some(StoredBody::Json(map)) => Body::Json(map),
            Some(StoredBody::Text(text)) => Body::Text(text),
            None => Body::Empty,
        };

        let mut retry = RetryConfig::default();
        retry.policy = RetryPolicy::from_index(self.retry.policy);
        retry.max = self.retry.max;
        retry.interval = self.retry.interval_ms.map(Duration::from_millis);
        request.retry = retry;

        let mut cache = CacheSettings::default();
        cache.enable = self.cache.enable;
        cache.use_lru = self.cache.use_lru;
        cache.ignore_once = self.cache.ignore_once;
        cache.duration = self.cache.duration_secs.map(Duration::from_secs);
        request.cache = cache;

        if self.promise.enable {
            let promise = PromiseSettings::enabled();
            promise.assign_key(self.promise.key);
            request.promise = promise;
        }

        request.mock = MockSettings {
            enable: self.mock.enable,
            project_id: self.mock.project_id,
            origin_path: self.mock.origin_path,
        };
        request.extra_tag = self.extra_tag;
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enlisted_request() -> Request {
        let mut request = Request::post("biz", "/sync")
            .with_path_param("/v2")
            .with_query("device", json!("tablet"))
            .with_header("x-trace", "abc")
            .with_promise();
        let mut map = Map::new();
        map.insert("x".to_string(), json!(1));
        request.body = Body::Json(map);
        request.retry = RetryConfig::limited(4, Duration::from_millis(250));
        request.cache = CacheSettings::enabled(Some(Duration::from_secs(60)));
        request.send_timeout = Some(Duration::from_millis(5_000));
        request.recv_timeout = Some(Duration::from_millis(15_000));
        request.extra_tag = Some("sync-batch".to_string());
        request.promise.assign_key("5f6de0a0-0000-5000-8000-000000000001".to_string());
        request
    }

    #[test]
    fn round_trip_preserves_recorded_fields() {
        let original = enlisted_request();
        let stored = StoredRequest::from_request(&original).unwrap();
        let json = serde_json::to_string(&stored).unwrap();
        let revived: StoredRequest = serde_json::from_str(&json).unwrap();
        let request = revived.into_request();

        assert_eq!(request.business, original.business);
        assert_eq!(request.method, original.method);
        assert_eq!(request.api_path, original.api_path);
        assert_eq!(request.path_param, original.path_param);
        assert_eq!(request.query, original.query);
        assert_eq!(request.headers, original.headers);
        assert_eq!(request.content_type, original.content_type);
        assert_eq!(request.response_type, original.response_type);
        assert_eq!(request.send_timeout, original.send_timeout);
        assert_eq!(request.recv_timeout, original.recv_timeout);
        assert_eq!(request.retry.policy, original.retry.policy);
        assert_eq!(request.retry.max, original.retry.max);
        assert_eq!(request.retry.interval, original.retry.interval);
        assert_eq!(request.cache.enable, original.cache.enable);
        assert_eq!(request.cache.use_lru, original.cache.use_lru);
        assert_eq!(request.cache.duration, original.cache.duration);
        assert_eq!(request.mock.enable, original.mock.enable);
        assert_eq!(request.promise.key(), original.promise.key());
        assert_eq!(request.extra_tag, original.extra_tag);
        assert!(matches!(request.body, Body::Json(_)));

        // Runtime state is rebuilt, not restored.
        assert_eq!(request.retry.count(), 0);
        assert!(request.started_at().is_none());
        assert!(!request.completion.is_completed());
    }

    #[test]
    fn stream_bodies_are_rejected() {
        let mut request = Request::post("biz", "/upload").with_promise();
        request.promise.assign_key("k".to_string());
        request.body = Body::Stream(bytes::Bytes::from_static(b"blob"));
        assert!(StoredRequest::from_request(&request).is_err());
    }

    #[tokio::test]
    async fn save_load_delete_cycle() {
        let store = PromiseStore::new();
        store.init("sqlite::memory:").await.unwrap();

        let request = enlisted_request();
        store.save(&request).await.unwrap();

        let pending = store.business_requests("biz", &[]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].api_path, "/sync");

        // Path filter.
        assert_eq!(store.business_requests("biz", &["/other".to_string()]).len(), 0);
        assert_eq!(store.business_requests("biz", &["/sync".to_string()]).len(), 1);

        store.delete("biz", &request.promise.key().unwrap()).await;
        assert!(store.business_requests("biz", &[]).is_empty());
    }

    #[tokio::test]
    async fn resave_with_same_key_does_not_duplicate() {
        let store = PromiseStore::new();
        store.init("sqlite::memory:").await.unwrap();

        let request = enlisted_request();
        store.save(&request).await.unwrap();
        store.save(&request).await.unwrap();

        assert_eq!(store.business_requests("biz", &[]).len(), 1);
    }

    #[tokio::test]
    async fn rehydrates_across_restart() {
        let path = std::env::temp_dir().join(format!("nl-promise-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}?mode=rwc", path.display());

        let first = PromiseStore::new();
        first.init(&url).await.unwrap();
        first.save(&enlisted_request()).await.unwrap();
        first.release().await;

        let second = PromiseStore::new();
        second.init(&url).await.unwrap();
        let pending = second.business_requests("biz", &[]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].extra_tag.as_deref(), Some("sync-batch"));
        assert_eq!(
            pending[0].promise.key().as_deref(),
            Some("5f6de0a0-0000-5000-8000-000000000001")
        );
        second.release().await;

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let store = PromiseStore::new();
        store.init("sqlite::memory:").await.unwrap();
        store.save(&enlisted_request()).await.unwrap();

        store.clear().await;
        assert!(store.business_requests("biz", &[]).is_empty());
    }
}
