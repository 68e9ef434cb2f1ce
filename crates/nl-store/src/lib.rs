//! Durable stores for the netline client framework: the bounded LRU map,
//! the two-tier response cache, and the per-business promise queue. Both
//! stores persist to SQLite and treat the in-memory view as authoritative
//! when the database misbehaves.

pub mod cache;
pub mod lru;
pub mod promise;

pub use cache::{CacheEntry, CacheStore, DEFAULT_LRU_CAPACITY};
pub use lru::LruMap;
pub use promise::PromiseStore;
