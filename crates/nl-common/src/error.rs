//! Framework-level error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetlineError {
    #[error("no business registered for identifier '{0}'")]
    UnknownBusiness(String),

    #[error("business '{0}' is already registered")]
    DuplicateBusiness(String),

    #[error("streaming bodies cannot be enlisted for durable replay")]
    BodyNotReplayable,

    #[error("transport construction failed: {0}")]
    Transport(String),

    #[error("store not initialized")]
    StoreNotInitialized,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetlineError>;
