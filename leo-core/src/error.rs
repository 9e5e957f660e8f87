//! Engine error kinds.
//!
//! Adapters convert native backend errors exactly once, at the boundary:
//! missing objects become `Ok(None)` (never an error), precondition failures
//! become `OptimisticResult { ok: false }`, transient faults are retried once
//! and then surface as `Transient`. Higher layers do not re-wrap.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("storage operation failed at {path}: {message}")]
    Storage { path: String, message: String },

    #[error("lock unavailable for {0}")]
    Lock(String),

    #[error("queue error on {queue}: {message}")]
    Queue { queue: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Storage error tagged with the offending path.
    pub fn storage(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StoreError::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn queue(queue: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StoreError::Queue {
            queue: queue.into(),
            message: message.to_string(),
        }
    }
}

/// Errors raised by the index listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Duplicate or otherwise invalid registration. Raised at registration
    /// time, before the listener starts.
    #[error("indexer configuration error: {0}")]
    Config(String),

    /// No indexer routes the message. The batch is not acknowledged and the
    /// queue redelivers it.
    #[error("no indexer for message: {0}")]
    Dispatch(String),

    #[error("malformed change event: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("indexer failed for key {key}: {message}")]
    Indexer { key: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
