//! Infrastructure error surfaced to callers.
//!
//! Loader failures never show up here; they are recorded on the task status.
//! `LoadError` covers stores, the broker and (de)serialization, and is returned
//! synchronously without automatic retries.

use loadcache_core::{DomainError, LoadType};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Publication failed after the state change was persisted.
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no loader registered for load type {0}")]
    UnknownLoadType(LoadType),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<serde_json::Error> for LoadError {
    fn from(value: serde_json::Error) -> Self {
        LoadError::Serialization(value.to_string())
    }
}
