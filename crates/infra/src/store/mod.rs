//! Durable state behind the subsystem.
//!
//! - [`TaskStatusStore`]: one versioned record per load task
//! - [`CacheStore`]: last cached value per `(type, key)`
//! - [`TaskPointerIndex`]: `(type, key)` → most recently scheduled task id
//!
//! Only the task status record is written concurrently by independent processes;
//! it is guarded by a version field and compare-and-set. The other two stores are
//! last-writer-wins.

pub mod cache;
pub mod pointer;
pub mod task_status;

pub use cache::{CacheStore, InMemoryCacheStore};
pub use pointer::{InMemoryTaskPointerIndex, TaskPointerIndex};
pub use task_status::{
    InMemoryTaskStatusStore, TaskStatusCounts, TaskStatusRecord, TaskStatusStore,
};

use loadcache_core::{ExpectedVersion, LoadTaskId};

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(LoadTaskId),

    #[error("task already exists: {0}")]
    AlreadyExists(LoadTaskId),

    /// Conditional write lost against a concurrent writer.
    #[error("version conflict on task {task_id} (expected: {expected}, actual: {actual})")]
    Conflict {
        task_id: LoadTaskId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        Self::Storage("lock poisoned".to_string())
    }
}
