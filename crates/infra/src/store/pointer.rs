//! `(type, key)` → most recently scheduled task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use loadcache_core::{LoadTaskId, LoadType};

use super::StoreError;

/// Task-pointer index abstraction.
///
/// Holds at most one pointer per key; `put` overwrites unconditionally.
pub trait TaskPointerIndex: Send + Sync {
    fn get(&self, load_type: &LoadType, key: &str) -> Result<Option<LoadTaskId>, StoreError>;

    fn put(&self, load_type: &LoadType, key: &str, task_id: LoadTaskId) -> Result<(), StoreError>;

    fn remove(&self, load_type: &LoadType, key: &str) -> Result<(), StoreError>;
}

impl<S> TaskPointerIndex for Arc<S>
where
    S: TaskPointerIndex + ?Sized,
{
    fn get(&self, load_type: &LoadType, key: &str) -> Result<Option<LoadTaskId>, StoreError> {
        (**self).get(load_type, key)
    }

    fn put(&self, load_type: &LoadType, key: &str, task_id: LoadTaskId) -> Result<(), StoreError> {
        (**self).put(load_type, key, task_id)
    }

    fn remove(&self, load_type: &LoadType, key: &str) -> Result<(), StoreError> {
        (**self).remove(load_type, key)
    }
}

/// In-memory pointer index for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskPointerIndex {
    inner: RwLock<HashMap<(LoadType, String), LoadTaskId>>,
}

impl InMemoryTaskPointerIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskPointerIndex for InMemoryTaskPointerIndex {
    fn get(&self, load_type: &LoadType, key: &str) -> Result<Option<LoadTaskId>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(inner.get(&(load_type.clone(), key.to_string())).copied())
    }

    fn put(&self, load_type: &LoadType, key: &str, task_id: LoadTaskId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        inner.insert((load_type.clone(), key.to_string()), task_id);
        Ok(())
    }

    fn remove(&self, load_type: &LoadType, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        inner.remove(&(load_type.clone(), key.to_string()));
        Ok(())
    }
}
