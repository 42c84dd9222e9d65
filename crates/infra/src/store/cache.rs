//! Cached values per `(type, key)`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;

use loadcache_core::{CachedValue, LoadType};

use super::StoreError;

/// Cache store abstraction.
///
/// Payloads are opaque JSON; typing happens in the cache view service.
pub trait CacheStore: Send + Sync {
    fn get(
        &self,
        load_type: &LoadType,
        key: &str,
    ) -> Result<Option<CachedValue<JsonValue>>, StoreError>;

    /// Last-writer-wins by `cached_at`: a value older than the stored one is
    /// discarded. Returns whether the value was written.
    fn save(
        &self,
        load_type: &LoadType,
        key: &str,
        value: CachedValue<JsonValue>,
    ) -> Result<bool, StoreError>;

    fn remove(&self, load_type: &LoadType, key: &str) -> Result<(), StoreError>;
}

impl<S> CacheStore for Arc<S>
where
    S: CacheStore + ?Sized,
{
    fn get(
        &self,
        load_type: &LoadType,
        key: &str,
    ) -> Result<Option<CachedValue<JsonValue>>, StoreError> {
        (**self).get(load_type, key)
    }

    fn save(
        &self,
        load_type: &LoadType,
        key: &str,
        value: CachedValue<JsonValue>,
    ) -> Result<bool, StoreError> {
        (**self).save(load_type, key, value)
    }

    fn remove(&self, load_type: &LoadType, key: &str) -> Result<(), StoreError> {
        (**self).remove(load_type, key)
    }
}

/// In-memory cache store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    inner: RwLock<HashMap<(LoadType, String), CachedValue<JsonValue>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(
        &self,
        load_type: &LoadType,
        key: &str,
    ) -> Result<Option<CachedValue<JsonValue>>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(inner.get(&(load_type.clone(), key.to_string())).cloned())
    }

    fn save(
        &self,
        load_type: &LoadType,
        key: &str,
        value: CachedValue<JsonValue>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        match inner.entry((load_type.clone(), key.to_string())) {
            Entry::Occupied(mut existing) => {
                if value.cached_at < existing.get().cached_at {
                    return Ok(false);
                }
                existing.insert(value);
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
        Ok(true)
    }

    fn remove(&self, load_type: &LoadType, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        inner.remove(&(load_type.clone(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn item() -> LoadType {
        LoadType::new("item").unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn save_then_get() {
        let store = InMemoryCacheStore::new();
        assert!(store.save(&item(), "k", CachedValue::new(json!(1), at(0))).unwrap());

        let cached = store.get(&item(), "k").unwrap().unwrap();
        assert_eq!(cached.data, json!(1));
        assert_eq!(cached.cached_at, at(0));
    }

    #[test]
    fn older_value_does_not_overwrite_newer() {
        let store = InMemoryCacheStore::new();
        store.save(&item(), "k", CachedValue::new(json!("new"), at(10))).unwrap();

        let written = store
            .save(&item(), "k", CachedValue::new(json!("old"), at(5)))
            .unwrap();

        assert!(!written);
        assert_eq!(store.get(&item(), "k").unwrap().unwrap().data, json!("new"));
    }

    #[test]
    fn same_timestamp_overwrites() {
        let store = InMemoryCacheStore::new();
        store.save(&item(), "k", CachedValue::new(json!(1), at(3))).unwrap();
        assert!(store.save(&item(), "k", CachedValue::new(json!(2), at(3))).unwrap());
        assert_eq!(store.get(&item(), "k").unwrap().unwrap().data, json!(2));
    }

    #[test]
    fn types_do_not_share_keys() {
        let store = InMemoryCacheStore::new();
        let other = LoadType::new("collection").unwrap();
        store.save(&item(), "k", CachedValue::new(json!(1), at(0))).unwrap();

        assert!(store.get(&other, "k").unwrap().is_none());
    }

    #[test]
    fn remove_deletes_value() {
        let store = InMemoryCacheStore::new();
        store.save(&item(), "k", CachedValue::new(json!(1), at(0))).unwrap();
        store.remove(&item(), "k").unwrap();
        store.remove(&item(), "missing").unwrap();

        assert!(store.get(&item(), "k").unwrap().is_none());
    }
}
