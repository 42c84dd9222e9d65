//! Public read/write façade over one load type.
//!
//! Composes the cache store, the task-pointer index and the dispatcher into a
//! single [`CacheEntry`] per key. Reads never touch the message bus.
//!
//! `get` is refresh-aware: a cached value is reported together with the state of
//! the key's most recently scheduled task (`LoadedAndUpdateScheduled`,
//! `LoadedAndUpdateFailed`), see [`CacheEntry::compose`].

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use loadcache_core::{CacheEntry, CachedValue, Clock, LoadTaskId, LoadType};

use crate::dispatcher::LoadScheduler;
use crate::error::LoadError;
use crate::store::{CacheStore, TaskPointerIndex};

/// Typed cache view for one [`LoadType`].
pub struct CacheViewService<T> {
    load_type: LoadType,
    cache: Arc<dyn CacheStore>,
    pointers: Arc<dyn TaskPointerIndex>,
    scheduler: Arc<dyn LoadScheduler>,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for CacheViewService<T> {
    fn clone(&self) -> Self {
        Self {
            load_type: self.load_type.clone(),
            cache: self.cache.clone(),
            pointers: self.pointers.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> CacheViewService<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(
        load_type: LoadType,
        cache: Arc<dyn CacheStore>,
        pointers: Arc<dyn TaskPointerIndex>,
        scheduler: Arc<dyn LoadScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            load_type,
            cache,
            pointers,
            scheduler,
            clock,
            _marker: PhantomData,
        }
    }

    pub fn load_type(&self) -> &LoadType {
        &self.load_type
    }

    pub fn get(&self, key: &str) -> Result<CacheEntry<T>, LoadError> {
        let cached = self
            .cache
            .get(&self.load_type, key)?
            .map(|c| c.try_map(serde_json::from_value::<T>))
            .transpose()?;

        let status = match self.pointers.get(&self.load_type, key)? {
            Some(task_id) => self.scheduler.get_status(task_id)?,
            None => None,
        };

        Ok(CacheEntry::compose(cached, status))
    }

    /// The cached value, whatever the state of any refresh.
    pub fn get_available(&self, key: &str) -> Result<Option<T>, LoadError> {
        Ok(self.get(key)?.into_data())
    }

    /// Schedule a (re)load of `key`.
    ///
    /// The new task becomes the key's pointer. A previous task that is still in
    /// flight is not cancelled; it keeps running and may still `save`.
    pub fn update(&self, key: &str) -> Result<LoadTaskId, LoadError> {
        let task_id = LoadTaskId::new();
        self.pointers.put(&self.load_type, key, task_id)?;
        self.scheduler.schedule_load(&self.load_type, key, task_id)?;

        info!(load_type = %self.load_type, key = %key, task_id = %task_id, "cache update scheduled");
        Ok(task_id)
    }

    /// Store `data` as the cached value, stamped with the current time.
    pub fn save(&self, key: &str, data: &T) -> Result<(), LoadError> {
        let value = CachedValue::new(serde_json::to_value(data)?, self.clock.now());
        let cached_at = value.cached_at;

        if !self.cache.save(&self.load_type, key, value)? {
            debug!(
                load_type = %self.load_type,
                key = %key,
                cached_at = %cached_at,
                "older value discarded; cache holds a newer one"
            );
        }
        Ok(())
    }

    /// Forget the cached value and the task pointer.
    pub fn remove(&self, key: &str) -> Result<(), LoadError> {
        self.cache.remove(&self.load_type, key)?;
        self.pointers.remove(&self.load_type, key)?;

        debug!(load_type = %self.load_type, key = %key, "cache entry removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde::Deserialize;

    use loadcache_core::{
        ErrorClass, ExpectedVersion, FailedStatus, LoadTaskStatus, ManualClock, PendingStatus,
        TaskError,
    };
    use loadcache_events::{DispatchMessage, InMemoryMessageBus, LoadTopics};

    use crate::dispatcher::LoadDispatcher;
    use crate::store::{
        InMemoryCacheStore, InMemoryTaskPointerIndex, InMemoryTaskStatusStore, TaskStatusStore,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemMeta {
        name: String,
    }

    fn meta(name: &str) -> ItemMeta {
        ItemMeta {
            name: name.to_string(),
        }
    }

    struct Fixture {
        view: CacheViewService<ItemMeta>,
        status: Arc<InMemoryTaskStatusStore>,
        bus: Arc<InMemoryMessageBus<DispatchMessage>>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Fixture {
        let status = InMemoryTaskStatusStore::arc();
        let bus = Arc::new(InMemoryMessageBus::<DispatchMessage>::new(1));
        let clock = Arc::new(ManualClock::default());
        let dispatcher = Arc::new(LoadDispatcher::new(
            status.clone(),
            bus.clone(),
            LoadTopics::default(),
            clock.clone(),
        ));
        let view = CacheViewService::new(
            LoadType::new("item").unwrap(),
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemoryTaskPointerIndex::new()),
            dispatcher,
            clock.clone(),
        );
        Fixture {
            view,
            status,
            bus,
            clock,
        }
    }

    fn fail_task(f: &Fixture, task_id: LoadTaskId) {
        let record = f.status.get(task_id).unwrap().unwrap();
        f.status
            .compare_and_set(
                task_id,
                ExpectedVersion::Exact(record.version),
                LoadTaskStatus::Failed(FailedStatus {
                    attempt: 1,
                    last_error: TaskError::new(ErrorClass::Permanent, "gone"),
                    failed_at: f.clock.now(),
                }),
                None,
            )
            .unwrap();
    }

    #[test]
    fn unknown_key_is_not_available() {
        let f = setup();
        assert_eq!(f.view.get("nope").unwrap(), CacheEntry::NotAvailable);
        assert_eq!(f.view.get_available("nope").unwrap(), None);
    }

    #[test]
    fn save_then_get_is_loaded() {
        let f = setup();
        f.view.save("k", &meta("first")).unwrap();

        let entry = f.view.get("k").unwrap();
        assert_eq!(
            entry,
            CacheEntry::Loaded {
                cached_at: f.clock.now(),
                data: meta("first")
            }
        );
    }

    #[test]
    fn update_on_empty_key_reports_initial_load() {
        let f = setup();
        let task_id = f.view.update("k").unwrap();

        assert!(matches!(
            f.view.get("k").unwrap(),
            CacheEntry::InitialLoadScheduled {
                pending: PendingStatus::Scheduled(_)
            }
        ));
        assert_eq!(f.bus.published_count("dispatch.item"), 1);
        assert!(f.status.get(task_id).unwrap().is_some());
    }

    #[test]
    fn failed_initial_load_has_no_value() {
        let f = setup();
        let task_id = f.view.update("k").unwrap();
        fail_task(&f, task_id);

        assert!(matches!(
            f.view.get("k").unwrap(),
            CacheEntry::InitialFailed { .. }
        ));
        assert_eq!(f.view.get_available("k").unwrap(), None);
    }

    #[test]
    fn update_on_cached_key_reports_refresh_in_flight() {
        let f = setup();
        f.view.save("k", &meta("v1")).unwrap();
        f.clock.advance(Duration::from_secs(1));
        f.view.update("k").unwrap();

        let entry = f.view.get("k").unwrap();
        assert!(matches!(entry, CacheEntry::LoadedAndUpdateScheduled { .. }));
        assert_eq!(f.view.get_available("k").unwrap(), Some(meta("v1")));
    }

    #[test]
    fn failed_refresh_keeps_serving_cached_value() {
        let f = setup();
        f.view.save("k", &meta("v1")).unwrap();
        f.clock.advance(Duration::from_secs(1));
        let task_id = f.view.update("k").unwrap();
        fail_task(&f, task_id);

        let entry = f.view.get("k").unwrap();
        assert!(matches!(entry, CacheEntry::LoadedAndUpdateFailed { .. }));
        assert_eq!(entry.into_data(), Some(meta("v1")));
    }

    #[test]
    fn second_update_moves_pointer() {
        let f = setup();
        let first = f.view.update("k").unwrap();
        let second = f.view.update("k").unwrap();
        assert_ne!(first, second);

        // The first task failing is invisible once superseded.
        fail_task(&f, first);
        assert!(matches!(
            f.view.get("k").unwrap(),
            CacheEntry::InitialLoadScheduled { .. }
        ));
    }

    #[test]
    fn remove_forgets_value_and_pointer() {
        let f = setup();
        f.view.save("k", &meta("v1")).unwrap();
        f.view.update("k").unwrap();

        f.view.remove("k").unwrap();
        assert_eq!(f.view.get("k").unwrap(), CacheEntry::NotAvailable);
    }

    #[test]
    fn save_is_idempotent_and_cached_at_never_goes_back() {
        let f = setup();
        f.view.save("k", &meta("v")).unwrap();
        let first = f.view.get("k").unwrap().cached_at().unwrap();

        f.clock.advance(Duration::from_secs(1));
        f.view.save("k", &meta("v")).unwrap();
        let second = f.view.get("k").unwrap().cached_at().unwrap();
        assert!(second >= first);

        // A writer with a lagging clock cannot move the value back in time.
        f.clock.set(first - chrono::Duration::seconds(10));
        f.view.save("k", &meta("stale")).unwrap();
        assert_eq!(f.view.get_available("k").unwrap(), Some(meta("v")));
        assert_eq!(f.view.get("k").unwrap().cached_at(), Some(second));
    }

    #[test]
    fn undecodable_cached_value_is_a_serialization_error() {
        let f = setup();
        let raw: CacheViewService<serde_json::Value> = CacheViewService::new(
            f.view.load_type().clone(),
            f.view.cache.clone(),
            f.view.pointers.clone(),
            f.view.scheduler.clone(),
            f.clock.clone(),
        );
        raw.save("k", &serde_json::json!(42)).unwrap();

        assert!(matches!(
            f.view.get("k"),
            Err(LoadError::Serialization(_))
        ));
    }
}
