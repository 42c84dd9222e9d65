//! Task dispatch: persist `Scheduled`, then publish.
//!
//! ```text
//! schedule_load(type, key, task_id)
//!   ↓
//! 1. Insert task record `Scheduled { now, attempt: 0 }` (failure aborts the call)
//!   ↓
//! 2. Publish `DispatchMessage { attempt: 0 }` on `dispatch.<type>`, keyed by `key`
//! ```
//!
//! A publish failure after a successful insert leaves an orphaned `Scheduled`
//! task. The retry sweeper only looks at `WaitsForRetry`, so the orphan never
//! progresses; callers recover by calling `update()` again, which mints a fresh
//! task.

use std::sync::Arc;

use tracing::{debug, error};

use loadcache_core::{Clock, LoadTaskId, LoadTaskStatus, LoadType};
use loadcache_events::{DispatchMessage, LoadTopics, MessageBus};

use crate::error::LoadError;
use crate::store::{TaskStatusRecord, TaskStatusStore};

/// Object-safe scheduling port used by the cache view service and the sweeper.
pub trait LoadScheduler: Send + Sync {
    fn schedule_load(
        &self,
        load_type: &LoadType,
        key: &str,
        task_id: LoadTaskId,
    ) -> Result<(), LoadError>;

    /// Current status, or `None` if the id was never recorded or has expired.
    fn get_status(&self, task_id: LoadTaskId) -> Result<Option<LoadTaskStatus>, LoadError>;

    /// Publish a dispatch message for an already-persisted `Scheduled` status.
    fn redispatch(&self, message: DispatchMessage) -> Result<(), LoadError>;
}

impl<D> LoadScheduler for Arc<D>
where
    D: LoadScheduler + ?Sized,
{
    fn schedule_load(
        &self,
        load_type: &LoadType,
        key: &str,
        task_id: LoadTaskId,
    ) -> Result<(), LoadError> {
        (**self).schedule_load(load_type, key, task_id)
    }

    fn get_status(&self, task_id: LoadTaskId) -> Result<Option<LoadTaskStatus>, LoadError> {
        (**self).get_status(task_id)
    }

    fn redispatch(&self, message: DispatchMessage) -> Result<(), LoadError> {
        (**self).redispatch(message)
    }
}

/// Dispatcher over a task status store and a message bus.
pub struct LoadDispatcher<S, B> {
    store: S,
    bus: B,
    topics: LoadTopics,
    clock: Arc<dyn Clock>,
}

impl<S, B> LoadDispatcher<S, B>
where
    S: TaskStatusStore,
    B: MessageBus<DispatchMessage>,
{
    pub fn new(store: S, bus: B, topics: LoadTopics, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            topics,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> LoadScheduler for LoadDispatcher<S, B>
where
    S: TaskStatusStore,
    B: MessageBus<DispatchMessage>,
{
    fn schedule_load(
        &self,
        load_type: &LoadType,
        key: &str,
        task_id: LoadTaskId,
    ) -> Result<(), LoadError> {
        let status = LoadTaskStatus::scheduled(self.clock.now());
        self.store.insert(TaskStatusRecord::new(
            task_id,
            load_type.clone(),
            key,
            status,
        ))?;

        debug!(load_type = %load_type, key = %key, task_id = %task_id, "load scheduled");

        self.redispatch(DispatchMessage::new(load_type.clone(), key, task_id, 0))
    }

    fn get_status(&self, task_id: LoadTaskId) -> Result<Option<LoadTaskStatus>, LoadError> {
        Ok(self.store.get(task_id)?.map(|record| record.status))
    }

    fn redispatch(&self, message: DispatchMessage) -> Result<(), LoadError> {
        let topic = self.topics.dispatch(&message.load_type);
        let task_id = message.task_id;
        let attempt = message.attempt;

        self.bus.publish(&topic, message).map_err(|e| {
            error!(topic = %topic, task_id = %task_id, attempt, error = %e, "failed to publish dispatch message");
            LoadError::Publish(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadcache_core::{ManualClock, TaskState};
    use loadcache_events::{InMemoryMessageBus, Subscription};

    use crate::store::InMemoryTaskStatusStore;

    /// Bus whose publish always fails.
    struct DownBus;

    impl MessageBus<DispatchMessage> for DownBus {
        type Error = String;

        fn partition_count(&self) -> u32 {
            1
        }

        fn publish(&self, _topic: &str, _message: DispatchMessage) -> Result<(), Self::Error> {
            Err("broker unavailable".to_string())
        }

        fn subscribe(
            &self,
            _topic: &str,
            _group: &str,
            _partition: u32,
        ) -> Result<Subscription<DispatchMessage>, Self::Error> {
            Err("broker unavailable".to_string())
        }
    }

    fn item() -> LoadType {
        LoadType::new("item").unwrap()
    }

    #[test]
    fn schedule_persists_then_publishes_attempt_zero() {
        let store = InMemoryTaskStatusStore::arc();
        let bus = Arc::new(InMemoryMessageBus::<DispatchMessage>::new(1));
        let clock = Arc::new(ManualClock::default());
        let dispatcher =
            LoadDispatcher::new(store.clone(), bus.clone(), LoadTopics::default(), clock.clone());
        let sub = bus.subscribe("dispatch.item", "workers", 0).unwrap();

        let task_id = LoadTaskId::new();
        dispatcher.schedule_load(&item(), "k1", task_id).unwrap();

        let status = dispatcher.get_status(task_id).unwrap().unwrap();
        assert_eq!(status, LoadTaskStatus::scheduled(clock.now()));

        let messages = sub.drain();
        assert_eq!(messages, vec![DispatchMessage::new(item(), "k1", task_id, 0)]);
    }

    #[test]
    fn unknown_task_status_is_none() {
        let dispatcher = LoadDispatcher::new(
            InMemoryTaskStatusStore::arc(),
            Arc::new(InMemoryMessageBus::<DispatchMessage>::new(1)),
            LoadTopics::default(),
            Arc::new(ManualClock::default()),
        );
        assert_eq!(dispatcher.get_status(LoadTaskId::new()).unwrap(), None);
    }

    #[test]
    fn duplicate_task_id_is_rejected_before_publishing() {
        let bus = Arc::new(InMemoryMessageBus::<DispatchMessage>::new(1));
        let dispatcher = LoadDispatcher::new(
            InMemoryTaskStatusStore::arc(),
            bus.clone(),
            LoadTopics::default(),
            Arc::new(ManualClock::default()),
        );
        let task_id = LoadTaskId::new();
        dispatcher.schedule_load(&item(), "k", task_id).unwrap();

        let err = dispatcher.schedule_load(&item(), "k", task_id).unwrap_err();
        assert!(matches!(err, LoadError::Store(_)));
        assert_eq!(bus.published_count("dispatch.item"), 1);
    }

    #[test]
    fn publish_failure_leaves_orphaned_scheduled_task() {
        let store = InMemoryTaskStatusStore::arc();
        let dispatcher = LoadDispatcher::new(
            store.clone(),
            DownBus,
            LoadTopics::default(),
            Arc::new(ManualClock::default()),
        );

        let task_id = LoadTaskId::new();
        let err = dispatcher.schedule_load(&item(), "k", task_id).unwrap_err();

        assert!(matches!(err, LoadError::Publish(_)));
        let record = store.get(task_id).unwrap().unwrap();
        assert_eq!(record.status.state(), TaskState::Scheduled);
    }
}
