//! Terminal-state notification fan-out.
//!
//! After a task reaches `Loaded` or `Failed`, a [`LoadNotification`] is published
//! on `notifications.<type>`, keyed by the resource key. Every listener group
//! subscribed to that topic receives it; within a group, notifications for one
//! key arrive in causal order because they share a partition.
//!
//! Delivery is at-least-once per group, so listeners must be idempotent (keyed by
//! `task_id`, typically).

use std::sync::Arc;

use tracing::{debug, info, warn};

use loadcache_core::LoadType;
use loadcache_events::{LoadNotification, LoadTopics, MessageBus};

use crate::error::LoadError;
use crate::workers::{ConsumerWorker, WorkerHandle};

/// Object-safe publishing side of the fan-out.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: LoadNotification) -> Result<(), LoadError>;
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, notification: LoadNotification) -> Result<(), LoadError> {
        (**self).notify(notification)
    }
}

/// Publishes notifications onto the bus.
pub struct NotificationFanout<B> {
    bus: B,
    topics: LoadTopics,
}

impl<B> NotificationFanout<B>
where
    B: MessageBus<LoadNotification>,
{
    pub fn new(bus: B, topics: LoadTopics) -> Self {
        Self { bus, topics }
    }
}

impl<B> Notifier for NotificationFanout<B>
where
    B: MessageBus<LoadNotification>,
{
    fn notify(&self, notification: LoadNotification) -> Result<(), LoadError> {
        let topic = self.topics.notifications(&notification.load_type);
        debug!(
            topic = %topic,
            key = %notification.key,
            task_id = %notification.task_id,
            state = ?notification.status.state(),
            "publishing load notification"
        );
        self.bus
            .publish(&topic, notification)
            .map_err(|e| LoadError::Publish(e.to_string()))
    }
}

/// Application callback for finished loads.
pub trait LoadNotificationListener: Send + Sync {
    fn on_notification(&self, notification: &LoadNotification) -> anyhow::Result<()>;
}

impl<F> LoadNotificationListener for F
where
    F: Fn(&LoadNotification) -> anyhow::Result<()> + Send + Sync,
{
    fn on_notification(&self, notification: &LoadNotification) -> anyhow::Result<()> {
        self(notification)
    }
}

/// One independent consumer group of listeners for one load type.
#[derive(Clone)]
pub struct ListenerGroup {
    name: String,
    load_type: LoadType,
    listeners: Vec<Arc<dyn LoadNotificationListener>>,
}

impl core::fmt::Debug for ListenerGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerGroup")
            .field("name", &self.name)
            .field("load_type", &self.load_type)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ListenerGroup {
    pub fn new(name: impl Into<String>, load_type: LoadType) -> Self {
        Self {
            name: name.into(),
            load_type,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: impl LoadNotificationListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load_type(&self) -> &LoadType {
        &self.load_type
    }

    /// Deliver one notification to every listener of the group.
    ///
    /// A failing listener does not prevent delivery to the others.
    pub fn deliver(&self, notification: &LoadNotification) -> Result<(), LoadError> {
        info!(
            group = %self.name,
            load_type = %notification.load_type,
            key = %notification.key,
            task_id = %notification.task_id,
            "received load notification"
        );

        for listener in &self.listeners {
            if let Err(err) = listener.on_notification(notification) {
                warn!(
                    group = %self.name,
                    task_id = %notification.task_id,
                    error = %format!("{err:#}"),
                    "load notification listener failed"
                );
            }
        }
        Ok(())
    }

    /// Start one consumer thread per partition of `notifications.<type>`.
    pub fn spawn<B>(self, bus: &B, topics: &LoadTopics) -> Result<Vec<WorkerHandle>, LoadError>
    where
        B: MessageBus<LoadNotification>,
    {
        let topic = topics.notifications(&self.load_type);
        let group = Arc::new(self);
        let mut handles = Vec::new();

        for partition in 0..bus.partition_count() {
            let sub = bus
                .subscribe(&topic, &group.name, partition)
                .map_err(|e| LoadError::Publish(e.to_string()))?;
            let group = group.clone();
            handles.push(ConsumerWorker::spawn(
                format!("{}-{}", group.name, partition),
                sub,
                move |notification: &LoadNotification| group.deliver(notification),
            ));
        }

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use loadcache_core::{LoadTaskId, LoadTaskStatus, LoadedStatus};
    use loadcache_events::InMemoryMessageBus;

    fn item() -> LoadType {
        LoadType::new("item").unwrap()
    }

    fn loaded(key: &str) -> LoadNotification {
        LoadNotification {
            load_type: item(),
            key: key.to_string(),
            task_id: LoadTaskId::new(),
            status: LoadTaskStatus::Loaded(LoadedStatus {
                loaded_at: Utc::now(),
                attempt: 1,
            }),
        }
    }

    #[test]
    fn fanout_publishes_on_type_topic() {
        let bus = Arc::new(InMemoryMessageBus::<LoadNotification>::new(2));
        let fanout = NotificationFanout::new(bus.clone(), LoadTopics::default());

        fanout.notify(loaded("k1")).unwrap();
        fanout.notify(loaded("k2")).unwrap();

        assert_eq!(bus.published_count("notifications.item"), 2);
    }

    #[test]
    fn every_listener_in_group_sees_notification() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());

        let group = ListenerGroup::new("indexer", item())
            .with_listener(move |n: &LoadNotification| -> anyhow::Result<()> {
                a.lock().unwrap().push(("a", n.key.clone()));
                Ok(())
            })
            .with_listener(move |n: &LoadNotification| -> anyhow::Result<()> {
                b.lock().unwrap().push(("b", n.key.clone()));
                Ok(())
            });

        group.deliver(&loaded("k")).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("a", "k".to_string()), ("b", "k".to_string())]);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();

        let group = ListenerGroup::new("g", item())
            .with_listener(|_: &LoadNotification| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("listener down"))
            })
            .with_listener(move |_: &LoadNotification| -> anyhow::Result<()> {
                *counter.lock().unwrap() += 1;
                Ok(())
            });

        group.deliver(&loaded("k")).unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
