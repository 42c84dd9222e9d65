//! In-memory partitioned bus for tests/dev.
//!
//! Nothing survives the process and nothing is redelivered after a handler
//! fails. Production deployments use a durable transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, mpsc};

use crate::bus::{Delivery, Keyed, MessageBus, Subscription, partition_for};

/// Messages retained per partition for replay to new consumer groups.
pub const DEFAULT_RETENTION: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,

    #[error("partition {partition} out of range (topic has {partition_count})")]
    InvalidPartition { partition: u32, partition_count: u32 },
}

#[derive(Debug)]
struct PartitionLog<M> {
    messages: VecDeque<M>,
    published: usize,
    groups: HashSet<String>,
    subscribers: Vec<mpsc::Sender<Delivery<M>>>,
}

impl<M> Default for PartitionLog<M> {
    fn default() -> Self {
        Self {
            messages: VecDeque::new(),
            published: 0,
            groups: HashSet::new(),
            subscribers: Vec::new(),
        }
    }
}

/// In-memory partitioned pub/sub bus.
///
/// - No IO / no async
/// - The last `retention` messages of each partition are kept; the first
///   subscription of a consumer group to a partition replays them (earliest
///   retained offset), later subscriptions of the same group only see new
///   messages
/// - Per-partition publish order is preserved for every subscriber
#[derive(Debug)]
pub struct InMemoryMessageBus<M> {
    partition_count: u32,
    retention: usize,
    topics: Mutex<HashMap<String, Vec<PartitionLog<M>>>>,
}

impl<M> InMemoryMessageBus<M> {
    pub fn new(partition_count: u32) -> Self {
        Self::with_retention(partition_count, DEFAULT_RETENTION)
    }

    pub fn with_retention(partition_count: u32, retention: usize) -> Self {
        Self {
            partition_count: partition_count.max(1),
            retention,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of messages published to a topic so far (all partitions).
    pub fn published_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| {
                topics
                    .get(topic)
                    .map_or(0, |parts| parts.iter().map(|p| p.published).sum())
            })
            .unwrap_or(0)
    }

    fn new_topic(&self) -> Vec<PartitionLog<M>> {
        (0..self.partition_count).map(|_| PartitionLog::default()).collect()
    }
}

impl<M> Default for InMemoryMessageBus<M> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<M> MessageBus<M> for InMemoryMessageBus<M>
where
    M: Keyed + Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        let mut topics = self.topics.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let partitions = topics
            .entry(topic.to_string())
            .or_insert_with(|| self.new_topic());

        let p = partition_for(message.partition_key(), self.partition_count) as usize;
        let log = &mut partitions[p];

        // Drop any dead subscribers while publishing.
        log.subscribers
            .retain(|tx| tx.send(Delivery::new(message.clone())).is_ok());
        log.published += 1;
        log.messages.push_back(message);
        while log.messages.len() > self.retention {
            log.messages.pop_front();
        }

        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Subscription<M>, Self::Error> {
        if partition >= self.partition_count {
            return Err(InMemoryBusError::InvalidPartition {
                partition,
                partition_count: self.partition_count,
            });
        }

        let mut topics = self.topics.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let partitions = topics
            .entry(topic.to_string())
            .or_insert_with(|| self.new_topic());
        let log = &mut partitions[partition as usize];

        let (tx, rx) = mpsc::channel();

        // Replay under the lock so nothing published concurrently is missed or reordered.
        if log.groups.insert(group.to_string()) {
            for message in &log.messages {
                let _ = tx.send(Delivery::new(message.clone()));
            }
        }
        log.subscribers.push(tx);

        Ok(Subscription::new(rx))
    }
}
