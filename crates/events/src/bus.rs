//! Partitioned publish/subscribe abstraction (mechanics only).
//!
//! The message bus is the transport between the dispatcher, the execution workers
//! and the notification listeners. It makes two promises and no others:
//!
//! - **At-least-once delivery**: a message is delivered one or more times
//! - **Per-partition ordering**: messages published to the same partition key are
//!   delivered to a given consumer group in publish order
//!
//! Everything stronger (deduplication, exactly-once effects) is the job of
//! idempotent handlers, not of the bus.
//!
//! ## Topics, partitions and groups
//!
//! A topic is split into a fixed number of partitions; a message lands in the
//! partition selected by hashing its [`Keyed::partition_key`]. Each consumer
//! group receives every message of the topic; within a group, one subscription
//! consumes one partition.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Acknowledgement for one delivered message.
///
/// Transports that track delivery (Redis Streams consumer groups) hand out a
/// callback that settles the message; in-process transports hand out
/// [`Ack::none`]. Dropping an `Ack` without calling [`Ack::ack`] leaves the
/// message unsettled, so a durable transport delivers it again.
pub struct Ack(Option<Box<dyn FnOnce() + Send>>);

impl Ack {
    pub fn new(settle: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(settle)))
    }

    /// Nothing to settle.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn ack(mut self) {
        if let Some(settle) = self.0.take() {
            settle();
        }
    }
}

impl core::fmt::Debug for Ack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Ack").field(&self.0.is_some()).finish()
    }
}

/// A message plus the handle that acknowledges it.
#[derive(Debug)]
pub struct Delivery<M> {
    pub message: M,
    pub ack: Ack,
}

impl<M> Delivery<M> {
    /// Delivery that needs no acknowledgement.
    pub fn new(message: M) -> Self {
        Self {
            message,
            ack: Ack::none(),
        }
    }

    pub fn with_ack(message: M, ack: Ack) -> Self {
        Self { message, ack }
    }
}

/// A subscription to one partition of a topic, on behalf of one consumer group.
///
/// ## Usage Pattern
///
/// ```ignore
/// let sub = bus.subscribe("dispatch.item-meta", "load-workers", 0)?;
///
/// loop {
///     match sub.recv_delivery_timeout(Duration::from_millis(250)) {
///         Ok(Delivery { message, ack }) => {
///             handle(&message)?;
///             ack.ack();
///         }
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Bus closed
///     }
/// }
/// ```
///
/// `recv`, `try_recv`, `recv_timeout` and `drain` acknowledge on receipt.
/// Consumers that must not lose a message to a crash use
/// [`recv_delivery_timeout`](Self::recv_delivery_timeout) and acknowledge after
/// handling it.
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<Delivery<M>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<Delivery<M>>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv().map(settle)
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv().map(settle)
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout).map(settle)
    }

    /// Block for up to `timeout`, leaving acknowledgement to the caller.
    pub fn recv_delivery_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Delivery<M>, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().map(settle).collect()
    }
}

fn settle<M>(delivery: Delivery<M>) -> M {
    delivery.ack.ack();
    delivery.message
}

/// Messages that carry their own partition key.
pub trait Keyed {
    fn partition_key(&self) -> &str;
}

/// Partitioned, at-least-once message bus.
///
/// `publish()` can fail (broker unavailable, poisoned state). Failures are
/// surfaced to the caller, which decides whether the already-persisted state
/// change is left for a later retry.
pub trait MessageBus<M: Keyed>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Number of partitions every topic on this bus is split into.
    fn partition_count(&self) -> u32;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error>;

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Subscription<M>, Self::Error>;
}

impl<M, B> MessageBus<M> for Arc<B>
where
    M: Keyed,
    B: MessageBus<M> + ?Sized,
{
    type Error = B::Error;

    fn partition_count(&self) -> u32 {
        (**self).partition_count()
    }

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        (**self).publish(topic, message)
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Subscription<M>, Self::Error> {
        (**self).subscribe(topic, group, partition)
    }
}

/// Stable partition selection (32-bit FNV-1a over the key bytes).
///
/// Stable across processes and builds, so independent publishers agree on the
/// partition for a key.
pub fn partition_for(key: &str, partition_count: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    if partition_count <= 1 {
        return 0;
    }

    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(PRIME));
    hash % partition_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["k1", "k2", "0xabc:17", ""] {
            let p = partition_for(key, 8);
            assert!(p < 8);
            assert_eq!(p, partition_for(key, 8));
        }
    }

    #[test]
    fn single_partition_topics_always_use_zero() {
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn plain_receive_acknowledges_but_delivery_receive_does_not() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::mpsc;

        let acked = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();
        let sub = Subscription::new(rx);
        for n in 0..2 {
            let acked = acked.clone();
            tx.send(Delivery::with_ack(n, Ack::new(move || {
                acked.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        }

        let delivery = sub.recv_delivery_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(delivery.message, 0);
        assert_eq!(acked.load(Ordering::SeqCst), 0);
        drop(delivery);
        assert_eq!(acked.load(Ordering::SeqCst), 0);

        assert_eq!(sub.drain(), vec![1]);
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fnv1a_reference_value() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(partition_for("a", u32::MAX), 0xe40c_292c % u32::MAX);
    }
}
