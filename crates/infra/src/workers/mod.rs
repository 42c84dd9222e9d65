//! Background worker threads.
//!
//! - [`ConsumerWorker`]: drains one bus subscription (one topic partition)
//! - [`PeriodicWorker`]: runs a task on a fixed delay, at most one run at a time

pub mod consumer;
pub mod periodic;

pub use consumer::ConsumerWorker;
pub use periodic::{PeriodicWorker, RunGuard};

use std::sync::mpsc;
use std::thread;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String, shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
