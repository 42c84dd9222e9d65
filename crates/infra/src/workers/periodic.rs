use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use super::WorkerHandle;

/// Skip-if-running guard: at most one active run at a time.
#[derive(Debug, Default)]
pub struct RunGuard {
    running: AtomicBool,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless another run is in progress; `None` means skipped.
    pub fn try_run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        struct Release<'a>(&'a AtomicBool);
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }

        let _release = Release(&self.running);
        Some(f())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Fixed-delay timer thread.
///
/// Waits `interval`, runs the task, waits `interval` again (the delay counts
/// from the end of the previous run). Runs never overlap.
#[derive(Debug)]
pub struct PeriodicWorker;

impl PeriodicWorker {
    pub fn spawn<T, R, E>(name: impl Into<String>, interval: Duration, task: Arc<T>) -> WorkerHandle
    where
        T: Fn() -> Result<R, E> + Send + Sync + 'static,
        R: core::fmt::Debug,
        E: core::fmt::Display,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&thread_name, interval, shutdown_rx, task.as_ref()))
            .expect("failed to spawn periodic worker thread");

        WorkerHandle::new(name, shutdown_tx, join)
    }
}

fn timer_loop<T, R, E>(name: &str, interval: Duration, shutdown_rx: mpsc::Receiver<()>, task: &T)
where
    T: Fn() -> Result<R, E>,
    R: core::fmt::Debug,
    E: core::fmt::Display,
{
    info!(worker = name, interval_ms = interval.as_millis() as u64, "periodic worker started");

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        match task() {
            Ok(result) => debug!(worker = name, result = ?result, "periodic run finished"),
            Err(err) => error!(worker = name, error = %err, "periodic run failed"),
        }
    }

    info!(worker = name, "periodic worker stopped");
}
