use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use loadcache_events::{Delivery, Subscription};

use super::WorkerHandle;

/// Handler calls per message before it is left unacknowledged.
const HANDLER_ATTEMPTS: u32 = 3;

/// Pause before retrying a failed handler call (multiplied by the call number).
const HANDLER_BACKOFF: Duration = Duration::from_millis(50);

/// Generic subscription consumer loop.
///
/// - Drains one subscription (one partition of one topic for one group)
/// - Applies an idempotent handler to each message, in delivery order
/// - Acknowledges a message only after the handler returned `Ok`
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn a thread that feeds every message of `sub` to `handler`.
    ///
    /// `handler` must be idempotent (at-least-once delivery safe). A failing
    /// call is retried a few times; if it keeps failing the message is left
    /// unacknowledged, so a durable bus delivers it again later.
    pub fn spawn<M, H, E>(name: impl Into<String>, sub: Subscription<M>, mut handler: H) -> WorkerHandle
    where
        M: Send + 'static,
        H: FnMut(&M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&thread_name, sub, shutdown_rx, &mut handler))
            .expect("failed to spawn consumer worker thread");

        WorkerHandle::new(name, shutdown_tx, join)
    }
}

fn worker_loop<M, H, E>(
    name: &str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(&M) -> Result<(), E>,
    E: core::fmt::Display,
{
    let tick = Duration::from_millis(250);
    info!(worker = name, "consumer worker started");

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_delivery_timeout(tick) {
            Ok(Delivery { message, ack }) => match handle_with_retries(name, &message, handler, &shutdown_rx) {
                Handled::Done => ack.ack(),
                Handled::GaveUp => {}
                Handled::ShutdownRequested => break,
            },
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = name, "consumer worker stopped");
}

enum Handled {
    Done,
    GaveUp,
    ShutdownRequested,
}

fn handle_with_retries<M, H, E>(
    name: &str,
    message: &M,
    handler: &mut H,
    shutdown_rx: &mpsc::Receiver<()>,
) -> Handled
where
    H: FnMut(&M) -> Result<(), E>,
    E: core::fmt::Display,
{
    for call in 1..=HANDLER_ATTEMPTS {
        match handler(message) {
            Ok(()) => return Handled::Done,
            Err(err) if call < HANDLER_ATTEMPTS => {
                warn!(worker = name, call, error = %err, "consumer worker handler failed; retrying");
                // Shutdown ends the backoff early; the message stays unacknowledged.
                if shutdown_rx.recv_timeout(HANDLER_BACKOFF * call).is_ok() {
                    return Handled::ShutdownRequested;
                }
            }
            Err(err) => {
                error!(worker = name, call, error = %err, "consumer worker handler failed; leaving message unacknowledged");
            }
        }
    }
    Handled::GaveUp
}
