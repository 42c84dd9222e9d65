//! Execution worker: runs one attempt of a load task per dispatch message.
//!
//! Delivery is at-least-once and possibly out of order, so `handle` is
//! idempotent:
//!
//! - the task must still be `Scheduled` with the attempt named by the message;
//!   terminal tasks and stale attempts are skipped without error
//! - the resulting transition is a compare-and-set against the version read
//!   before executing; losing the race drops the result
//!
//! Only terminal transitions (`Loaded`, `Failed`) are announced through the
//! notification fan-out. A failed announcement fails `handle`, so the message
//! is not acknowledged; its redelivery finds the task terminal and announces
//! it again. Listeners deduplicate by task id.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use loadcache_core::{
    Clock, ErrorClass, ExpectedVersion, FailedStatus, LoadTaskStatus, LoadType, LoadedStatus,
    LoaderError, TaskError, WaitsForRetryStatus,
};
use loadcache_events::{DispatchMessage, LoadNotification, LoadTopics, MessageBus};

use crate::error::LoadError;
use crate::loader::{LoadContext, Loader, LoaderRegistry};
use crate::notifications::Notifier;
use crate::retry::{RetryDecision, RetryPolicies};
use crate::store::{StoreError, TaskStatusRecord, TaskStatusStore};
use crate::workers::{ConsumerWorker, WorkerHandle};

/// Why a message was dropped without executing the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No record for the task id (never written, or expired).
    UnknownTask,
    /// Task already `Loaded` or `Failed`.
    AlreadyTerminal,
    /// Message is for an attempt the task has moved past.
    StaleAttempt,
    /// Another writer changed the task while the loader ran.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Loaded,
    RetryScheduled {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        attempt: u32,
        class: ErrorClass,
    },
    Skipped(SkipReason),
}

pub struct LoadWorker {
    store: Arc<dyn TaskStatusStore>,
    loaders: Arc<LoaderRegistry>,
    notifier: Arc<dyn Notifier>,
    policies: RetryPolicies,
    clock: Arc<dyn Clock>,
}

impl LoadWorker {
    pub fn new(
        store: Arc<dyn TaskStatusStore>,
        loaders: Arc<LoaderRegistry>,
        notifier: Arc<dyn Notifier>,
        policies: RetryPolicies,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            loaders,
            notifier,
            policies,
            clock,
        }
    }

    pub fn handle(&self, message: &DispatchMessage) -> Result<HandleOutcome, LoadError> {
        let Some(record) = self.store.get(message.task_id)? else {
            warn!(
                load_type = %message.load_type,
                key = %message.key,
                task_id = %message.task_id,
                "dispatch for unknown task; dropping"
            );
            return Ok(HandleOutcome::Skipped(SkipReason::UnknownTask));
        };

        let attempt = match &record.status {
            LoadTaskStatus::Scheduled(s) if s.attempt == message.attempt => s.attempt.max(1),
            status if status.is_terminal() => {
                debug!(task_id = %record.task_id, state = ?status.state(), "task already finished; dropping redelivery");
                if status.attempt() == message.attempt.max(1) {
                    self.notify_terminal(&record)?;
                }
                return Ok(HandleOutcome::Skipped(SkipReason::AlreadyTerminal));
            }
            status => {
                debug!(
                    task_id = %record.task_id,
                    message_attempt = message.attempt,
                    task_attempt = status.attempt(),
                    state = ?status.state(),
                    "stale dispatch message; dropping"
                );
                return Ok(HandleOutcome::Skipped(SkipReason::StaleAttempt));
            }
        };

        let ctx = LoadContext {
            task_id: record.task_id,
            load_type: record.load_type.clone(),
            key: record.key.clone(),
            attempt,
            resume_state: record.resume_state.clone(),
        };

        let result = match self.loaders.get(&record.load_type) {
            Some(loader) => run_loader(loader.as_ref(), &ctx),
            None => Err(LoaderError::permanent(
                LoadError::UnknownLoadType(record.load_type.clone()).to_string(),
            )),
        };

        let now = self.clock.now();
        let (next, resume_state) = match result {
            Ok(()) => (
                LoadTaskStatus::Loaded(LoadedStatus {
                    loaded_at: now,
                    attempt,
                }),
                None,
            ),
            Err(err) => {
                let resume_state = err
                    .resume_state()
                    .cloned()
                    .or_else(|| record.resume_state.clone());
                (self.failure_status(&record.load_type, attempt, &err, now), resume_state)
            }
        };

        record.status.ensure_transition(&next)?;

        let updated = match self.store.compare_and_set(
            record.task_id,
            ExpectedVersion::Exact(record.version),
            next,
            resume_state,
        ) {
            Ok(updated) => updated,
            Err(StoreError::Conflict { actual, .. }) => {
                info!(
                    task_id = %record.task_id,
                    expected = record.version,
                    actual,
                    "task changed while loading; dropping result"
                );
                return Ok(HandleOutcome::Skipped(SkipReason::Conflict));
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match &updated.status {
            LoadTaskStatus::Loaded(_) => {
                info!(load_type = %updated.load_type, key = %updated.key, task_id = %updated.task_id, attempt, "load finished");
                HandleOutcome::Loaded
            }
            LoadTaskStatus::WaitsForRetry(w) => {
                info!(
                    load_type = %updated.load_type,
                    key = %updated.key,
                    task_id = %updated.task_id,
                    attempt,
                    retry_at = %w.retry_at,
                    error = %w.last_error.message,
                    "load failed; retry scheduled"
                );
                HandleOutcome::RetryScheduled {
                    attempt,
                    retry_at: w.retry_at,
                }
            }
            LoadTaskStatus::Failed(f) => {
                warn!(
                    load_type = %updated.load_type,
                    key = %updated.key,
                    task_id = %updated.task_id,
                    attempt,
                    class = %f.last_error.class,
                    error = %f.last_error.message,
                    "load failed"
                );
                HandleOutcome::Failed {
                    attempt,
                    class: f.last_error.class,
                }
            }
            LoadTaskStatus::Scheduled(_) => HandleOutcome::Skipped(SkipReason::StaleAttempt),
        };

        if updated.status.is_terminal() {
            self.notify_terminal(&updated)?;
        }

        Ok(outcome)
    }

    fn notify_terminal(&self, record: &TaskStatusRecord) -> Result<(), LoadError> {
        let notification = LoadNotification {
            load_type: record.load_type.clone(),
            key: record.key.clone(),
            task_id: record.task_id,
            status: record.status.clone(),
        };
        self.notifier.notify(notification).inspect_err(|e| {
            error!(task_id = %record.task_id, error = %e, "failed to publish load notification");
        })
    }

    fn failure_status(
        &self,
        load_type: &LoadType,
        attempt: u32,
        err: &LoaderError,
        now: DateTime<Utc>,
    ) -> LoadTaskStatus {
        match self.policies.for_type(load_type).decide(attempt, err) {
            RetryDecision::RetryAfter(delay) => {
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay));
                match retry_at {
                    Some(retry_at) => LoadTaskStatus::WaitsForRetry(WaitsForRetryStatus {
                        attempt,
                        retry_at,
                        last_error: TaskError::new(err.class(), err.message()),
                    }),
                    None => {
                        warn!(
                            load_type = %load_type,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retry delay out of range; failing task"
                        );
                        LoadTaskStatus::Failed(FailedStatus {
                            attempt,
                            last_error: TaskError::new(ErrorClass::RetriesExhausted, err.message()),
                            failed_at: now,
                        })
                    }
                }
            }
            RetryDecision::GiveUp(class) => LoadTaskStatus::Failed(FailedStatus {
                attempt,
                last_error: TaskError::new(class, err.message()),
                failed_at: now,
            }),
        }
    }

    /// Start one consumer thread per partition of `dispatch.<type>`.
    pub fn spawn<B>(
        self: &Arc<Self>,
        bus: &B,
        topics: &LoadTopics,
        load_type: &LoadType,
        group: &str,
    ) -> Result<Vec<WorkerHandle>, LoadError>
    where
        B: MessageBus<DispatchMessage>,
    {
        let topic = topics.dispatch(load_type);
        let mut handles = Vec::new();

        for partition in 0..bus.partition_count() {
            let sub = bus
                .subscribe(&topic, group, partition)
                .map_err(|e| LoadError::Publish(e.to_string()))?;
            let worker = Arc::clone(self);
            handles.push(ConsumerWorker::spawn(
                format!("load-worker-{load_type}-{partition}"),
                sub,
                move |message: &DispatchMessage| worker.handle(message).map(|_| ()),
            ));
        }

        Ok(handles)
    }
}

/// Run the loader, turning a panic into a transient failure.
fn run_loader(loader: &dyn Loader, ctx: &LoadContext) -> Result<(), LoaderError> {
    panic::catch_unwind(AssertUnwindSafe(|| loader.load(ctx))).unwrap_or_else(|payload| {
        Err(LoaderError::transient(format!(
            "loader panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
