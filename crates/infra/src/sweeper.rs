//! Retry sweeper: moves due `WaitsForRetry` tasks back to `Scheduled`.
//!
//! ```text
//! every sweep_interval:
//!   list WaitsForRetry with retry_at <= now (batch)
//!     attempt < max_attempts  → CAS Scheduled{now, attempt + 1}, re-dispatch
//!     attempt >= max_attempts → notify Failed{RetriesExhausted}, then CAS
//! ```
//!
//! Several sweepers may run against the same store. The compare-and-set on the
//! record version makes sure each due retry is re-dispatched once; the loser
//! skips the record. Racing sweepers may both announce an exhausted task;
//! listeners deduplicate by task id. Runs of one sweeper never overlap.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info};

use loadcache_core::{
    Clock, DomainError, ErrorClass, ExpectedVersion, FailedStatus, LoadTaskStatus, ScheduledStatus, TaskError,
};
use loadcache_events::{DispatchMessage, LoadNotification};

use crate::dispatcher::LoadScheduler;
use crate::error::LoadError;
use crate::notifications::Notifier;
use crate::retry::RetryPolicies;
use crate::store::{StoreError, TaskStatusRecord, TaskStatusStore};
use crate::workers::{PeriodicWorker, RunGuard, WorkerHandle};

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub redispatched: usize,
    pub failed: usize,
    /// Records another writer changed first.
    pub skipped: usize,
    pub errors: usize,
}

enum Swept {
    Redispatched,
    Failed,
}

pub struct RetrySweeper {
    store: Arc<dyn TaskStatusStore>,
    scheduler: Arc<dyn LoadScheduler>,
    notifier: Arc<dyn Notifier>,
    policies: RetryPolicies,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    guard: RunGuard,
}

impl RetrySweeper {
    pub fn new(
        store: Arc<dyn TaskStatusStore>,
        scheduler: Arc<dyn LoadScheduler>,
        notifier: Arc<dyn Notifier>,
        policies: RetryPolicies,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            scheduler,
            notifier,
            policies,
            clock,
            batch_size,
            guard: RunGuard::new(),
        }
    }

    /// Run one sweep. Returns `None` if a sweep is already in progress.
    pub fn sweep_once(&self) -> Result<Option<SweepReport>, LoadError> {
        self.guard.try_run(|| self.sweep()).transpose()
    }

    fn sweep(&self) -> Result<SweepReport, LoadError> {
        let now = self.clock.now();
        let due = self.store.list_due_retries(now, self.batch_size)?;

        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        info!(count = due.len(), "scheduling tasks to retry");

        for record in due {
            let task_id = record.task_id;
            match self.sweep_record(record) {
                Ok(Swept::Redispatched) => report.redispatched += 1,
                Ok(Swept::Failed) => report.failed += 1,
                Err(LoadError::Store(StoreError::Conflict { .. })) => {
                    debug!(task_id = %task_id, "retry already handled elsewhere");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "failed to schedule retry");
                    report.errors += 1;
                }
            }
        }

        info!(
            redispatched = report.redispatched,
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors,
            "finished scheduling tasks to retry"
        );
        Ok(report)
    }

    fn sweep_record(&self, record: TaskStatusRecord) -> Result<Swept, LoadError> {
        let LoadTaskStatus::WaitsForRetry(waiting) = &record.status else {
            return Err(DomainError::invalid_transition(format!(
                "{:?} is not waiting for retry",
                record.status.state()
            ))
            .into());
        };

        let now = self.clock.now();
        let policy = self.policies.for_type(&record.load_type);

        if waiting.attempt >= policy.max_attempts {
            let next = LoadTaskStatus::Failed(FailedStatus {
                attempt: waiting.attempt,
                last_error: TaskError::new(
                    ErrorClass::RetriesExhausted,
                    waiting.last_error.message.clone(),
                ),
                failed_at: now,
            });
            record.status.ensure_transition(&next)?;

            // Announce first: if publishing fails the task stays due and the
            // next sweep tries again.
            self.notifier.notify(LoadNotification {
                load_type: record.load_type.clone(),
                key: record.key.clone(),
                task_id: record.task_id,
                status: next.clone(),
            })?;
            self.store.compare_and_set(
                record.task_id,
                ExpectedVersion::Exact(record.version),
                next,
                record.resume_state.clone(),
            )?;
            return Ok(Swept::Failed);
        }

        let attempt = waiting.attempt + 1;
        let next = LoadTaskStatus::Scheduled(ScheduledStatus {
            scheduled_at: now,
            attempt,
        });
        record.status.ensure_transition(&next)?;
        self.store.compare_and_set(
            record.task_id,
            ExpectedVersion::Exact(record.version),
            next,
            record.resume_state.clone(),
        )?;

        debug!(task_id = %record.task_id, attempt, "retry scheduled");

        self.scheduler.redispatch(DispatchMessage::new(
            record.load_type,
            record.key,
            record.task_id,
            attempt,
        ))?;
        Ok(Swept::Redispatched)
    }

    /// Run [`sweep_once`](Self::sweep_once) every `interval` on a named thread.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> WorkerHandle {
        let sweeper = Arc::clone(self);
        PeriodicWorker::spawn(
            "retry-sweeper",
            interval,
            Arc::new(move || sweeper.sweep_once()),
        )
    }
}
