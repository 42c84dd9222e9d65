//! Load-task lifecycle.
//!
//! ```text
//! Scheduled ──► Loaded
//!     │  └────► Failed
//!     ▼
//! WaitsForRetry ──► Scheduled (attempt + 1)
//!     └───────────► Failed
//! ```
//!
//! `Loaded` and `Failed` are terminal. `Scheduled` and `WaitsForRetry` form the
//! pending subset ([`PendingStatus`]).
//!
//! `attempt` counts executions: the initial `Scheduled` status carries attempt `0`
//! (nothing executed yet), and the status written after the n-th execution carries
//! attempt `n`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult, ErrorClass};

/// Last error recorded for a task, kept for diagnostic display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: ErrorClass,
    pub message: String,
}

impl TaskError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledStatus {
    pub scheduled_at: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitsForRetryStatus {
    pub attempt: u32,
    pub retry_at: DateTime<Utc>,
    pub last_error: TaskError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStatus {
    pub attempt: u32,
    pub last_error: TaskError,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedStatus {
    pub loaded_at: DateTime<Utc>,
    pub attempt: u32,
}

/// Status discriminant, for filtering and counting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduled,
    WaitsForRetry,
    Failed,
    Loaded,
}

/// Current state of a load task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadTaskStatus {
    Scheduled(ScheduledStatus),
    WaitsForRetry(WaitsForRetryStatus),
    Failed(FailedStatus),
    Loaded(LoadedStatus),
}

impl LoadTaskStatus {
    /// Initial status written by the dispatcher.
    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self::Scheduled(ScheduledStatus {
            scheduled_at: at,
            attempt: 0,
        })
    }

    pub fn state(&self) -> TaskState {
        match self {
            Self::Scheduled(_) => TaskState::Scheduled,
            Self::WaitsForRetry(_) => TaskState::WaitsForRetry,
            Self::Failed(_) => TaskState::Failed,
            Self::Loaded(_) => TaskState::Loaded,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Loaded(_))
    }

    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    pub fn attempt(&self) -> u32 {
        match self {
            Self::Scheduled(s) => s.attempt,
            Self::WaitsForRetry(s) => s.attempt,
            Self::Failed(s) => s.attempt,
            Self::Loaded(s) => s.attempt,
        }
    }

    pub fn as_pending(&self) -> Option<PendingStatus> {
        match self {
            Self::Scheduled(s) => Some(PendingStatus::Scheduled(s.clone())),
            Self::WaitsForRetry(s) => Some(PendingStatus::WaitsForRetry(s.clone())),
            Self::Failed(_) | Self::Loaded(_) => None,
        }
    }

    pub fn as_failed(&self) -> Option<&FailedStatus> {
        match self {
            Self::Failed(s) => Some(s),
            _ => None,
        }
    }

    /// Validate a transition against the lifecycle.
    pub fn ensure_transition(&self, next: &LoadTaskStatus) -> DomainResult<()> {
        let allowed = match (self, next) {
            (Self::Scheduled(_), Self::Loaded(_) | Self::WaitsForRetry(_) | Self::Failed(_)) => {
                true
            }
            (Self::WaitsForRetry(prev), Self::Scheduled(s)) => s.attempt == prev.attempt + 1,
            (Self::WaitsForRetry(_), Self::Failed(_)) => true,
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "{:?}(attempt {}) -> {:?}(attempt {})",
                self.state(),
                self.attempt(),
                next.state(),
                next.attempt()
            )))
        }
    }
}

/// Non-terminal subset of [`LoadTaskStatus`], used to render in-flight cache views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PendingStatus {
    Scheduled(ScheduledStatus),
    WaitsForRetry(WaitsForRetryStatus),
}

impl PendingStatus {
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Scheduled(s) => s.attempt,
            Self::WaitsForRetry(s) => s.attempt,
        }
    }
}

impl From<PendingStatus> for LoadTaskStatus {
    fn from(value: PendingStatus) -> Self {
        match value {
            PendingStatus::Scheduled(s) => Self::Scheduled(s),
            PendingStatus::WaitsForRetry(s) => Self::WaitsForRetry(s),
        }
    }
}
