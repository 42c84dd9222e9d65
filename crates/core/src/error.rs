//! Domain error model and the loader error taxonomy.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures such as validation and invalid
/// state transitions. Store and broker failures belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status transition not allowed by the task lifecycle.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }
}

/// Classification recorded with every failed execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retryable; drives `WaitsForRetry` while attempts remain.
    Transient,
    /// Non-retryable; drives `Failed` regardless of attempt count.
    Permanent,
    /// Synthetic: applied by the retry policy once attempts are used up.
    RetriesExhausted,
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::RetriesExhausted => "retries_exhausted",
        };
        f.write_str(s)
    }
}

/// Error raised by a loader function.
///
/// Loaders classify their own failures. A transient failure may carry partial
/// progress (`resume_state`) which is persisted with the task and handed back to
/// the loader on the next attempt.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoaderError {
    #[error("transient loader error: {message}")]
    Transient {
        message: String,
        resume_state: Option<JsonValue>,
    },

    #[error("permanent loader error: {message}")]
    Permanent { message: String },
}

impl LoaderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            resume_state: None,
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent {
            message: msg.into(),
        }
    }

    /// Wrap an arbitrary error as retryable, keeping the full context chain.
    pub fn transient_from(err: anyhow::Error) -> Self {
        Self::transient(format!("{err:#}"))
    }

    /// Attach resumable state. Permanent errors ignore it.
    pub fn with_resume_state(self, state: JsonValue) -> Self {
        match self {
            Self::Transient { message, .. } => Self::Transient {
                message,
                resume_state: Some(state),
            },
            permanent => permanent,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Permanent { .. } => ErrorClass::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Permanent { message } => message,
        }
    }

    pub fn resume_state(&self) -> Option<&JsonValue> {
        match self {
            Self::Transient { resume_state, .. } => resume_state.as_ref(),
            Self::Permanent { .. } => None,
        }
    }
}
