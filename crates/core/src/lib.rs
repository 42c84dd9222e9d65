//! `loadcache-core`: domain building blocks for the load-and-cache subsystem.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): task
//! identifiers, the load-task state machine, the composite cache-entry view, the
//! loader error taxonomy and the clock abstraction used to timestamp transitions.

pub mod clock;
pub mod entry;
pub mod error;
pub mod id;
pub mod status;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, CachedValue};
pub use error::{DomainError, DomainResult, ErrorClass, LoaderError};
pub use id::{LoadTaskId, LoadType};
pub use status::{
    FailedStatus, LoadTaskStatus, LoadedStatus, PendingStatus, ScheduledStatus, TaskError,
    TaskState, WaitsForRetryStatus,
};
pub use version::ExpectedVersion;
