//! Infrastructure layer: stores, dispatch, execution, retries, notifications.
//!
//! ```text
//! CacheViewService::update ──▶ LoadDispatcher ──▶ dispatch.<type> ──▶ LoadWorker
//!                                   │                                    │
//!                            TaskStatusStore ◀── RetrySweeper ◀── WaitsForRetry
//!                                                                        │
//!                       ListenerGroup ◀── notifications.<type> ◀── Loaded / Failed
//! ```

pub mod cache_view;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod loader;
pub mod message_bus;
pub mod notifications;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod sweeper;
pub mod workers;


pub use cache_view::CacheViewService;
pub use config::LoaderConfig;
pub use dispatcher::{LoadDispatcher, LoadScheduler};
pub use error::LoadError;
pub use execution::{HandleOutcome, LoadWorker, SkipReason};
pub use loader::{CacheLoader, CacheLoaderAdapter, LoadContext, Loader, LoaderRegistry};
pub use notifications::{
    ListenerGroup, LoadNotificationListener, NotificationFanout, Notifier,
};
pub use retry::{BackoffStrategy, RetryDecision, RetryOverride, RetryPolicies, RetryPolicy};
pub use runtime::{LoaderRuntime, LoaderRuntimeBuilder, LoaderStores};
pub use sweeper::{RetrySweeper, SweepReport};
