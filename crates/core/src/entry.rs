//! Composite read model: cached value presence merged with task status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{FailedStatus, LoadTaskStatus, PendingStatus};

/// A value as held by the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedValue<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedValue<T> {
    pub fn new(data: T, cached_at: DateTime<Utc>) -> Self {
        Self { data, cached_at }
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<CachedValue<U>, E> {
        Ok(CachedValue {
            data: f(self.data)?,
            cached_at: self.cached_at,
        })
    }
}

/// Result of a cache read.
///
/// Exactly one variant is produced per read. Variants carrying `data` always carry
/// the `cached_at` of that data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheEntry<T> {
    Loaded {
        cached_at: DateTime<Utc>,
        data: T,
    },
    LoadedAndUpdateScheduled {
        cached_at: DateTime<Utc>,
        data: T,
        pending: PendingStatus,
    },
    LoadedAndUpdateFailed {
        cached_at: DateTime<Utc>,
        data: T,
        failed: FailedStatus,
    },
    InitialLoadScheduled {
        pending: PendingStatus,
    },
    InitialFailed {
        failed: FailedStatus,
    },
    NotAvailable,
}

impl<T> CacheEntry<T> {
    /// Merge the cached value (if any) with the status of the key's latest task.
    ///
    /// With a cached value:
    /// - pending task: `LoadedAndUpdateScheduled`
    /// - task failed at or after the value was cached: `LoadedAndUpdateFailed`
    /// - otherwise: `Loaded`
    ///
    /// Without one:
    /// - pending task: `InitialLoadScheduled`
    /// - failed task: `InitialFailed`
    /// - loaded or unknown task, or no task: `NotAvailable`
    pub fn compose(cached: Option<CachedValue<T>>, status: Option<LoadTaskStatus>) -> Self {
        match (cached, status) {
            (Some(c), Some(status)) => match status {
                LoadTaskStatus::Scheduled(s) => Self::refreshing(c, PendingStatus::Scheduled(s)),
                LoadTaskStatus::WaitsForRetry(s) => {
                    Self::refreshing(c, PendingStatus::WaitsForRetry(s))
                }
                LoadTaskStatus::Failed(failed) if failed.failed_at >= c.cached_at => {
                    Self::LoadedAndUpdateFailed {
                        cached_at: c.cached_at,
                        data: c.data,
                        failed,
                    }
                }
                LoadTaskStatus::Failed(_) | LoadTaskStatus::Loaded(_) => Self::loaded(c),
            },
            (Some(c), None) => Self::loaded(c),
            (None, Some(status)) => match status {
                LoadTaskStatus::Scheduled(s) => Self::InitialLoadScheduled {
                    pending: PendingStatus::Scheduled(s),
                },
                LoadTaskStatus::WaitsForRetry(s) => Self::InitialLoadScheduled {
                    pending: PendingStatus::WaitsForRetry(s),
                },
                LoadTaskStatus::Failed(failed) => Self::InitialFailed { failed },
                LoadTaskStatus::Loaded(_) => Self::NotAvailable,
            },
            (None, None) => Self::NotAvailable,
        }
    }

    fn refreshing(c: CachedValue<T>, pending: PendingStatus) -> Self {
        Self::LoadedAndUpdateScheduled {
            cached_at: c.cached_at,
            data: c.data,
            pending,
        }
    }

    fn loaded(c: CachedValue<T>) -> Self {
        Self::Loaded {
            cached_at: c.cached_at,
            data: c.data,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Loaded { data, .. }
            | Self::LoadedAndUpdateScheduled { data, .. }
            | Self::LoadedAndUpdateFailed { data, .. } => Some(data),
            Self::InitialLoadScheduled { .. } | Self::InitialFailed { .. } | Self::NotAvailable => {
                None
            }
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Loaded { data, .. }
            | Self::LoadedAndUpdateScheduled { data, .. }
            | Self::LoadedAndUpdateFailed { data, .. } => Some(data),
            Self::InitialLoadScheduled { .. } | Self::InitialFailed { .. } | Self::NotAvailable => {
                None
            }
        }
    }

    pub fn cached_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Loaded { cached_at, .. }
            | Self::LoadedAndUpdateScheduled { cached_at, .. }
            | Self::LoadedAndUpdateFailed { cached_at, .. } => Some(*cached_at),
            Self::InitialLoadScheduled { .. } | Self::InitialFailed { .. } | Self::NotAvailable => {
                None
            }
        }
    }

    /// Last failure, for `InitialFailed` / `LoadedAndUpdateFailed`.
    pub fn failure(&self) -> Option<&FailedStatus> {
        match self {
            Self::LoadedAndUpdateFailed { failed, .. } | Self::InitialFailed { failed } => {
                Some(failed)
            }
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.data().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::status::{LoadedStatus, ScheduledStatus, TaskError, WaitsForRetryStatus};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn cached(secs: i64) -> Option<CachedValue<&'static str>> {
        Some(CachedValue::new("D", at(secs)))
    }

    fn scheduled() -> LoadTaskStatus {
        LoadTaskStatus::Scheduled(ScheduledStatus {
            scheduled_at: at(5),
            attempt: 0,
        })
    }

    fn waiting() -> LoadTaskStatus {
        LoadTaskStatus::WaitsForRetry(WaitsForRetryStatus {
            attempt: 1,
            retry_at: at(6),
            last_error: TaskError::new(ErrorClass::Transient, "timeout"),
        })
    }

    fn failed_at(secs: i64) -> LoadTaskStatus {
        LoadTaskStatus::Failed(FailedStatus {
            attempt: 2,
            last_error: TaskError::new(ErrorClass::RetriesExhausted, "timeout"),
            failed_at: at(secs),
        })
    }

    fn loaded() -> LoadTaskStatus {
        LoadTaskStatus::Loaded(LoadedStatus {
            loaded_at: at(7),
            attempt: 1,
        })
    }

    #[test]
    fn missing_value_and_task_is_not_available() {
        let entry = CacheEntry::<&str>::compose(None, None);
        assert_eq!(entry, CacheEntry::NotAvailable);
        assert!(!entry.is_available());
    }

    #[test]
    fn initial_load_reflects_task_status() {
        assert!(matches!(
            CacheEntry::<&str>::compose(None, Some(scheduled())),
            CacheEntry::InitialLoadScheduled {
                pending: PendingStatus::Scheduled(_)
            }
        ));
        assert!(matches!(
            CacheEntry::<&str>::compose(None, Some(waiting())),
            CacheEntry::InitialLoadScheduled {
                pending: PendingStatus::WaitsForRetry(_)
            }
        ));
        assert!(matches!(
            CacheEntry::<&str>::compose(None, Some(failed_at(9))),
            CacheEntry::InitialFailed { .. }
        ));
    }

    #[test]
    fn loaded_task_without_value_means_removed_or_expired() {
        assert_eq!(
            CacheEntry::<&str>::compose(None, Some(loaded())),
            CacheEntry::NotAvailable
        );
    }

    #[test]
    fn cached_value_with_in_flight_refresh() {
        let entry = CacheEntry::compose(cached(1), Some(waiting()));
        assert!(matches!(entry, CacheEntry::LoadedAndUpdateScheduled { .. }));
        assert_eq!(entry.data(), Some(&"D"));
        assert_eq!(entry.cached_at(), Some(at(1)));
    }

    #[test]
    fn cached_value_with_failed_refresh() {
        let entry = CacheEntry::compose(cached(1), Some(failed_at(9)));
        assert!(matches!(entry, CacheEntry::LoadedAndUpdateFailed { .. }));
        assert_eq!(entry.failure().map(|f| f.attempt), Some(2));
    }

    #[test]
    fn failure_older_than_cached_value_is_ignored() {
        let entry = CacheEntry::compose(cached(10), Some(failed_at(9)));
        assert_eq!(
            entry,
            CacheEntry::Loaded {
                cached_at: at(10),
                data: "D"
            }
        );
    }

    #[test]
    fn cached_value_with_completed_task_is_loaded() {
        assert!(matches!(
            CacheEntry::compose(cached(1), Some(loaded())),
            CacheEntry::Loaded { .. }
        ));
        assert!(matches!(
            CacheEntry::compose(cached(1), None),
            CacheEntry::Loaded { .. }
        ));
    }
}
