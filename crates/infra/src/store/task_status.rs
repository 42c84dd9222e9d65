//! Task status records.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use loadcache_core::{ExpectedVersion, LoadTaskId, LoadTaskStatus, LoadType, TaskState};

use super::StoreError;

/// Persisted state of one load task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: LoadTaskId,
    pub load_type: LoadType,
    pub key: String,
    pub status: LoadTaskStatus,
    /// Incremented on every write; starts at 1.
    pub version: u64,
    /// Partial progress handed back to a resumable loader on the next attempt.
    pub resume_state: Option<JsonValue>,
}

impl TaskStatusRecord {
    /// A record ready to be inserted (version is assigned by the store).
    pub fn new(
        task_id: LoadTaskId,
        load_type: LoadType,
        key: impl Into<String>,
        status: LoadTaskStatus,
    ) -> Self {
        Self {
            task_id,
            load_type,
            key: key.into(),
            status,
            version: 0,
            resume_state: None,
        }
    }
}

/// Per-state record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatusCounts {
    pub scheduled: usize,
    pub waits_for_retry: usize,
    pub failed: usize,
    pub loaded: usize,
}

/// Task status store abstraction.
pub trait TaskStatusStore: Send + Sync {
    /// Insert a new record at version 1.
    fn insert(&self, record: TaskStatusRecord) -> Result<TaskStatusRecord, StoreError>;

    fn get(&self, task_id: LoadTaskId) -> Result<Option<TaskStatusRecord>, StoreError>;

    /// Replace status and resume state if the stored version matches `expected`.
    ///
    /// Returns the updated record (version bumped by one), or
    /// [`StoreError::Conflict`] when another writer got there first.
    fn compare_and_set(
        &self,
        task_id: LoadTaskId,
        expected: ExpectedVersion,
        status: LoadTaskStatus,
        resume_state: Option<JsonValue>,
    ) -> Result<TaskStatusRecord, StoreError>;

    /// `WaitsForRetry` records with `retry_at <= now`, earliest first.
    fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskStatusRecord>, StoreError>;

    fn list_by_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskStatusRecord>, StoreError>;

    fn status_counts(&self) -> Result<TaskStatusCounts, StoreError>;
}

impl<S> TaskStatusStore for Arc<S>
where
    S: TaskStatusStore + ?Sized,
{
    fn insert(&self, record: TaskStatusRecord) -> Result<TaskStatusRecord, StoreError> {
        (**self).insert(record)
    }

    fn get(&self, task_id: LoadTaskId) -> Result<Option<TaskStatusRecord>, StoreError> {
        (**self).get(task_id)
    }

    fn compare_and_set(
        &self,
        task_id: LoadTaskId,
        expected: ExpectedVersion,
        status: LoadTaskStatus,
        resume_state: Option<JsonValue>,
    ) -> Result<TaskStatusRecord, StoreError> {
        (**self).compare_and_set(task_id, expected, status, resume_state)
    }

    fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskStatusRecord>, StoreError> {
        (**self).list_due_retries(now, limit)
    }

    fn list_by_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskStatusRecord>, StoreError> {
        (**self).list_by_state(state, limit)
    }

    fn status_counts(&self) -> Result<TaskStatusCounts, StoreError> {
        (**self).status_counts()
    }
}

/// In-memory task status store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStatusStore {
    records: RwLock<HashMap<LoadTaskId, TaskStatusRecord>>,
}

impl InMemoryTaskStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TaskStatusStore for InMemoryTaskStatusStore {
    fn insert(&self, mut record: TaskStatusRecord) -> Result<TaskStatusRecord, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        if records.contains_key(&record.task_id) {
            return Err(StoreError::AlreadyExists(record.task_id));
        }
        record.version = 1;
        records.insert(record.task_id, record.clone());
        Ok(record)
    }

    fn get(&self, task_id: LoadTaskId) -> Result<Option<TaskStatusRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        Ok(records.get(&task_id).cloned())
    }

    fn compare_and_set(
        &self,
        task_id: LoadTaskId,
        expected: ExpectedVersion,
        status: LoadTaskStatus,
        resume_state: Option<JsonValue>,
    ) -> Result<TaskStatusRecord, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        let record = records
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;

        if !expected.matches(record.version) {
            return Err(StoreError::Conflict {
                task_id,
                expected,
                actual: record.version,
            });
        }

        record.status = status;
        record.resume_state = resume_state;
        record.version += 1;
        Ok(record.clone())
    }

    fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskStatusRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let mut due: Vec<_> = records
            .values()
            .filter(|r| match &r.status {
                LoadTaskStatus::WaitsForRetry(w) => w.retry_at <= now,
                _ => false,
            })
            .cloned()
            .collect();

        due.sort_by_key(|r| match &r.status {
            LoadTaskStatus::WaitsForRetry(w) => (w.retry_at, r.task_id),
            _ => (now, r.task_id),
        });
        due.truncate(limit);
        Ok(due)
    }

    fn list_by_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskStatusRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| r.status.state() == state)
            .cloned()
            .collect();

        // UUIDv7 ids sort by creation time.
        result.sort_by_key(|r| r.task_id);
        result.truncate(limit);
        Ok(result)
    }

    fn status_counts(&self) -> Result<TaskStatusCounts, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        let mut counts = TaskStatusCounts::default();
        for record in records.values() {
            match record.status.state() {
                TaskState::Scheduled => counts.scheduled += 1,
                TaskState::WaitsForRetry => counts.waits_for_retry += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Loaded => counts.loaded += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadcache_core::{ErrorClass, LoadedStatus, TaskError, WaitsForRetryStatus};

    fn item() -> LoadType {
        LoadType::new("item").unwrap()
    }

    fn scheduled_record(key: &str) -> TaskStatusRecord {
        TaskStatusRecord::new(
            LoadTaskId::new(),
            item(),
            key,
            LoadTaskStatus::scheduled(Utc::now()),
        )
    }

    fn waiting(attempt: u32, retry_at: DateTime<Utc>) -> LoadTaskStatus {
        LoadTaskStatus::WaitsForRetry(WaitsForRetryStatus {
            attempt,
            retry_at,
            last_error: TaskError::new(ErrorClass::Transient, "timeout"),
        })
    }

    #[test]
    fn insert_assigns_version_one() {
        let store = InMemoryTaskStatusStore::new();
        let inserted = store.insert(scheduled_record("k")).unwrap();

        assert_eq!(inserted.version, 1);
        assert_eq!(store.get(inserted.task_id).unwrap(), Some(inserted));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryTaskStatusStore::new();
        let record = scheduled_record("k");
        store.insert(record.clone()).unwrap();

        assert!(matches!(
            store.insert(record),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn unknown_task_reads_as_none() {
        let store = InMemoryTaskStatusStore::new();
        assert_eq!(store.get(LoadTaskId::new()).unwrap(), None);
    }

    #[test]
    fn compare_and_set_bumps_version() {
        let store = InMemoryTaskStatusStore::new();
        let inserted = store.insert(scheduled_record("k")).unwrap();

        let loaded = LoadTaskStatus::Loaded(LoadedStatus {
            loaded_at: Utc::now(),
            attempt: 1,
        });
        let updated = store
            .compare_and_set(inserted.task_id, ExpectedVersion::Exact(1), loaded.clone(), None)
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, loaded);
    }

    #[test]
    fn stale_compare_and_set_conflicts() {
        let store = InMemoryTaskStatusStore::new();
        let inserted = store.insert(scheduled_record("k")).unwrap();
        let id = inserted.task_id;

        store
            .compare_and_set(id, ExpectedVersion::Exact(1), waiting(1, Utc::now()), None)
            .unwrap();
        let err = store
            .compare_and_set(id, ExpectedVersion::Exact(1), waiting(1, Utc::now()), None)
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: ExpectedVersion::Exact(1),
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn compare_and_set_on_missing_task_is_not_found() {
        let store = InMemoryTaskStatusStore::new();
        let err = store
            .compare_and_set(
                LoadTaskId::new(),
                ExpectedVersion::Any,
                LoadTaskStatus::scheduled(Utc::now()),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn due_retries_are_filtered_and_ordered() {
        let store = InMemoryTaskStatusStore::new();
        let now = Utc::now();

        let later = store.insert(scheduled_record("later")).unwrap();
        let sooner = store.insert(scheduled_record("sooner")).unwrap();
        let future = store.insert(scheduled_record("future")).unwrap();
        store.insert(scheduled_record("still-scheduled")).unwrap();

        for (record, retry_at) in [
            (&later, now - chrono::Duration::seconds(1)),
            (&sooner, now - chrono::Duration::seconds(5)),
            (&future, now + chrono::Duration::seconds(5)),
        ] {
            store
                .compare_and_set(record.task_id, ExpectedVersion::Exact(1), waiting(1, retry_at), None)
                .unwrap();
        }

        let due = store.list_due_retries(now, 10).unwrap();
        let keys: Vec<_> = due.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["sooner", "later"]);

        assert_eq!(store.list_due_retries(now, 1).unwrap().len(), 1);
    }

    #[test]
    fn counts_and_state_listing() {
        let store = InMemoryTaskStatusStore::new();
        let a = store.insert(scheduled_record("a")).unwrap();
        store.insert(scheduled_record("b")).unwrap();
        store
            .compare_and_set(a.task_id, ExpectedVersion::Exact(1), waiting(1, Utc::now()), None)
            .unwrap();

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.waits_for_retry, 1);
        assert_eq!(counts.loaded + counts.failed, 0);

        let waiting_records = store.list_by_state(TaskState::WaitsForRetry, 10).unwrap();
        assert_eq!(waiting_records.len(), 1);
        assert_eq!(waiting_records[0].key, "a");
    }
}
