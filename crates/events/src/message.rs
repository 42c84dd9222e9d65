//! Messages exchanged over the bus.

use serde::{Deserialize, Serialize};

use loadcache_core::{LoadTaskId, LoadTaskStatus, LoadType};

use crate::bus::Keyed;

/// Request to execute one attempt of a load task.
///
/// Published on `dispatch.<type>`, keyed by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub load_type: LoadType,
    pub key: String,
    pub task_id: LoadTaskId,
    /// Attempt number of the `Scheduled` status this message was published for.
    pub attempt: u32,
}

impl DispatchMessage {
    pub fn new(
        load_type: LoadType,
        key: impl Into<String>,
        task_id: LoadTaskId,
        attempt: u32,
    ) -> Self {
        Self {
            load_type,
            key: key.into(),
            task_id,
            attempt,
        }
    }
}

impl Keyed for DispatchMessage {
    fn partition_key(&self) -> &str {
        &self.key
    }
}

/// Emitted once a task reaches `Loaded` or `Failed`.
///
/// Published on `notifications.<type>`, keyed by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadNotification {
    pub load_type: LoadType,
    pub key: String,
    pub task_id: LoadTaskId,
    pub status: LoadTaskStatus,
}

impl Keyed for LoadNotification {
    fn partition_key(&self) -> &str {
        &self.key
    }
}
