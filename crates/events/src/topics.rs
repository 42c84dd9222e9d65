//! Topic naming.

use serde::{Deserialize, Serialize};

use loadcache_core::LoadType;

/// Derives per-type topic names, optionally under a namespace prefix.
///
/// ```ignore
/// let topics = LoadTopics::new("prod");
/// assert_eq!(topics.dispatch(&item), "prod.dispatch.item");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTopics {
    prefix: String,
}

impl LoadTopics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn dispatch(&self, load_type: &LoadType) -> String {
        self.topic("dispatch", load_type)
    }

    pub fn notifications(&self, load_type: &LoadType) -> String {
        self.topic("notifications", load_type)
    }

    fn topic(&self, kind: &str, load_type: &LoadType) -> String {
        if self.prefix.is_empty() {
            format!("{kind}.{load_type}")
        } else {
            format!("{}.{kind}.{load_type}", self.prefix)
        }
    }
}
