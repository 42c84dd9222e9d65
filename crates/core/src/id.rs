//! Strongly-typed identifiers used across the subsystem.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of one scheduling call (one load task).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadTaskId(Uuid);

impl LoadTaskId {
    /// Mint a new task identifier.
    ///
    /// Uses UUIDv7 (time-ordered), so ids minted later sort after earlier ones.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LoadTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LoadTaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for LoadTaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<LoadTaskId> for Uuid {
    fn from(value: LoadTaskId) -> Self {
        value.0
    }
}

impl FromStr for LoadTaskId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("LoadTaskId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Namespace tag for a kind of loadable resource (e.g. `nft-item-meta`).
///
/// Selects the loader, the retry policy and the topic names. Used verbatim in
/// topic names, so only ASCII alphanumerics, `-`, `_` and `.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LoadType(String);

impl LoadType {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::validation("load type must not be empty"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(DomainError::validation(format!(
                "load type {name:?} contains unsupported character {c:?}"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LoadType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LoadType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LoadType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LoadType> for String {
    fn from(value: LoadType) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_parse_back_from_display() {
        let id = LoadTaskId::new();
        let parsed: LoadTaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn task_id_rejects_garbage() {
        let err = "not-a-uuid".parse::<LoadTaskId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }

    #[test]
    fn load_type_accepts_topic_safe_names() {
        let t = LoadType::new("nft-item-meta").unwrap();
        assert_eq!(t.as_str(), "nft-item-meta");
        assert!(LoadType::new("collection_meta.v2").is_ok());
    }

    #[test]
    fn load_type_rejects_empty_and_unsafe_names() {
        assert!(LoadType::new("").is_err());
        assert!(LoadType::new("with space").is_err());
        assert!(LoadType::new("slash/ed").is_err());
    }

    #[test]
    fn load_type_deserialization_validates() {
        let ok: LoadType = serde_json::from_str("\"item\"").unwrap();
        assert_eq!(ok.as_str(), "item");
        assert!(serde_json::from_str::<LoadType>("\"bad name\"").is_err());
    }
}
