//! Wire types shared by the coordinator and the shard node.
//!
//! Keeping these in one crate means both processes serialize and parse the
//! exact same JSON shapes; nothing here talks to a socket or a file.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Reserved separator between a partition key and a sort key in a storage key.
pub const SORT_KEY_SEPARATOR: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid role {0:?}, expected \"leader\" or \"follower\"")]
pub struct RoleParseError(String);

impl std::str::FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Put,
    Delete,
}

/// A single WAL entry, one JSON object per line on disk (§6.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub offset: u64,
    pub op: Op,
    pub key: String,
    /// `null` for `DELETE`.
    pub value: Option<serde_json::Value>,
    /// Wall-clock seconds at leader-apply time.
    pub ts: f64,
}

/// Wall-clock seconds as a float, matching the WAL's `ts` field.
pub fn now_ts() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("{field} must not contain the reserved separator '#'")]
    ReservedSeparator { field: &'static str },
}

/// Compose the storage key a shard indexes records under: `pk` if there is
/// no sort key, else `pk#sk`. Rejects inputs containing the separator
/// rather than escaping them (see SPEC_FULL.md §3).
pub fn storage_key(partition_key: &str, sort_key: Option<&str>) -> Result<String, KeyError> {
    if partition_key.contains(SORT_KEY_SEPARATOR) {
        return Err(KeyError::ReservedSeparator {
            field: "partition_key",
        });
    }
    match sort_key {
        None => Ok(partition_key.to_string()),
        Some(sk) => {
            if sk.contains(SORT_KEY_SEPARATOR) {
                return Err(KeyError::ReservedSeparator { field: "sort_key" });
            }
            Ok(format!("{partition_key}{SORT_KEY_SEPARATOR}{sk}"))
        }
    }
}

// --- Coordinator request/response payloads -------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub shard_id: String,
    pub url: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPayload {
    pub partition_key: String,
    #[serde(default)]
    pub sort_key: Option<String>,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuorumQuery {
    #[serde(default)]
    pub sort_key: Option<String>,
    #[serde(rename = "R", default = "default_r")]
    pub r: usize,
}

fn default_r() -> usize {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub sort_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumReadResponse {
    pub value: serde_json::Value,
    pub version: u64,
    pub quorum_met: bool,
}

// --- Shard request/response payloads --------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageWriteRequest {
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageWriteResponse {
    pub status: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageReadResponse {
    pub value: serde_json::Value,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub role: Role,
    pub shard_id: String,
    pub offset: u64,
    pub keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_without_sort_key_is_the_partition_key() {
        assert_eq!(storage_key("order-101", None).unwrap(), "order-101");
    }

    #[test]
    fn storage_key_with_sort_key_joins_with_hash() {
        assert_eq!(
            storage_key("user-vip", Some("order-2023-01")).unwrap(),
            "user-vip#order-2023-01"
        );
    }

    #[test]
    fn storage_key_rejects_reserved_separator_in_partition_key() {
        let err = storage_key("a#b", None).unwrap_err();
        assert_eq!(
            err,
            KeyError::ReservedSeparator {
                field: "partition_key"
            }
        );
    }

    #[test]
    fn storage_key_rejects_reserved_separator_in_sort_key() {
        let err = storage_key("pk", Some("a#b")).unwrap_err();
        assert_eq!(
            err,
            KeyError::ReservedSeparator { field: "sort_key" }
        );
    }

    #[test]
    fn op_serializes_as_uppercase_wire_literal() {
        assert_eq!(serde_json::to_string(&Op::Put).unwrap(), "\"PUT\"");
        assert_eq!(serde_json::to_string(&Op::Delete).unwrap(), "\"DELETE\"");
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Leader).unwrap(), "\"leader\"");
    }

    #[test]
    fn role_parses_from_cli_strings() {
        assert_eq!("leader".parse::<Role>().unwrap(), Role::Leader);
        assert_eq!("follower".parse::<Role>().unwrap(), Role::Follower);
        assert!("elected".parse::<Role>().is_err());
    }

    #[test]
    fn wal_entry_round_trips_through_json() {
        let entry = WalEntry {
            offset: 1,
            op: Op::Put,
            key: "k".into(),
            value: Some(serde_json::json!({"a": 1})),
            ts: 12345.6,
        };
        let line = serde_json::to_string(&entry).unwrap();
        let back: WalEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(entry, back);
    }
}
