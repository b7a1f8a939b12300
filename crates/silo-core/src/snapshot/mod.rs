pub mod stream;
pub mod tree;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SiloError};
use crate::id::Id;

/// The root object of one captured filesystem state, stored individually
/// encrypted under its own content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Id>,
    pub tree: Id,
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Id of the snapshot this one was copied or rewritten from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Id>,
}

impl Snapshot {
    /// A snapshot of `tree` rooted at `paths`, stamped with the current time
    /// and origin.
    pub fn new(tree: Id, paths: Vec<String>) -> Self {
        Snapshot {
            time: Utc::now(),
            parent: None,
            tree,
            paths,
            hostname: crate::platform::hostname(),
            username: crate::platform::username(),
            uid: crate::platform::uid(),
            gid: crate::platform::gid(),
            excludes: None,
            tags: None,
            original: None,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SiloError::Decode("snapshot", e))
    }

    pub fn from_json(data: &[u8]) -> Result<Snapshot> {
        serde_json::from_slice(data).map_err(|e| SiloError::Decode("snapshot", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let mut snapshot = Snapshot::new(Id::hash(b"tree"), vec!["/home".into()]);
        snapshot.tags = Some(vec!["nightly".into()]);
        snapshot.parent = Some(Id::hash(b"parent"));

        let json = snapshot.to_json().unwrap();
        let back = Snapshot::from_json(&json).unwrap();
        assert_eq!(back.tree, snapshot.tree);
        assert_eq!(back.parent, snapshot.parent);
        assert_eq!(back.paths, snapshot.paths);
        assert_eq!(back.tags, snapshot.tags);
        assert_eq!(back.time, snapshot.time);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let snapshot = Snapshot::new(Id::hash(b"t"), vec![]);
        let value: serde_json::Value =
            serde_json::from_slice(&snapshot.to_json().unwrap()).unwrap();
        assert!(value.get("parent").is_none());
        assert!(value.get("tags").is_none());
        assert!(value.get("original").is_none());
        assert!(value.get("tree").is_some());
        assert!(value.get("time").is_some());
    }

    #[test]
    fn accepts_minimal_json() {
        let raw = br#"{"time":"2023-01-02T03:04:05.000000001Z","tree":"ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb","paths":["/data"]}"#;
        let snapshot = Snapshot::from_json(raw).unwrap();
        assert_eq!(snapshot.paths, vec!["/data"]);
        assert!(snapshot.hostname.is_empty());
        assert_eq!(snapshot.time.timestamp_subsec_nanos(), 1);
    }
}
