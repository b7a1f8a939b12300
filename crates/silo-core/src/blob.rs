use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// What a blob stored in a pack contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

impl BlobType {
    /// The on-disk header tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            BlobType::Data => 0,
            BlobType::Tree => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BlobType::Data),
            1 => Some(BlobType::Tree),
            _ => None,
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobType::Data => write!(f, "data"),
            BlobType::Tree => write!(f, "tree"),
        }
    }
}

/// One blob inside a pack file. `length` is the stored (encrypted) length;
/// the plaintext is `length - crypto::EXTENSION` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob {
    pub blob_type: BlobType,
    pub id: Id,
    pub offset: u32,
    pub length: u32,
}

/// A blob together with the pack that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBlob {
    pub blob: Blob,
    pub pack_id: Id,
}

/// Identifies a blob of a given type, independent of where it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHandle {
    pub id: Id,
    pub blob_type: BlobType,
}

impl BlobHandle {
    pub fn new(blob_type: BlobType, id: Id) -> Self {
        BlobHandle { id, blob_type }
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/{}>", self.blob_type, self.id.short())
    }
}

impl BlobType {
    /// Order types with `Data` before `Tree`, matching the tag bytes.
    pub fn all() -> [BlobType; 2] {
        [BlobType::Data, BlobType::Tree]
    }
}

impl PartialOrd for BlobType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlobType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tag().cmp(&other.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for t in BlobType::all() {
            assert_eq!(BlobType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(BlobType::from_tag(2), None);
        assert_eq!(BlobType::from_tag(0xFF), None);
    }

    #[test]
    fn wire_names() {
        assert_eq!(serde_json::to_string(&BlobType::Data).unwrap(), "\"data\"");
        assert_eq!(serde_json::to_string(&BlobType::Tree).unwrap(), "\"tree\"");
        let t: BlobType = serde_json::from_str("\"tree\"").unwrap();
        assert_eq!(t, BlobType::Tree);
        assert!(serde_json::from_str::<BlobType>("\"invalid\"").is_err());
    }
}
