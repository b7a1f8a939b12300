pub mod master;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::blob::{Blob, BlobType, PackedBlob};
use crate::cancel::CancelToken;
use crate::crypto::EXTENSION;
use crate::error::{Result, SiloError};
use crate::id::Id;
use crate::pack::{ENTRY_SIZE, HEADER_LEN_SIZE};

pub use master::MasterIndex;

/// Maps blob identifiers to their pack locations for a finite set of packs.
///
/// An index starts *pending* and mutable; `finalize` freezes it for
/// serialization, after which any `store` is a programming error.
#[derive(Debug, Default)]
pub struct Index {
    entries: HashMap<Id, Vec<IndexEntry>>,
    pack_ids: HashSet<Id>,
    supersedes: Vec<Id>,
    ids: Vec<Id>,
    final_: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    blob_type: BlobType,
    pack_id: Id,
    offset: u32,
    length: u32,
}

impl IndexEntry {
    fn packed(&self, id: Id) -> PackedBlob {
        PackedBlob {
            blob: Blob {
                blob_type: self.blob_type,
                id,
                offset: self.offset,
                length: self.length,
            },
            pack_id: self.pack_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire formats. Readers accept both; writers emit only the new form.
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct IndexJson {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    supersedes: Vec<Id>,
    packs: Vec<PackJson>,
}

#[derive(Serialize, Deserialize)]
struct PackJson {
    id: Id,
    blobs: Vec<BlobJson>,
}

#[derive(Serialize, Deserialize)]
struct BlobJson {
    id: Id,
    #[serde(rename = "type")]
    blob_type: BlobType,
    offset: u32,
    length: u32,
}

impl Index {
    pub fn new() -> Self {
        Index::default()
    }

    /// Insert one packed blob. Duplicates for the same id are kept; readers
    /// tolerate them and try candidates in turn.
    ///
    /// Panics when called on a finalized index.
    pub fn store(&mut self, pb: PackedBlob) {
        assert!(!self.final_, "store called on a finalized index");
        self.pack_ids.insert(pb.pack_id);
        self.entries.entry(pb.blob.id).or_default().push(IndexEntry {
            blob_type: pb.blob.blob_type,
            pack_id: pb.pack_id,
            offset: pb.blob.offset,
            length: pb.blob.length,
        });
    }

    /// Bulk insert of a whole pack's blobs.
    pub fn store_pack(&mut self, pack_id: Id, blobs: &[Blob]) {
        for blob in blobs {
            self.store(PackedBlob {
                blob: *blob,
                pack_id,
            });
        }
    }

    /// All locations recorded for `id` with the given type.
    pub fn lookup(&self, id: &Id, blob_type: BlobType) -> Vec<PackedBlob> {
        match self.entries.get(id) {
            Some(list) => list
                .iter()
                .filter(|e| e.blob_type == blob_type)
                .map(|e| e.packed(*id))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has(&self, id: &Id, blob_type: BlobType) -> bool {
        self.entries
            .get(id)
            .is_some_and(|list| list.iter().any(|e| e.blob_type == blob_type))
    }

    /// Stored (encrypted) length of a blob, if indexed.
    pub fn lookup_size(&self, id: &Id, blob_type: BlobType) -> Option<u32> {
        self.entries
            .get(id)?
            .iter()
            .find(|e| e.blob_type == blob_type)
            .map(|e| e.length)
    }

    pub fn count(&self, blob_type: BlobType) -> usize {
        self.entries
            .values()
            .flatten()
            .filter(|e| e.blob_type == blob_type)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit every packed blob. Order is undefined; cancellation aborts.
    pub fn each(
        &self,
        cancel: &CancelToken,
        f: &mut dyn FnMut(&PackedBlob) -> Result<()>,
    ) -> Result<()> {
        for (id, list) in &self.entries {
            cancel.check()?;
            for entry in list {
                f(&entry.packed(*id))?;
            }
        }
        Ok(())
    }

    /// Identifiers of all packs this index covers.
    pub fn packs(&self) -> &HashSet<Id> {
        &self.pack_ids
    }

    /// Blobs recorded for one pack, sorted by offset.
    pub fn pack_blobs(&self, pack_id: &Id) -> Vec<Blob> {
        let mut blobs: Vec<Blob> = self
            .entries
            .iter()
            .flat_map(|(id, list)| {
                list.iter()
                    .filter(|e| &e.pack_id == pack_id)
                    .map(|e| e.packed(*id).blob)
            })
            .collect();
        blobs.sort_by_key(|b| b.offset);
        blobs
    }

    /// Ids of older indexes replaced by this one.
    pub fn supersedes(&self) -> &[Id] {
        &self.supersedes
    }

    pub fn add_supersedes(&mut self, ids: &[Id]) {
        for id in ids {
            if !self.supersedes.contains(id) {
                self.supersedes.push(*id);
            }
        }
    }

    /// Freeze the index. A finalized index is immutable and serializable.
    pub fn finalize(&mut self) {
        self.final_ = true;
    }

    pub fn is_final(&self) -> bool {
        self.final_
    }

    /// Record the storage id once the index has been written.
    pub fn set_id(&mut self, id: Id) -> Result<()> {
        if !self.final_ {
            return Err(SiloError::Other(
                "set_id called on a pending index".into(),
            ));
        }
        if !self.ids.is_empty() {
            return Err(SiloError::Other("index id already set".into()));
        }
        self.ids.push(id);
        Ok(())
    }

    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    /// Serialize to the current wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut packs: Vec<Id> = self.pack_ids.iter().copied().collect();
        packs.sort();

        let packs = packs
            .into_iter()
            .map(|pack_id| PackJson {
                id: pack_id,
                blobs: self
                    .pack_blobs(&pack_id)
                    .into_iter()
                    .map(|b| BlobJson {
                        id: b.id,
                        blob_type: b.blob_type,
                        offset: b.offset,
                        length: b.length,
                    })
                    .collect(),
            })
            .collect();

        let mut supersedes = self.supersedes.clone();
        supersedes.sort();
        let wire = IndexJson { supersedes, packs };
        serde_json::to_vec(&wire).map_err(|e| SiloError::Decode("index", e))
    }

    /// Parse either wire format. The result is finalized and carries `id` as
    /// its storage id. The second value reports whether the legacy top-level
    /// array form was encountered.
    pub fn decode(data: &[u8], id: Id) -> Result<(Index, bool)> {
        let first = data
            .iter()
            .copied()
            .find(|b| !b.is_ascii_whitespace())
            .ok_or_else(|| SiloError::Other("empty index file".into()))?;

        let (wire, old_format) = if first == b'[' {
            let packs: Vec<PackJson> =
                serde_json::from_slice(data).map_err(|e| SiloError::Decode("index", e))?;
            (
                IndexJson {
                    supersedes: Vec::new(),
                    packs,
                },
                true,
            )
        } else {
            let wire: IndexJson =
                serde_json::from_slice(data).map_err(|e| SiloError::Decode("index", e))?;
            (wire, false)
        };

        let mut index = Index::new();
        for pack in wire.packs {
            for blob in pack.blobs {
                index.store(PackedBlob {
                    blob: Blob {
                        blob_type: blob.blob_type,
                        id: blob.id,
                        offset: blob.offset,
                        length: blob.length,
                    },
                    pack_id: pack.id,
                });
            }
        }
        index.supersedes = wire.supersedes;
        index.finalize();
        index.set_id(id)?;
        Ok((index, old_format))
    }
}

/// Size a pack must have according to its index entries: blob lengths plus
/// the header footprint for that many entries.
pub fn expected_pack_size(blobs: &[Blob]) -> u64 {
    let body: u64 = blobs.iter().map(|b| b.length as u64).sum();
    body + (blobs.len() * ENTRY_SIZE + EXTENSION + HEADER_LEN_SIZE) as u64
}
