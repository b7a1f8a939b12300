use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::blob::{BlobType, PackedBlob};
use crate::cancel::CancelToken;
use crate::error::{Result, SiloError};
use crate::id::Id;

use super::{expected_pack_size, Index};

/// The union of all loaded indexes plus one pending index receiving new
/// blobs. Lookups run under a read lock; only stores into the pending
/// segment take the write lock.
#[derive(Default)]
pub struct MasterIndex {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    finalized: Vec<Index>,
    pending: Index,
}

impl MasterIndex {
    pub fn new() -> Self {
        MasterIndex::default()
    }

    /// Add a finalized index (typically freshly decoded from storage).
    pub fn insert(&self, index: Index) -> Result<()> {
        if !index.is_final() {
            return Err(SiloError::Other(
                "only finalized indexes can be inserted".into(),
            ));
        }
        self.inner.write().unwrap().finalized.push(index);
        Ok(())
    }

    /// Record a new blob in the pending index.
    pub fn store(&self, pb: PackedBlob) {
        self.inner.write().unwrap().pending.store(pb);
    }

    pub fn lookup(&self, id: &Id, blob_type: BlobType) -> Vec<PackedBlob> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        for index in inner.all() {
            out.extend(index.lookup(id, blob_type));
        }
        out
    }

    pub fn has(&self, id: &Id, blob_type: BlobType) -> bool {
        let inner = self.inner.read().unwrap();
        let found = inner.all().any(|index| index.has(id, blob_type));
        found
    }

    /// Stored (encrypted) length of a blob, if any index knows it.
    pub fn lookup_size(&self, id: &Id, blob_type: BlobType) -> Option<u32> {
        let inner = self.inner.read().unwrap();
        let size = inner.all().find_map(|index| index.lookup_size(id, blob_type));
        size
    }

    pub fn count(&self, blob_type: BlobType) -> usize {
        let inner = self.inner.read().unwrap();
        inner.all().map(|index| index.count(blob_type)).sum()
    }

    /// Identifiers of every pack covered by any member index.
    pub fn packs(&self) -> HashSet<Id> {
        let inner = self.inner.read().unwrap();
        let mut out = HashSet::new();
        for index in inner.all() {
            out.extend(index.packs().iter().copied());
        }
        out
    }

    /// Expected on-disk size per pack, derived from index entries.
    pub fn pack_size(&self, cancel: &CancelToken) -> Result<HashMap<Id, u64>> {
        let inner = self.inner.read().unwrap();
        let mut out = HashMap::new();
        for index in inner.all() {
            cancel.check()?;
            for pack_id in index.packs() {
                out.insert(*pack_id, expected_pack_size(&index.pack_blobs(pack_id)));
            }
        }
        Ok(out)
    }

    /// Visit every packed blob across all member indexes.
    pub fn each(
        &self,
        cancel: &CancelToken,
        f: &mut dyn FnMut(&PackedBlob) -> Result<()>,
    ) -> Result<()> {
        let inner = self.inner.read().unwrap();
        for index in inner.all() {
            index.each(cancel, f)?;
        }
        Ok(())
    }

    /// Ids of all finalized member indexes.
    pub fn finalized_ids(&self) -> Vec<Id> {
        let inner = self.inner.read().unwrap();
        inner
            .finalized
            .iter()
            .flat_map(|i| i.ids().iter().copied())
            .collect()
    }

    /// Consolidate all finalized indexes into one, dropping those superseded
    /// by another member. A pack survives iff a non-superseded index lists
    /// it. Idempotent; call once all indexes are loaded.
    pub fn merge_final_indexes(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        let superseded: HashSet<Id> = inner
            .finalized
            .iter()
            .flat_map(|i| i.supersedes().iter().copied())
            .collect();

        let mut merged = Index::new();
        let mut kept_ids = Vec::new();
        let mut supersedes = Vec::new();
        for index in inner.finalized.drain(..) {
            supersedes.extend(index.supersedes().iter().copied());
            if index.ids().iter().any(|id| superseded.contains(id)) {
                tracing::debug!(
                    "dropping superseded index {:?}",
                    index.ids().first().map(Id::short)
                );
                continue;
            }
            kept_ids.extend(index.ids().iter().copied());
            let cancel = CancelToken::new();
            index.each(&cancel, &mut |pb| {
                merged.store(*pb);
                Ok(())
            })?;
        }

        merged.add_supersedes(&supersedes);
        merged.finalize();
        // the merged index inherits the ids of every index it absorbed
        for id in kept_ids {
            merged.force_add_id(id);
        }
        inner.finalized = vec![merged];
        Ok(())
    }

    /// Swap out the pending index for serialization, leaving a fresh one.
    pub(crate) fn take_pending(&self) -> Index {
        let mut inner = self.inner.write().unwrap();
        std::mem::take(&mut inner.pending)
    }

    pub(crate) fn pending_is_empty(&self) -> bool {
        self.inner.read().unwrap().pending.is_empty()
    }
}

impl Inner {
    fn all(&self) -> impl Iterator<Item = &Index> {
        self.finalized.iter().chain(std::iter::once(&self.pending))
    }
}

impl Index {
    /// Attach an id to a merged index, bypassing the single-id rule that
    /// applies to indexes decoded from storage.
    fn force_add_id(&mut self, id: Id) {
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Blob;

    fn packed(id: Id, pack: Id, offset: u32, length: u32) -> PackedBlob {
        PackedBlob {
            blob: Blob {
                blob_type: BlobType::Data,
                id,
                offset,
                length,
            },
            pack_id: pack,
        }
    }

    fn finalized_index(id: Id, blobs: &[PackedBlob], supersedes: &[Id]) -> Index {
        let mut index = Index::new();
        for pb in blobs {
            index.store(*pb);
        }
        index.add_supersedes(supersedes);
        index.finalize();
        index.set_id(id).unwrap();
        index
    }

    #[test]
    fn union_lookup_across_members() {
        let master = MasterIndex::new();
        let a = packed(Id::random(), Id::random(), 0, 50);
        let b = packed(Id::random(), Id::random(), 0, 60);

        master
            .insert(finalized_index(Id::random(), &[a], &[]))
            .unwrap();
        master.store(b);

        assert_eq!(master.lookup(&a.blob.id, BlobType::Data), vec![a]);
        assert_eq!(master.lookup(&b.blob.id, BlobType::Data), vec![b]);
        assert!(master.has(&a.blob.id, BlobType::Data));
        assert!(master.has(&b.blob.id, BlobType::Data));
        assert_eq!(master.count(BlobType::Data), 2);
    }

    #[test]
    fn pending_index_cannot_be_inserted() {
        let master = MasterIndex::new();
        assert!(master.insert(Index::new()).is_err());
    }

    #[test]
    fn merge_drops_superseded_packs() {
        let master = MasterIndex::new();

        let old_id = Id::random();
        let old_blob = packed(Id::random(), Id::random(), 0, 50);
        master
            .insert(finalized_index(old_id, &[old_blob], &[]))
            .unwrap();

        // replacement index supersedes the old one and indexes a new pack
        let new_blob = packed(Id::random(), Id::random(), 0, 70);
        master
            .insert(finalized_index(Id::random(), &[new_blob], &[old_id]))
            .unwrap();

        master.merge_final_indexes().unwrap();

        assert!(!master.has(&old_blob.blob.id, BlobType::Data));
        assert!(master.has(&new_blob.blob.id, BlobType::Data));
        assert!(!master.packs().contains(&old_blob.pack_id));
        assert!(master.packs().contains(&new_blob.pack_id));
    }

    #[test]
    fn merge_is_idempotent() {
        let master = MasterIndex::new();
        let blobs: Vec<PackedBlob> = (0..5)
            .map(|i| packed(Id::random(), Id::random(), 0, 40 + i))
            .collect();
        for pb in &blobs {
            master
                .insert(finalized_index(Id::random(), &[*pb], &[]))
                .unwrap();
        }

        master.merge_final_indexes().unwrap();
        let packs_once = master.packs();
        master.merge_final_indexes().unwrap();
        assert_eq!(master.packs(), packs_once);
        for pb in &blobs {
            assert_eq!(master.lookup(&pb.blob.id, BlobType::Data).len(), 1);
        }
    }

    #[test]
    fn concurrent_lookup_during_store() {
        use std::sync::Arc;

        let master = Arc::new(MasterIndex::new());
        let stable = packed(Id::random(), Id::random(), 0, 42);
        master
            .insert(finalized_index(Id::random(), &[stable], &[]))
            .unwrap();

        std::thread::scope(|s| {
            let writer = master.clone();
            s.spawn(move || {
                for i in 0..500u32 {
                    writer.store(packed(Id::random(), Id::random(), 0, i + 33));
                }
            });
            for _ in 0..4 {
                let reader = master.clone();
                let id = stable.blob.id;
                s.spawn(move || {
                    for _ in 0..500 {
                        assert_eq!(reader.lookup(&id, BlobType::Data).len(), 1);
                    }
                });
            }
        });

        assert_eq!(master.count(BlobType::Data), 501);
    }

    #[test]
    fn pack_size_includes_header_footprint() {
        let master = MasterIndex::new();
        let pack = Id::random();
        let a = packed(Id::random(), pack, 0, 40);
        let b = packed(Id::random(), pack, 40, 50);
        master
            .insert(finalized_index(Id::random(), &[a, b], &[]))
            .unwrap();

        let sizes = master.pack_size(&CancelToken::new()).unwrap();
        assert_eq!(sizes[&pack], 90 + 2 * 37 + 32 + 4);
    }
}
