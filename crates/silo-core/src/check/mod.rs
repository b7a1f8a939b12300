use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crossbeam_channel::bounded;
use thiserror::Error;

use crate::backend::FileKind;
use crate::blob::{BlobHandle, BlobType};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::id::Id;
use crate::pack;
use crate::progress::Counter;
use crate::repo::{for_all_indexes, Repository};
use crate::snapshot::stream::{stream_trees, TreeItem, DEFAULT_STREAM_WORKERS};
use crate::snapshot::tree::{NodeType, Tree};

/// Workers downloading and verifying packs in [`Checker::read_packs`].
const READ_PACK_PARALLELISM: usize = 5;

/// One integrity problem found by a checker pass.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("index {id} has old format")]
    OldIndexFormat { id: Id },

    #[error("pack {pack_id} contained in several indexes: {}", format_ids(.indexes))]
    DuplicatePacks { pack_id: Id, indexes: Vec<Id> },

    #[error("error loading index {id}: {err}")]
    IndexLoad { id: Id, err: String },

    #[error("pack {id} does not exist")]
    PackMissing { id: Id },

    #[error("pack {id} not referenced in any index")]
    PackOrphaned { id: Id },

    #[error("pack {id}: size does not match index: expected {expected}, got {actual}")]
    PackSizeMismatch { id: Id, expected: u64, actual: u64 },

    #[error("error loading snapshot {id}: {err}")]
    SnapshotLoad { id: Id, err: String },

    #[error("error loading tree {id}: {err}")]
    TreeLoad { id: Id, err: String },

    #[error("tree {tree_id}, node '{name}': {reason}")]
    NodeInvalid {
        tree_id: Id,
        name: String,
        reason: String,
    },

    #[error("tree {tree_id}, file '{name}': data blob {blob_id} not found in index")]
    BlobMissing {
        tree_id: Id,
        name: String,
        blob_id: Id,
    },

    #[error("pack {id} corrupt: {}", .problems.join("; "))]
    PackCorrupt { id: Id, problems: Vec<String> },
}

fn format_ids(ids: &[Id]) -> String {
    ids.iter()
        .map(Id::short)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Runs structural and data checks on a repository. Passes never abort on a
/// single bad object; they collect typed errors and keep going.
///
/// Run [`Checker::load_index`] first; it populates the repository's master
/// index that every later pass reads.
pub struct Checker<'r> {
    repo: &'r Repository,
    /// Expected size per pack, derived from index entries.
    packs: HashMap<Id, u64>,
    /// Blobs referenced by any snapshot tree (when tracking is on).
    blob_refs: Mutex<HashSet<BlobHandle>>,
    track_unused: bool,
}

impl<'r> Checker<'r> {
    pub fn new(repo: &'r Repository, track_unused: bool) -> Self {
        Checker {
            repo,
            packs: HashMap::new(),
            blob_refs: Mutex::new(HashSet::new()),
            track_unused,
        }
    }

    /// Parse every index file into the master index. Returns `(hints,
    /// errors)`: old-format and duplicate-pack findings are hints, malformed
    /// indexes are errors.
    pub fn load_index(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<(Vec<CheckError>, Vec<CheckError>)> {
        let mut hints = Vec::new();
        let mut errors = Vec::new();
        let mut pack_to_index: HashMap<Id, Vec<Id>> = HashMap::new();

        for_all_indexes(
            self.repo.backend(),
            self.repo.key(),
            cancel,
            &mut |id, decoded| {
                match decoded {
                    Ok((index, old_format)) => {
                        if old_format {
                            hints.push(CheckError::OldIndexFormat { id });
                        }
                        for pack_id in index.packs() {
                            pack_to_index.entry(*pack_id).or_default().push(id);
                        }
                        self.repo.index().insert(index)?;
                    }
                    Err(e) => errors.push(CheckError::IndexLoad {
                        id,
                        err: e.to_string(),
                    }),
                }
                Ok(())
            },
        )?;

        self.repo.index().merge_final_indexes()?;
        self.packs = self.repo.index().pack_size(cancel)?;

        for (pack_id, indexes) in pack_to_index {
            if indexes.len() > 1 {
                hints.push(CheckError::DuplicatePacks {
                    pack_id,
                    indexes,
                });
            }
        }

        Ok((hints, errors))
    }

    /// Cross-reference pack files against the index: packs that are missing,
    /// orphaned, or of unexpected size.
    pub fn packs(&self, cancel: &CancelToken) -> Result<Vec<CheckError>> {
        let mut errors = Vec::new();

        let mut repo_packs: HashMap<Id, u64> = HashMap::new();
        self.repo.list(FileKind::Pack, &mut |info| {
            if let Ok(id) = Id::parse(&info.name) {
                repo_packs.insert(id, info.size);
            }
            Ok(())
        })?;

        for (id, expected) in &self.packs {
            cancel.check()?;
            match repo_packs.remove(id) {
                None => errors.push(CheckError::PackMissing { id: *id }),
                Some(actual) if actual != *expected => {
                    errors.push(CheckError::PackSizeMismatch {
                        id: *id,
                        expected: *expected,
                        actual,
                    })
                }
                Some(_) => {}
            }
        }

        // whatever is left was never referenced by an index
        for id in repo_packs.into_keys() {
            errors.push(CheckError::PackOrphaned { id });
        }

        Ok(errors)
    }

    /// Walk every snapshot tree, checking node structure and that all
    /// referenced blobs are indexed.
    pub fn structure(
        &self,
        cancel: &CancelToken,
        progress: &Counter,
    ) -> Result<Vec<CheckError>> {
        let mut errors = Vec::new();

        let snapshot_ids = self.repo.snapshot_ids()?;
        progress.set_max(snapshot_ids.len() as u64);

        let mut roots = Vec::new();
        for id in snapshot_ids {
            cancel.check()?;
            match self.repo.load_snapshot(&id) {
                Ok(snapshot) => roots.push(snapshot.tree),
                Err(e) => errors.push(CheckError::SnapshotLoad {
                    id,
                    err: e.to_string(),
                }),
            }
            progress.add(1);
        }

        let mut visited = HashSet::new();
        stream_trees(
            self.repo,
            &roots,
            DEFAULT_STREAM_WORKERS,
            cancel,
            |id| {
                let fresh = visited.insert(*id);
                if fresh && self.track_unused {
                    self.blob_refs
                        .lock()
                        .unwrap()
                        .insert(BlobHandle::new(BlobType::Tree, *id));
                }
                !fresh
            },
            |item: TreeItem| {
                match item.tree {
                    Ok(tree) => self.check_tree(item.id, &tree, &mut errors),
                    Err(e) => errors.push(CheckError::TreeLoad {
                        id: item.id,
                        err: e.to_string(),
                    }),
                }
                Ok(())
            },
        )?;

        progress.done();
        Ok(errors)
    }

    fn check_tree(&self, tree_id: Id, tree: &Tree, errors: &mut Vec<CheckError>) {
        for node in &tree.nodes {
            if node.name.is_empty() {
                errors.push(CheckError::NodeInvalid {
                    tree_id,
                    name: String::new(),
                    reason: "node has empty name".into(),
                });
                continue;
            }

            match node.node_type {
                NodeType::File => {
                    for blob_id in &node.content {
                        if blob_id.is_null() {
                            errors.push(CheckError::NodeInvalid {
                                tree_id,
                                name: node.name.clone(),
                                reason: "file content lists the null blob".into(),
                            });
                            continue;
                        }
                        if !self.repo.index().has(blob_id, BlobType::Data) {
                            errors.push(CheckError::BlobMissing {
                                tree_id,
                                name: node.name.clone(),
                                blob_id: *blob_id,
                            });
                        } else if self.track_unused {
                            self.blob_refs
                                .lock()
                                .unwrap()
                                .insert(BlobHandle::new(BlobType::Data, *blob_id));
                        }
                    }
                }
                NodeType::Dir => match node.subtree {
                    None => errors.push(CheckError::NodeInvalid {
                        tree_id,
                        name: node.name.clone(),
                        reason: "directory has no subtree".into(),
                    }),
                    Some(subtree) if subtree.is_null() => {
                        errors.push(CheckError::NodeInvalid {
                            tree_id,
                            name: node.name.clone(),
                            reason: "directory references the null subtree".into(),
                        })
                    }
                    Some(_) => {}
                },
                _ => {}
            }
        }
    }

    /// Indexed blobs no snapshot references. Only meaningful after
    /// [`Checker::structure`] ran with unused-tracking enabled.
    pub fn unused_blobs(&self, cancel: &CancelToken) -> Result<Vec<BlobHandle>> {
        assert!(
            self.track_unused,
            "unused_blobs requires tracking to be enabled"
        );
        let refs = self.blob_refs.lock().unwrap();
        let mut unused = Vec::new();
        self.repo.index().each(cancel, &mut |pb| {
            let handle = BlobHandle::new(pb.blob.blob_type, pb.blob.id);
            if !refs.contains(&handle) {
                unused.push(handle);
            }
            Ok(())
        })?;
        unused.sort();
        unused.dedup();
        Ok(unused)
    }

    /// Download packs and verify everything about them: the pack id against
    /// the file bytes, the header, every blob's hash, and agreement with the
    /// index. Emits one aggregated error per bad pack.
    pub fn read_packs(
        &self,
        subset: Option<&HashSet<Id>>,
        cancel: &CancelToken,
        progress: &Counter,
    ) -> Result<Vec<CheckError>> {
        let targets: Vec<Id> = self
            .packs
            .keys()
            .filter(|id| subset.map(|s| s.contains(id)).unwrap_or(true))
            .copied()
            .collect();
        progress.set_max(targets.len() as u64);
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let workers = READ_PACK_PARALLELISM.min(targets.len());
        let (job_tx, job_rx) = bounded::<Id>(targets.len());
        let (res_tx, res_rx) = bounded::<Option<CheckError>>(workers);
        for id in &targets {
            job_tx.send(*id).expect("job channel open");
        }
        drop(job_tx);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                let cancel = cancel.clone();
                s.spawn(move || {
                    while let Ok(pack_id) = job_rx.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if res_tx.send(self.check_one_pack(&pack_id)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(res_tx);

            let mut errors = Vec::new();
            for result in res_rx.iter() {
                progress.add(1);
                if let Some(err) = result {
                    errors.push(err);
                }
            }
            progress.done();
            Ok(errors)
        })
    }

    fn check_one_pack(&self, pack_id: &Id) -> Option<CheckError> {
        let mut problems = Vec::new();

        let handle = crate::backend::Handle::new(FileKind::Pack, &pack_id.to_hex());
        let data = match self.repo.backend().load(&handle, 0, 0) {
            Ok(data) => data,
            Err(e) => {
                return Some(CheckError::PackCorrupt {
                    id: *pack_id,
                    problems: vec![format!("load failed: {e}")],
                })
            }
        };

        if &Id::hash(&data) != pack_id {
            problems.push("pack file hash does not match its name".to_string());
        }

        match pack::parse_pack_bytes(&data, self.repo.key()) {
            Err(e) => problems.push(format!("header parse failed: {e}")),
            Ok((blobs, _)) => {
                for blob in &blobs {
                    let start = blob.offset as usize;
                    let end = start + blob.length as usize;
                    if end > data.len() {
                        problems.push(format!(
                            "blob {} extends past end of pack",
                            blob.id.short()
                        ));
                        continue;
                    }
                    match self.repo.key().decrypt(&data[start..end]) {
                        Err(_) => problems.push(format!(
                            "blob {} failed decryption",
                            blob.id.short()
                        )),
                        Ok(plain) => {
                            if Id::hash(&plain) != blob.id {
                                problems.push(format!(
                                    "blob {} plaintext hash mismatch",
                                    blob.id.short()
                                ));
                            }
                        }
                    }

                    // the index must agree on where this blob lives
                    let indexed = self.repo.index().lookup(&blob.id, blob.blob_type);
                    let agrees = indexed.iter().any(|pb| {
                        pb.pack_id == *pack_id
                            && pb.blob.offset == blob.offset
                            && pb.blob.length == blob.length
                    });
                    if !agrees {
                        problems.push(format!(
                            "blob {} not indexed at this pack/offset/length",
                            blob.id.short()
                        ));
                    }
                }
            }
        }

        if problems.is_empty() {
            None
        } else {
            Some(CheckError::PackCorrupt {
                id: *pack_id,
                problems,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Handle};
    use crate::snapshot::tree::{Node, Tree};
    use crate::snapshot::Snapshot;
    use crate::testutil::test_repository;
    use std::sync::Arc;

    /// A small honest repository: one snapshot, two files, one subdirectory.
    fn populated_repo() -> (Repository, Id) {
        let repo = test_repository();

        let blob_a = repo.save_blob(BlobType::Data, b"contents of a").unwrap().0;
        let blob_b = repo.save_blob(BlobType::Data, b"contents of b").unwrap().0;

        let mut subtree = Tree::new();
        let mut file_b = Node::new("b.txt", NodeType::File);
        file_b.size = 13;
        file_b.content = vec![blob_b];
        subtree.insert(file_b);
        let subtree_id = repo
            .save_blob(BlobType::Tree, &subtree.to_json().unwrap())
            .unwrap()
            .0;

        let mut root = Tree::new();
        let mut file_a = Node::new("a.txt", NodeType::File);
        file_a.size = 13;
        file_a.content = vec![blob_a];
        root.insert(file_a);
        let mut dir = Node::new("sub", NodeType::Dir);
        dir.subtree = Some(subtree_id);
        root.insert(dir);
        let root_id = repo
            .save_blob(BlobType::Tree, &root.to_json().unwrap())
            .unwrap()
            .0;

        repo.flush().unwrap();
        let snapshot_id = repo
            .save_snapshot(&Snapshot::new(root_id, vec!["/data".into()]))
            .unwrap();
        (repo, snapshot_id)
    }

    fn full_check(repo: &Repository) -> Vec<CheckError> {
        let cancel = CancelToken::new();
        let mut checker = Checker::new(repo, true);
        let (_hints, mut errors) = checker.load_index(&cancel).unwrap();
        errors.extend(checker.packs(&cancel).unwrap());
        errors.extend(checker.structure(&cancel, &Counter::none()).unwrap());
        errors.extend(checker.read_packs(None, &cancel, &Counter::none()).unwrap());
        errors
    }

    #[test]
    fn honest_repository_is_clean() {
        let (repo, _) = populated_repo();
        // a fresh handle so the checker loads indexes itself
        let repo2 = Repository::open(
            Arc::clone(repo.backend()),
            crate::testutil::TEST_PASSWORD,
        )
        .unwrap();

        let errors = full_check(&repo2);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn honest_repository_has_no_unused_blobs() {
        let (repo, _) = populated_repo();
        let repo2 = Repository::open(
            Arc::clone(repo.backend()),
            crate::testutil::TEST_PASSWORD,
        )
        .unwrap();

        let cancel = CancelToken::new();
        let mut checker = Checker::new(&repo2, true);
        checker.load_index(&cancel).unwrap();
        checker.structure(&cancel, &Counter::none()).unwrap();
        assert!(checker.unused_blobs(&cancel).unwrap().is_empty());
    }

    #[test]
    fn corrupting_one_byte_is_detected() {
        let (repo, _) = populated_repo();
        let backend = Arc::clone(repo.backend());

        // flip one byte in the middle of the single pack
        let pack_id = *repo.index().packs().iter().next().unwrap();
        let handle = Handle::new(FileKind::Pack, &pack_id.to_hex());
        let mut bytes = backend.load(&handle, 0, 0).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        backend.save(&handle, &bytes).unwrap();

        let repo2 =
            Repository::open(backend, crate::testutil::TEST_PASSWORD).unwrap();
        let cancel = CancelToken::new();
        let mut checker = Checker::new(&repo2, false);
        checker.load_index(&cancel).unwrap();
        let errors = checker
            .read_packs(None, &cancel, &Counter::none())
            .unwrap();

        assert_eq!(errors.len(), 1);
        match &errors[0] {
            CheckError::PackCorrupt { id, problems } => {
                assert_eq!(*id, pack_id);
                assert!(!problems.is_empty());
            }
            other => panic!("expected PackCorrupt, got {other}"),
        }
    }

    #[test]
    fn missing_pack_is_reported() {
        let (repo, _) = populated_repo();
        let pack_id = *repo.index().packs().iter().next().unwrap();
        repo.backend()
            .remove(&Handle::new(FileKind::Pack, &pack_id.to_hex()))
            .unwrap();

        let repo2 = Repository::open(
            Arc::clone(repo.backend()),
            crate::testutil::TEST_PASSWORD,
        )
        .unwrap();
        let cancel = CancelToken::new();
        let mut checker = Checker::new(&repo2, false);
        checker.load_index(&cancel).unwrap();
        let errors = checker.packs(&cancel).unwrap();
        assert!(errors
            .iter()
            .any(|e| matches!(e, CheckError::PackMissing { id } if *id == pack_id)));
    }

    #[test]
    fn orphaned_pack_is_reported() {
        let (repo, _) = populated_repo();
        // drop a file into data/ that no index knows about
        let orphan = Id::hash(b"orphan pack");
        repo.backend()
            .save(&Handle::new(FileKind::Pack, &orphan.to_hex()), b"junk")
            .unwrap();

        let repo2 = Repository::open(
            Arc::clone(repo.backend()),
            crate::testutil::TEST_PASSWORD,
        )
        .unwrap();
        let cancel = CancelToken::new();
        let mut checker = Checker::new(&repo2, false);
        checker.load_index(&cancel).unwrap();
        let errors = checker.packs(&cancel).unwrap();
        assert!(errors
            .iter()
            .any(|e| matches!(e, CheckError::PackOrphaned { id } if *id == orphan)));
    }

    #[test]
    fn missing_blob_reference_is_reported() {
        let repo = test_repository();

        // a tree referencing a data blob that was never stored
        let mut tree = Tree::new();
        let mut file = Node::new("ghost.txt", NodeType::File);
        file.content = vec![Id::hash(b"never stored")];
        tree.insert(file);
        let root_id = repo
            .save_blob(BlobType::Tree, &tree.to_json().unwrap())
            .unwrap()
            .0;
        repo.flush().unwrap();
        repo.save_snapshot(&Snapshot::new(root_id, vec!["/".into()]))
            .unwrap();

        let repo2 = Repository::open(
            Arc::clone(repo.backend()),
            crate::testutil::TEST_PASSWORD,
        )
        .unwrap();
        let cancel = CancelToken::new();
        let mut checker = Checker::new(&repo2, false);
        checker.load_index(&cancel).unwrap();
        let errors = checker.structure(&cancel, &Counter::none()).unwrap();
        assert!(errors
            .iter()
            .any(|e| matches!(e, CheckError::BlobMissing { name, .. } if name == "ghost.txt")));
    }

    #[test]
    fn structural_node_problems_are_reported() {
        let repo = test_repository();

        let mut tree = Tree::new();
        // directory without a subtree
        tree.insert(Node::new("bad-dir", NodeType::Dir));
        // node without a name
        tree.insert(Node::new("", NodeType::File));
        let root_id = repo
            .save_blob(BlobType::Tree, &tree.to_json().unwrap())
            .unwrap()
            .0;
        repo.flush().unwrap();
        repo.save_snapshot(&Snapshot::new(root_id, vec!["/".into()]))
            .unwrap();

        let repo2 = Repository::open(
            Arc::clone(repo.backend()),
            crate::testutil::TEST_PASSWORD,
        )
        .unwrap();
        let cancel = CancelToken::new();
        let mut checker = Checker::new(&repo2, false);
        checker.load_index(&cancel).unwrap();
        let errors = checker.structure(&cancel, &Counter::none()).unwrap();

        assert!(errors.iter().any(
            |e| matches!(e, CheckError::NodeInvalid { name, reason, .. } if name == "bad-dir" && reason.contains("subtree"))
        ));
        assert!(errors
            .iter()
            .any(|e| matches!(e, CheckError::NodeInvalid { reason, .. } if reason.contains("empty name"))));
    }

    #[test]
    fn unused_blob_is_surfaced() {
        let (repo, _) = populated_repo();
        // an extra blob nothing references
        repo.save_blob(BlobType::Data, b"dangling").unwrap();
        repo.flush().unwrap();

        let repo2 = Repository::open(
            Arc::clone(repo.backend()),
            crate::testutil::TEST_PASSWORD,
        )
        .unwrap();
        let cancel = CancelToken::new();
        let mut checker = Checker::new(&repo2, true);
        checker.load_index(&cancel).unwrap();
        checker.structure(&cancel, &Counter::none()).unwrap();

        let unused = checker.unused_blobs(&cancel).unwrap();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].id, Id::hash(b"dangling"));
        assert_eq!(unused[0].blob_type, BlobType::Data);
    }
}
