pub mod config;
pub mod lock;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_channel::bounded;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{Backend, FileKind, Handle};
use crate::blob::{BlobType, PackedBlob};
use crate::cache::{BlobLru, Cache, CachedBackend};
use crate::cancel::CancelToken;
use crate::crypto::keyfile::{self, KeyFile, MAX_KEY_ATTEMPTS};
use crate::crypto::{Key, EXTENSION};
use crate::error::{Result, SiloError};
use crate::id::Id;
use crate::index::{Index, MasterIndex};
use crate::pack::Packer;
use crate::snapshot::tree::Tree;
use crate::snapshot::Snapshot;

pub use config::RepoConfig;
pub use lock::{Lock, LockGuard};

/// Workers decrypting and parsing index files during open.
const LOAD_INDEX_PARALLELISM: usize = 5;

/// Byte budget of the in-memory cache for decrypted blobs.
const BLOB_CACHE_CAPACITY: usize = 32 * 1024 * 1024;

/// Packs are flushed once their projected size crosses this threshold.
const MIN_PACK_SIZE: u64 = 4 * 1024 * 1024;

struct PackerPool {
    data: Packer,
    tree: Packer,
}

impl PackerPool {
    fn get_mut(&mut self, blob_type: BlobType) -> &mut Packer {
        match blob_type {
            BlobType::Data => &mut self.data,
            BlobType::Tree => &mut self.tree,
        }
    }
}

/// A handle to an opened repository: backend, master key, loaded indexes,
/// and the pack writers for new blobs.
pub struct Repository {
    backend: Arc<dyn Backend>,
    key: Key,
    key_id: Id,
    config: RepoConfig,
    index: MasterIndex,
    blob_cache: Mutex<BlobLru>,
    packers: Mutex<PackerPool>,
    min_pack_size: u64,
}

impl Repository {
    /// Initialize a fresh repository: generate a master key, wrap it under
    /// `password`, and write the encrypted config.
    pub fn init(backend: Arc<dyn Backend>, password: &str) -> Result<Repository> {
        Self::init_with_kdf(
            backend,
            password,
            keyfile::DEFAULT_N,
            keyfile::DEFAULT_R,
            keyfile::DEFAULT_P,
        )
    }

    /// `init` with explicit scrypt parameters (tests use cheap ones).
    pub fn init_with_kdf(
        backend: Arc<dyn Backend>,
        password: &str,
        n: u32,
        r: u32,
        p: u32,
    ) -> Result<Repository> {
        if backend.test(&Handle::config())? {
            return Err(SiloError::AlreadyInitialized);
        }

        let key = Key::generate();
        let keyfile = KeyFile::create(&key, password, n, r, p)?;
        let keyfile_json = keyfile.to_json()?;
        let key_id = Id::hash(&keyfile_json);
        backend.save(&Handle::new(FileKind::Key, &key_id.to_hex()), &keyfile_json)?;

        let config = RepoConfig::generate();
        let config_plain =
            serde_json::to_vec(&config).map_err(|e| SiloError::Decode("config", e))?;
        backend.save(&Handle::config(), &key.encrypt(&config_plain))?;

        tracing::debug!("initialized repository {}", config.id);
        Ok(Self::assemble(backend, key, key_id, config))
    }

    /// Open an existing repository, trying each key file in turn (bounded at
    /// [`MAX_KEY_ATTEMPTS`]) until `password` unlocks the master key.
    pub fn open(backend: Arc<dyn Backend>, password: &str) -> Result<Repository> {
        let (key_id, key) = keyfile::search_key(&backend, password, MAX_KEY_ATTEMPTS)?;

        let raw = backend.load(&Handle::config(), 0, 0)?;
        let plain = key.decrypt(&raw)?;
        let config: RepoConfig =
            serde_json::from_slice(&plain).map_err(|e| SiloError::Decode("config", e))?;
        config.validate()?;

        tracing::debug!("opened repository {} with key {}", config.id, key_id.short());
        Ok(Self::assemble(backend, key, key_id, config))
    }

    fn assemble(backend: Arc<dyn Backend>, key: Key, key_id: Id, config: RepoConfig) -> Repository {
        Repository {
            backend,
            key,
            key_id,
            config,
            index: MasterIndex::new(),
            blob_cache: Mutex::new(BlobLru::new(BLOB_CACHE_CAPACITY)),
            packers: Mutex::new(PackerPool {
                data: Packer::new(),
                tree: Packer::new(),
            }),
            min_pack_size: MIN_PACK_SIZE,
        }
    }

    /// Interpose the on-disk cache between the repository and its backend.
    /// Registers the repository in the known-repos file as a side effect.
    pub fn attach_cache(&mut self, base: Option<PathBuf>) -> Result<()> {
        let repo_id = self.config.repo_id()?;
        let cache = Cache::new(&repo_id, base)?;
        tracing::debug!("using cache at {}", cache.location().display());
        self.backend = Arc::new(CachedBackend::new(self.backend.clone(), cache));
        Ok(())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_id(&self) -> &Id {
        &self.key_id
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn index(&self) -> &MasterIndex {
        &self.index
    }

    /// Override the pack flush threshold (tests use small packs).
    pub fn set_min_pack_size(&mut self, size: u64) {
        self.min_pack_size = size;
    }

    // -----------------------------------------------------------------------
    // Index loading
    // -----------------------------------------------------------------------

    /// Load every index file into the master index and merge. Old-format
    /// indexes are tolerated and reported as hints in the returned list.
    pub fn load_index(&self, cancel: &CancelToken) -> Result<Vec<Id>> {
        let mut old_format = Vec::new();
        for_all_indexes(&self.backend, &self.key, cancel, &mut |id, decoded| {
            let (index, old) = decoded?;
            if old {
                tracing::debug!("index {} has old format", id.short());
                old_format.push(id);
            }
            self.index.insert(index)
        })?;

        self.index.merge_final_indexes()?;
        Ok(old_format)
    }

    // -----------------------------------------------------------------------
    // Blob I/O
    // -----------------------------------------------------------------------

    /// Load and decrypt one blob, verifying its plaintext hash. Consults the
    /// in-memory cache first; on a corrupt or unreadable copy, every other
    /// indexed location is tried before giving up.
    pub fn load_blob(&self, blob_type: BlobType, id: &Id) -> Result<Vec<u8>> {
        if let Some(cached) = self.blob_cache.lock().unwrap().get(id) {
            return Ok(cached);
        }

        let candidates = self.index.lookup(id, blob_type);
        if candidates.is_empty() {
            return Err(SiloError::BlobNotFound(*id));
        }

        let mut last_err = None;
        for candidate in &candidates {
            match self.load_blob_from(candidate) {
                Ok(plain) => {
                    self.blob_cache.lock().unwrap().add(*id, plain.clone());
                    return Ok(plain);
                }
                Err(e) => {
                    tracing::warn!(
                        "blob {} in pack {} unusable: {e}",
                        id.short(),
                        candidate.pack_id.short()
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(SiloError::BlobNotFound(*id)))
    }

    fn load_blob_from(&self, pb: &PackedBlob) -> Result<Vec<u8>> {
        let handle = Handle::new(FileKind::Pack, &pb.pack_id.to_hex());
        let raw = self
            .backend
            .load(&handle, pb.blob.length, pb.blob.offset as u64)?;
        let plain = self.key.decrypt(&raw)?;
        if Id::hash(&plain) != pb.blob.id {
            return Err(SiloError::BlobCorrupt {
                id: pb.blob.id,
                reason: "plaintext hash mismatch".into(),
            });
        }
        Ok(plain)
    }

    pub fn load_tree(&self, id: &Id) -> Result<Tree> {
        let plain = self.load_blob(BlobType::Tree, id)?;
        Tree::from_json(&plain)
    }

    /// Plaintext size of an indexed blob.
    pub fn lookup_blob_size(&self, id: &Id, blob_type: BlobType) -> Option<u32> {
        self.index
            .lookup_size(id, blob_type)
            .map(|stored| stored.saturating_sub(EXTENSION as u32))
    }

    /// Add a blob to the pending pack of its type. Returns the blob id and
    /// whether it was new; known blobs are deduplicated away.
    pub fn save_blob(&self, blob_type: BlobType, data: &[u8]) -> Result<(Id, bool)> {
        let id = Id::hash(data);
        if self.index.has(&id, blob_type) {
            return Ok((id, false));
        }

        let mut packers = self.packers.lock().unwrap();
        let packer = packers.get_mut(blob_type);
        if packer.contains(&id) {
            return Ok((id, false));
        }
        packer.add(&self.key, blob_type, id, data)?;

        if packer.size() >= self.min_pack_size {
            let full = std::mem::take(packer);
            drop(packers);
            self.flush_packer(full)?;
        }
        Ok((id, true))
    }

    fn flush_packer(&self, packer: Packer) -> Result<()> {
        if packer.is_empty() {
            return Ok(());
        }
        let finished = packer.finalize(&self.key)?;
        let handle = Handle::new(FileKind::Pack, &finished.id.to_hex());
        self.backend.save(&handle, &finished.bytes)?;
        tracing::debug!(
            "wrote pack {} with {} blobs",
            finished.id.short(),
            finished.blobs.len()
        );
        for blob in finished.blobs {
            self.index.store(PackedBlob {
                blob,
                pack_id: finished.id,
            });
        }
        Ok(())
    }

    /// Write out all pending packs, then the pending index.
    pub fn flush(&self) -> Result<Option<Id>> {
        let (data, tree) = {
            let mut packers = self.packers.lock().unwrap();
            (
                std::mem::take(&mut packers.data),
                std::mem::take(&mut packers.tree),
            )
        };
        self.flush_packer(data)?;
        self.flush_packer(tree)?;
        self.save_index()
    }

    /// Serialize the pending index, if it holds anything. The file is named
    /// by the hash of its plaintext and the finalized index rejoins the
    /// master index.
    pub fn save_index(&self) -> Result<Option<Id>> {
        if self.index.pending_is_empty() {
            return Ok(None);
        }
        let mut pending = self.index.take_pending();
        pending.finalize();

        let plain = pending.encode()?;
        let id = Id::hash(&plain);
        self.backend.save(
            &Handle::new(FileKind::Index, &id.to_hex()),
            &self.key.encrypt(&plain),
        )?;
        pending.set_id(id)?;
        self.index.insert(pending)?;
        tracing::debug!("wrote index {}", id.short());
        Ok(Some(id))
    }

    // -----------------------------------------------------------------------
    // Individually encrypted JSON files (snapshots, locks)
    // -----------------------------------------------------------------------

    /// Encrypt and store a JSON object under the hash of its plaintext.
    pub fn save_json_unpacked<T: Serialize>(&self, kind: FileKind, value: &T) -> Result<Id> {
        let plain = serde_json::to_vec(value).map_err(|e| SiloError::Decode("object", e))?;
        let id = Id::hash(&plain);
        self.backend
            .save(&Handle::new(kind, &id.to_hex()), &self.key.encrypt(&plain))?;
        Ok(id)
    }

    pub fn load_json_unpacked<T: DeserializeOwned>(&self, kind: FileKind, name: &str) -> Result<T> {
        let raw = self.backend.load(&Handle::new(kind, name), 0, 0)?;
        let plain = self.key.decrypt(&raw)?;
        serde_json::from_slice(&plain).map_err(|e| SiloError::Decode("object", e))
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<Id> {
        self.save_json_unpacked(FileKind::Snapshot, snapshot)
    }

    pub fn load_snapshot(&self, id: &Id) -> Result<Snapshot> {
        self.load_json_unpacked(FileKind::Snapshot, &id.to_hex())
    }

    /// Ids of every snapshot in the repository.
    pub fn snapshot_ids(&self) -> Result<Vec<Id>> {
        let mut ids = Vec::new();
        self.backend.list(FileKind::Snapshot, &mut |info| {
            match Id::parse(&info.name) {
                Ok(id) => ids.push(id),
                Err(_) => tracing::warn!("ignoring oddly named snapshot file '{}'", info.name),
            }
            Ok(())
        })?;
        ids.sort();
        Ok(ids)
    }

    /// Pass a listing through to the backend.
    pub fn list(
        &self,
        kind: FileKind,
        f: &mut dyn FnMut(&crate::backend::FileInfo) -> Result<()>,
    ) -> Result<()> {
        self.backend.list(kind, f)
    }
}

/// Decode every index file with a small worker pool, delivering results to
/// `f` on the calling thread in completion order.
pub fn for_all_indexes(
    backend: &Arc<dyn Backend>,
    key: &Key,
    cancel: &CancelToken,
    f: &mut dyn FnMut(Id, Result<(Index, bool)>) -> Result<()>,
) -> Result<()> {
    let mut names = Vec::new();
    backend.list(FileKind::Index, &mut |info| {
        names.push(info.name.clone());
        Ok(())
    })?;
    names.sort();

    if names.is_empty() {
        return Ok(());
    }

    let cancel = cancel.child();
    let workers = LOAD_INDEX_PARALLELISM.min(names.len());
    let (job_tx, job_rx) = bounded::<String>(names.len());
    let (res_tx, res_rx) = bounded::<(Id, Result<(Index, bool)>)>(workers);
    for name in &names {
        job_tx.send(name.clone()).expect("job channel open");
    }
    drop(job_tx);

    std::thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let cancel = cancel.clone();
            s.spawn(move || {
                while let Ok(name) = job_rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let id = match Id::parse(&name) {
                        Ok(id) => id,
                        Err(e) => {
                            if res_tx.send((Id::null(), Err(e))).is_err() {
                                break;
                            }
                            continue;
                        }
                    };
                    let decoded = (|| {
                        let raw = backend.load(&Handle::new(FileKind::Index, &name), 0, 0)?;
                        let plain = key.decrypt(&raw)?;
                        Index::decode(&plain, id)
                    })();
                    if res_tx.send((id, decoded)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(res_tx);

        let mut run = Ok(());
        for (id, decoded) in res_rx.iter() {
            if run.is_ok() {
                run = f(id, decoded);
                if run.is_err() {
                    cancel.cancel();
                }
            }
        }
        run
    })
}
