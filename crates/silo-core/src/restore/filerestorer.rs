use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;

use crossbeam_channel::bounded;

use crate::backend::{FileKind, Handle};
use crate::blob::BlobType;
use crate::cancel::CancelToken;
use crate::error::{Result, SiloError};
use crate::id::Id;
use crate::platform::fs as pfs;
use crate::repo::Repository;

/// Workers fetching and writing pack ranges during restore.
const PACK_WORKERS: usize = 8;

/// Where one blob's plaintext lands.
struct WriteTarget {
    file_index: usize,
    file_offset: u64,
}

/// One blob to extract from a pack, with every destination that needs it.
struct PlannedBlob {
    id: Id,
    offset: u32,
    length: u32,
    targets: Vec<WriteTarget>,
}

/// All blobs needed from a single pack, serviced by one ranged read.
struct PackPlan {
    pack_id: Id,
    blobs: Vec<PlannedBlob>,
}

struct PlannedFile {
    target: PathBuf,
    content: Vec<Id>,
    size: u64,
}

/// Materializes regular-file contents for a restore. Files are registered
/// during the first tree pass; `restore_files` then groups the needed blobs
/// by pack and fetches each pack exactly once with a single ranged read
/// spanning the lowest to the highest required offset.
pub struct FileRestorer<'r> {
    repo: &'r Repository,
    files: Vec<PlannedFile>,
}

impl<'r> FileRestorer<'r> {
    pub fn new(repo: &'r Repository) -> Self {
        FileRestorer {
            repo,
            files: Vec::new(),
        }
    }

    /// Register one file to restore.
    pub fn add_file(&mut self, target: PathBuf, content: Vec<Id>, size: u64) {
        self.files.push(PlannedFile {
            target,
            content,
            size,
        });
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Fetch all required packs and write every registered file.
    pub fn restore_files(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        let cancel = cancel.child();

        // Plan: per pack, the blobs needed and their destinations.
        let mut plans: HashMap<Id, HashMap<Id, PlannedBlob>> = HashMap::new();
        for (file_index, file) in self.files.iter().enumerate() {
            let mut file_offset = 0u64;
            for blob_id in &file.content {
                let candidates = self.repo.index().lookup(blob_id, BlobType::Data);
                let packed = candidates
                    .first()
                    .ok_or(SiloError::BlobNotFound(*blob_id))?;

                let per_pack = plans.entry(packed.pack_id).or_default();
                let planned = per_pack.entry(*blob_id).or_insert_with(|| PlannedBlob {
                    id: *blob_id,
                    offset: packed.blob.offset,
                    length: packed.blob.length,
                    targets: Vec::new(),
                });
                planned.targets.push(WriteTarget {
                    file_index,
                    file_offset,
                });

                let plain_len = self
                    .repo
                    .lookup_blob_size(blob_id, BlobType::Data)
                    .ok_or(SiloError::BlobNotFound(*blob_id))?;
                file_offset += plain_len as u64;
            }

            if file_offset != file.size {
                tracing::warn!(
                    "file {}: content blobs sum to {file_offset} bytes, node says {}",
                    file.target.display(),
                    file.size
                );
            }
        }

        // Create all destination files up front and reserve their space.
        let mut handles = Vec::with_capacity(self.files.len());
        for file in &self.files {
            if let Some(parent) = file.target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&file.target)?;
            pfs::preallocate(&handle, file.size)?;
            handles.push(handle);
        }

        let plans: Vec<PackPlan> = plans
            .into_iter()
            .map(|(pack_id, blobs)| PackPlan {
                pack_id,
                blobs: blobs.into_values().collect(),
            })
            .collect();

        let workers = PACK_WORKERS.min(plans.len());
        let (job_tx, job_rx) = bounded::<PackPlan>(plans.len());
        let (res_tx, res_rx) = bounded::<Result<()>>(workers);
        for plan in plans {
            job_tx.send(plan).expect("job channel open");
        }
        drop(job_tx);

        let handles = &handles;
        let this: &Self = self;
        std::thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                let cancel = cancel.clone();
                s.spawn(move || {
                    while let Ok(plan) = job_rx.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let result = this.restore_one_pack(&plan, handles);
                        if res_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(res_tx);

            let mut run = Ok(());
            for result in res_rx.iter() {
                if run.is_ok() {
                    if let Err(e) = result {
                        cancel.cancel();
                        run = Err(e);
                    }
                }
            }
            run
        })?;

        cancel.check()
    }

    /// One ranged read covering every blob this pack contributes, then
    /// decrypt and scatter the payloads to their file offsets.
    fn restore_one_pack(&self, plan: &PackPlan, handles: &[std::fs::File]) -> Result<()> {
        let start = plan.blobs.iter().map(|b| b.offset).min().unwrap_or(0) as u64;
        let end = plan
            .blobs
            .iter()
            .map(|b| b.offset as u64 + b.length as u64)
            .max()
            .unwrap_or(0);

        let handle = Handle::new(FileKind::Pack, &plan.pack_id.to_hex());
        let data = self
            .repo
            .backend()
            .load(&handle, (end - start) as u32, start)?;

        for blob in &plan.blobs {
            let lo = (blob.offset as u64 - start) as usize;
            let hi = lo + blob.length as usize;
            let plain = self.repo.key().decrypt(&data[lo..hi])?;
            if Id::hash(&plain) != blob.id {
                return Err(SiloError::BlobCorrupt {
                    id: blob.id,
                    reason: format!("hash mismatch in pack {}", plan.pack_id.short()),
                });
            }

            for target in &blob.targets {
                write_at(&handles[target.file_index], &plain, target.file_offset)?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn write_at(file: &std::fs::File, data: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_at(file: &std::fs::File, data: &[u8], offset: u64) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_repository;

    #[test]
    fn restores_multi_blob_file_out_of_order() {
        let repo = test_repository();
        let part1 = vec![b'x'; 300];
        let part2 = vec![b'y'; 200];
        let id1 = repo.save_blob(BlobType::Data, &part1).unwrap().0;
        let id2 = repo.save_blob(BlobType::Data, &part2).unwrap().0;
        repo.flush().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("joined");
        let mut restorer = FileRestorer::new(&repo);
        restorer.add_file(target.clone(), vec![id1, id2], 500);
        restorer.restore_files(&CancelToken::new()).unwrap();

        let mut expected = part1;
        expected.extend_from_slice(&part2);
        assert_eq!(std::fs::read(&target).unwrap(), expected);
    }

    #[test]
    fn shared_blob_lands_in_both_files() {
        let repo = test_repository();
        let shared = vec![b'z'; 128];
        let id = repo.save_blob(BlobType::Data, &shared).unwrap().0;
        repo.flush().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut restorer = FileRestorer::new(&repo);
        restorer.add_file(dir.path().join("one"), vec![id], 128);
        restorer.add_file(dir.path().join("two"), vec![id, id], 256);
        restorer.restore_files(&CancelToken::new()).unwrap();

        assert_eq!(std::fs::read(dir.path().join("one")).unwrap(), shared);
        let mut doubled = shared.clone();
        doubled.extend_from_slice(&shared);
        assert_eq!(std::fs::read(dir.path().join("two")).unwrap(), doubled);
    }

    #[test]
    fn missing_blob_fails_before_touching_packs() {
        let repo = test_repository();
        let dir = tempfile::tempdir().unwrap();
        let mut restorer = FileRestorer::new(&repo);
        restorer.add_file(dir.path().join("f"), vec![Id::hash(b"ghost")], 10);
        assert!(matches!(
            restorer.restore_files(&CancelToken::new()),
            Err(SiloError::BlobNotFound(_))
        ));
    }

    #[test]
    fn empty_registration_is_a_no_op() {
        let repo = test_repository();
        FileRestorer::new(&repo)
            .restore_files(&CancelToken::new())
            .unwrap();
    }
}
