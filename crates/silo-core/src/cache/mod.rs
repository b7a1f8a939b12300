pub mod backend;
pub mod blob_lru;

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::backend::{FileKind, Handle};
use crate::error::{Result, SiloError};
use crate::id::Id;

pub use backend::CachedBackend;
pub use blob_lru::BlobLru;

const KNOWN_REPOS_FILE: &str = "known_repos";

/// On-disk mirror of a repository's immutable files, one directory per
/// repository id under the user cache root. Key files are never cached.
pub struct Cache {
    base: PathBuf,
    dir: PathBuf,
}

/// The default cache root: `<user cache dir>/silo`.
pub fn default_base() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("silo"))
}

/// Whether files of this kind are mirrored on disk. Config and locks are
/// mutable, keys hold secrets; only content-addressed immutable files
/// qualify.
pub fn is_cacheable(kind: FileKind) -> bool {
    matches!(
        kind,
        FileKind::Index | FileKind::Snapshot | FileKind::Pack
    )
}

impl Cache {
    /// Open (or create) the cache directory for a repository.
    pub fn new(repo_id: &Id, base: Option<PathBuf>) -> Result<Cache> {
        let base = base
            .or_else(default_base)
            .ok_or_else(|| SiloError::Config("no cache directory available".into()))?;
        let dir = base.join(repo_id.to_hex());
        for sub in ["index", "snapshots", "data"] {
            fs::create_dir_all(dir.join(sub))?;
        }
        let cache = Cache { base, dir };
        cache.mark_known(repo_id)?;
        Ok(cache)
    }

    pub fn location(&self) -> &Path {
        &self.dir
    }

    fn path(&self, handle: &Handle) -> PathBuf {
        self.dir.join(handle.filename())
    }

    pub fn has(&self, handle: &Handle) -> bool {
        is_cacheable(handle.kind) && self.path(handle).is_file()
    }

    /// Read from the cached copy. Same contract as backend `load`: short
    /// reads are errors.
    pub fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        let mut file = match fs::File::open(self.path(handle)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SiloError::NotFound {
                    kind: handle.kind,
                    name: handle.name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        if length == 0 {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            return Ok(buf);
        }
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(SiloError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("short read from cached {handle}"),
                    )))
                }
                Ok(n) => filled += n,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    /// Store a full file. Written to a temp file and renamed so concurrent
    /// readers never see partial content.
    pub fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        if !is_cacheable(handle.kind) {
            return Ok(());
        }
        let path = self.path(handle);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp-{:016x}", rand::thread_rng().next_u64()));
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, handle: &Handle) -> Result<()> {
        match fs::remove_file(self.path(handle)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop cached files of `kind` whose names are not in `keep`. Used after
    /// index rewrites so superseded files do not linger.
    pub fn clear(&self, kind: FileKind, keep: &HashSet<String>) -> Result<usize> {
        let dir = self.dir.join(kind.dirname());
        let mut removed = 0;
        for entry in walk_files(&dir)? {
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !keep.contains(&name) {
                tracing::debug!("cache: dropping stale {kind} file {name}");
                fs::remove_file(&entry)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Record this repository in the known-repos file so its cache directory
    /// is not reported as garbage.
    fn mark_known(&self, repo_id: &Id) -> Result<()> {
        let path = self.base.join(KNOWN_REPOS_FILE);
        let mut known = read_known(&path);
        if known.insert(repo_id.to_hex()) {
            let mut lines: Vec<&String> = known.iter().collect();
            lines.sort();
            let body = lines
                .into_iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n");
            fs::write(&path, body + "\n")?;
        }
        Ok(())
    }
}

/// Cache directories under `base` that no known repository owns. The caller
/// decides whether to delete them.
pub fn old_cache_dirs(base: &Path) -> Result<Vec<PathBuf>> {
    let known = read_known(&base.join(KNOWN_REPOS_FILE));
    let mut old = Vec::new();
    let entries = match fs::read_dir(base) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(old),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if Id::parse(&name).is_ok() && !known.contains(&name) {
            old.push(entry.path());
        }
    }
    old.sort();
    Ok(old)
}

fn read_known(path: &Path) -> HashSet<String> {
    match fs::read_to_string(path) {
        Ok(body) => body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        Err(_) => HashSet::new(),
    }
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            files.extend(walk_files(&entry.path())?);
        } else {
            files.push(entry.path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_in(dir: &Path) -> (Id, Cache) {
        let id = Id::random();
        let cache = Cache::new(&id, Some(dir.to_path_buf())).unwrap();
        (id, cache)
    }

    #[test]
    fn save_load_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, cache) = cache_in(tmp.path());
        let h = Handle::new(FileKind::Pack, "ab01");

        assert!(!cache.has(&h));
        cache.save(&h, b"pack bytes").unwrap();
        assert!(cache.has(&h));
        assert_eq!(cache.load(&h, 0, 0).unwrap(), b"pack bytes");
        assert_eq!(cache.load(&h, 4, 5).unwrap(), b"byte");

        cache.remove(&h).unwrap();
        assert!(!cache.has(&h));
    }

    #[test]
    fn key_files_are_never_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, cache) = cache_in(tmp.path());
        let h = Handle::new(FileKind::Key, "aa");
        cache.save(&h, b"secret").unwrap();
        assert!(!cache.has(&h));
    }

    #[test]
    fn clear_keeps_listed_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, cache) = cache_in(tmp.path());
        cache.save(&Handle::new(FileKind::Index, "aa"), b"1").unwrap();
        cache.save(&Handle::new(FileKind::Index, "bb"), b"2").unwrap();

        let keep: HashSet<String> = ["aa".to_string()].into();
        let removed = cache.clear(FileKind::Index, &keep).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.has(&Handle::new(FileKind::Index, "aa")));
        assert!(!cache.has(&Handle::new(FileKind::Index, "bb")));
    }

    #[test]
    fn old_dirs_excludes_known_repos() {
        let tmp = tempfile::tempdir().unwrap();
        let (_known_id, _cache) = cache_in(tmp.path());

        // a cache dir nobody recorded
        let stray = Id::random();
        fs::create_dir_all(tmp.path().join(stray.to_hex())).unwrap();
        // unrelated directory names are ignored
        fs::create_dir_all(tmp.path().join("not-a-repo")).unwrap();

        let old = old_cache_dirs(tmp.path()).unwrap();
        assert_eq!(old, vec![tmp.path().join(stray.to_hex())]);
    }
}
