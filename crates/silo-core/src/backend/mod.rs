pub mod local;
pub mod retry;

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SiloError};

/// The kinds of files a repository stores. Every repository object lives in
/// one of these groups; names are hex identifiers except `config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Config,
    Index,
    Snapshot,
    Pack,
    Key,
    Lock,
}

impl FileKind {
    /// Directory under the repository root holding files of this kind.
    /// `config` is a single file at the root; packs are sharded one level
    /// deeper by the first two hex characters of their name.
    pub fn dirname(&self) -> &'static str {
        match self {
            FileKind::Config => "",
            FileKind::Index => "index",
            FileKind::Snapshot => "snapshots",
            FileKind::Pack => "data",
            FileKind::Key => "keys",
            FileKind::Lock => "locks",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileKind::Config => "config",
            FileKind::Index => "index",
            FileKind::Snapshot => "snapshot",
            FileKind::Pack => "pack",
            FileKind::Key => "key",
            FileKind::Lock => "lock",
        };
        write!(f, "{name}")
    }
}

/// Names one file in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub kind: FileKind,
    pub name: String,
}

impl Handle {
    pub fn new(kind: FileKind, name: &str) -> Self {
        Handle {
            kind,
            name: name.to_string(),
        }
    }

    /// The repository config file. Its name is fixed.
    pub fn config() -> Self {
        Handle {
            kind: FileKind::Config,
            name: "config".to_string(),
        }
    }

    /// The `/`-separated storage path for this handle.
    pub fn filename(&self) -> String {
        match self.kind {
            FileKind::Config => "config".to_string(),
            FileKind::Pack if self.name.len() >= 2 => {
                format!("data/{}/{}", &self.name[..2], self.name)
            }
            kind => format!("{}/{}", kind.dirname(), self.name),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/{}>", self.kind, self.name)
    }
}

/// Name and size of one stored file, as reported by `stat` and `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// The minimal object-store interface the core consumes. Implementations
/// must guarantee atomic overwrite on `save` (no torn writes) and that
/// `list` reports every file present when the call started.
pub trait Backend: Send + Sync {
    /// Human-readable location, for messages only.
    fn location(&self) -> String;

    /// Whether a file exists.
    fn test(&self, handle: &Handle) -> Result<bool>;

    /// Size and name of a file. Fails with a not-found error if absent.
    fn stat(&self, handle: &Handle) -> Result<FileInfo>;

    /// Atomically write a file. Overwrites any existing content.
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()>;

    /// Read `length` bytes at `offset`; `length == 0` reads to end of file.
    /// A short read is an error, never a silent truncation.
    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>>;

    /// Remove a file. Removing an absent file is not an error.
    fn remove(&self, handle: &Handle) -> Result<()>;

    /// Invoke `f` for every file of the given kind. Returning an error from
    /// `f` aborts the listing and surfaces that error.
    fn list(&self, kind: FileKind, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()>;

    /// Wipe the whole store.
    fn delete_all(&self) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl Backend for Arc<dyn Backend> {
    fn location(&self) -> String {
        (**self).location()
    }
    fn test(&self, handle: &Handle) -> Result<bool> {
        (**self).test(handle)
    }
    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        (**self).stat(handle)
    }
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        (**self).save(handle, data)
    }
    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        (**self).load(handle, length, offset)
    }
    fn remove(&self, handle: &Handle) -> Result<()> {
        (**self).remove(handle)
    }
    fn list(&self, kind: FileKind, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()> {
        (**self).list(kind, f)
    }
    fn delete_all(&self) -> Result<()> {
        (**self).delete_all()
    }
    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Resolve a unique name by hex prefix among files of one kind.
pub fn find(backend: &dyn Backend, kind: FileKind, prefix: &str) -> Result<String> {
    let mut matches = Vec::new();
    backend.list(kind, &mut |info| {
        if info.name.starts_with(prefix) {
            matches.push(info.name.clone());
        }
        Ok(())
    })?;

    match matches.len() {
        0 => Err(SiloError::NoIdPrefixFound(prefix.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(SiloError::MultipleIdMatches(prefix.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryBackend;

    #[test]
    fn handle_filenames() {
        assert_eq!(Handle::config().filename(), "config");
        assert_eq!(
            Handle::new(FileKind::Index, "deadbeef").filename(),
            "index/deadbeef"
        );
        assert_eq!(
            Handle::new(FileKind::Pack, "ab01cd02").filename(),
            "data/ab/ab01cd02"
        );
        assert_eq!(
            Handle::new(FileKind::Lock, "0123").filename(),
            "locks/0123"
        );
    }

    #[test]
    fn find_by_prefix() {
        let be = MemoryBackend::new();
        be.save(&Handle::new(FileKind::Snapshot, "aabb01"), b"x").unwrap();
        be.save(&Handle::new(FileKind::Snapshot, "aacc02"), b"y").unwrap();

        assert_eq!(find(&be, FileKind::Snapshot, "aabb").unwrap(), "aabb01");
        assert!(matches!(
            find(&be, FileKind::Snapshot, "aa"),
            Err(SiloError::MultipleIdMatches(_))
        ));
        assert!(matches!(
            find(&be, FileKind::Snapshot, "ff"),
            Err(SiloError::NoIdPrefixFound(_))
        ));
    }
}
