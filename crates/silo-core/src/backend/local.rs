use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use rand::RngCore;

use crate::error::{Result, SiloError};

use super::{Backend, FileInfo, FileKind, Handle};

/// Object store on a local filesystem, the reference backend implementation.
/// Remote stores implement the same trait as external collaborators.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory. The directory is
    /// created if missing.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        Ok(Self { root })
    }

    /// Reject storage paths that could escape the repository root.
    fn validate(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(SiloError::Config("unsafe storage path: empty".into()));
        }
        if path.starts_with('/') || path.contains('\\') {
            return Err(SiloError::Config(format!(
                "unsafe storage path: '{path}'"
            )));
        }
        for component in Path::new(path).components() {
            if component == Component::ParentDir {
                return Err(SiloError::Config(format!(
                    "unsafe storage path: parent traversal '{path}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, handle: &Handle) -> Result<PathBuf> {
        let name = handle.filename();
        Self::validate(&name)?;
        Ok(self.root.join(name))
    }

    fn not_found(handle: &Handle) -> SiloError {
        SiloError::NotFound {
            kind: handle.kind,
            name: handle.name.clone(),
        }
    }
}

impl Backend for LocalBackend {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        let path = self.resolve(handle)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        let path = self.resolve(handle)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(FileInfo {
                name: handle.name.clone(),
                size: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Self::not_found(handle)),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        let path = self.resolve(handle)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(SiloError::from_io_save)?;
        }

        // Write into a sibling temp file, then rename into place so readers
        // never observe a torn write.
        let tmp = path.with_extension(format!("tmp-{:016x}", rand::thread_rng().next_u64()));
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(SiloError::from_io_save(e));
        }
        fs::rename(&tmp, &path).map_err(SiloError::from_io_save)?;
        Ok(())
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        let path = self.resolve(handle)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Self::not_found(handle))
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
                        format!(
                            "short read on {handle}: wanted {length} bytes at {offset}, got {filled}"
                        ),
                    )))
                }
                Ok(n) => filled += n,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        let path = self.resolve(handle)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, kind: FileKind, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()> {
        if kind == FileKind::Config {
            if let Ok(meta) = fs::metadata(self.root.join("config")) {
                f(&FileInfo {
                    name: "config".to_string(),
                    size: meta.len(),
                })?;
            }
            return Ok(());
        }

        let dir = self.root.join(kind.dirname());
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        self.list_dir(&dir, f)
    }

    fn delete_all(&self) -> Result<()> {
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }
}

impl LocalBackend {
    /// Recursively walk `dir`, reporting each regular file. Pack shards add
    /// one directory level; file names are reported without their path.
    fn list_dir(&self, dir: &Path, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_dir(&entry.path(), f)?;
            } else if file_type.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                // skip leftover temp files from interrupted saves
                if name.contains(".tmp-") {
                    continue;
                }
                let size = entry.metadata()?.len();
                f(&FileInfo { name, size })?;
            }
        }
        Ok(())
    }
}
