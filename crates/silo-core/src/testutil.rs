use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, FileInfo, FileKind, Handle};
use crate::crypto::Key;
use crate::error::{Result, SiloError};
use crate::repo::Repository;

pub const TEST_PASSWORD: &str = "geheim";

/// In-memory object store for tests. Thread-safe via a single mutex.
pub struct MemoryBackend {
    data: Mutex<HashMap<(FileKind, String), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn location(&self) -> String {
        "memory".into()
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(&(handle.kind, handle.name.clone())))
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        let map = self.data.lock().unwrap();
        match map.get(&(handle.kind, handle.name.clone())) {
            Some(data) => Ok(FileInfo {
                name: handle.name.clone(),
                size: data.len() as u64,
            }),
            None => Err(SiloError::NotFound {
                kind: handle.kind,
                name: handle.name.clone(),
            }),
        }
    }

    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.insert((handle.kind, handle.name.clone()), data.to_vec());
        Ok(())
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        let map = self.data.lock().unwrap();
        let data = map
            .get(&(handle.kind, handle.name.clone()))
            .ok_or_else(|| SiloError::NotFound {
                kind: handle.kind,
                name: handle.name.clone(),
            })?;

        let start = offset as usize;
        if start > data.len() {
            return Err(SiloError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("offset {offset} beyond end of {handle}"),
            )));
        }
        if length == 0 {
            return Ok(data[start..].to_vec());
        }
        let end = start + length as usize;
        if end > data.len() {
            return Err(SiloError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read on {handle}"),
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(&(handle.kind, handle.name.clone()));
        Ok(())
    }

    fn list(&self, kind: FileKind, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()> {
        let snapshot: Vec<FileInfo> = {
            let map = self.data.lock().unwrap();
            map.iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, name), data)| FileInfo {
                    name: name.clone(),
                    size: data.len() as u64,
                })
                .collect()
        };
        for info in snapshot {
            f(&info)?;
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        self.data.lock().unwrap().clear();
        Ok(())
    }
}

/// Wrapper counting `load` calls, for cache behavior tests.
pub struct CountingBackend {
    inner: Arc<dyn Backend>,
    loads: AtomicUsize,
}

impl CountingBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        CountingBackend {
            inner,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
    fn location(&self) -> String {
        self.inner.location()
    }
    fn test(&self, handle: &Handle) -> Result<bool> {
        self.inner.test(handle)
    }
    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        self.inner.stat(handle)
    }
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        self.inner.save(handle, data)
    }
    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(handle, length, offset)
    }
    fn remove(&self, handle: &Handle) -> Result<()> {
        self.inner.remove(handle)
    }
    fn list(&self, kind: FileKind, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()> {
        self.inner.list(kind, f)
    }
    fn delete_all(&self) -> Result<()> {
        self.inner.delete_all()
    }
}

/// Deterministic key material for codec tests.
pub fn test_key() -> Key {
    let mut buf = [0u8; 64];
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(37).wrapping_add(11);
    }
    Key::from_derived(&buf)
}

/// Fresh in-memory repository with cheap KDF parameters.
pub fn test_repository() -> Repository {
    test_repository_on(Arc::new(MemoryBackend::new()))
}

/// Like [`test_repository`], but on a caller-provided backend.
pub fn test_repository_on(backend: Arc<dyn Backend>) -> Repository {
    Repository::init_with_kdf(backend, TEST_PASSWORD, 256, 2, 1)
        .expect("failed to initialize test repository")
}
