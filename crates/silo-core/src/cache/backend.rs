use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use crate::backend::{Backend, FileInfo, FileKind, Handle};
use crate::error::Result;

use super::{is_cacheable, Cache};

/// Backend wrapper that memoizes immutable files in an on-disk [`Cache`].
///
/// Loads of cacheable kinds fault the whole file into the cache once and
/// serve every request from disk afterwards. At most one upstream fetch per
/// file runs at a time; concurrent callers for the same file wait for the
/// winner and then read from disk.
pub struct CachedBackend {
    upstream: Arc<dyn Backend>,
    cache: Cache,
    in_flight: Mutex<HashSet<String>>,
    fetched: Condvar,
    /// When set, ranged pack reads fault in the whole pack instead of
    /// passing through to the upstream store.
    prefetch_packs: bool,
}

impl CachedBackend {
    pub fn new(upstream: Arc<dyn Backend>, cache: Cache) -> Self {
        CachedBackend {
            upstream,
            cache,
            in_flight: Mutex::new(HashSet::new()),
            fetched: Condvar::new(),
            prefetch_packs: false,
        }
    }

    pub fn with_prefetch_packs(mut self, prefetch: bool) -> Self {
        self.prefetch_packs = prefetch;
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Fault `handle` into the cache, deduplicating concurrent fetches.
    fn ensure_cached(&self, handle: &Handle) -> Result<()> {
        let key = handle.filename();
        loop {
            if self.cache.has(handle) {
                return Ok(());
            }
            let mut flight = self.in_flight.lock().unwrap();
            if !flight.contains(&key) {
                flight.insert(key.clone());
                break;
            }
            // another caller is fetching this file; wait and re-check
            let _guard = self.fetched.wait(flight).unwrap();
        }

        let fetch = (|| {
            let data = self.upstream.load(handle, 0, 0)?;
            self.cache.save(handle, &data)
        })();

        let mut flight = self.in_flight.lock().unwrap();
        flight.remove(&key);
        self.fetched.notify_all();
        drop(flight);

        if let Err(e) = &fetch {
            tracing::debug!("cache fetch of {handle} failed: {e}");
        }
        fetch
    }
}

impl Backend for CachedBackend {
    fn location(&self) -> String {
        self.upstream.location()
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        if self.cache.has(handle) {
            return Ok(true);
        }
        self.upstream.test(handle)
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        self.upstream.stat(handle)
    }

    /// Write-through: the upstream store is written first, then the mirror.
    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        self.upstream.save(handle, data)?;
        if let Err(e) = self.cache.save(handle, data) {
            tracing::debug!("cache write-through for {handle} failed: {e}");
        }
        Ok(())
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        if !is_cacheable(handle.kind) {
            return self.upstream.load(handle, length, offset);
        }

        // Ranged pack reads bypass the cache unless whole-pack prefetch is
        // on; restorers read most of a pack anyway, checkers do not.
        if handle.kind == FileKind::Pack
            && length > 0
            && !self.prefetch_packs
            && !self.cache.has(handle)
        {
            return self.upstream.load(handle, length, offset);
        }

        self.ensure_cached(handle)?;
        self.cache.load(handle, length, offset)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        self.upstream.remove(handle)?;
        self.cache.remove(handle)
    }

    fn list(&self, kind: FileKind, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()> {
        self.upstream.list(kind, f)
    }

    fn delete_all(&self) -> Result<()> {
        self.upstream.delete_all()
    }

    fn close(&self) -> Result<()> {
        self.upstream.close()
    }
}
