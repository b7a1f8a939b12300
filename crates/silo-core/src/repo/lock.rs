use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{FileKind, Handle};
use crate::error::{Result, SiloError};
use crate::id::Id;
use crate::platform;

use super::Repository;

/// Locks older than this are considered stale regardless of their process.
const STALE_AFTER_MINUTES: i64 = 30;

/// A cooperative lock, stored as an individually encrypted JSON document
/// under the `locks/` group. Locks signal intent; backends do not enforce
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

impl Lock {
    fn new(exclusive: bool) -> Self {
        Lock {
            time: Utc::now(),
            exclusive,
            hostname: platform::hostname(),
            username: platform::username(),
            pid: platform::pid(),
            uid: platform::uid(),
            gid: platform::gid(),
        }
    }

    /// A lock is stale when its owner can be shown to be gone: the process
    /// is dead on this very host, or the timestamp is older than the
    /// staleness threshold.
    pub fn stale(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.time);
        if age > Duration::minutes(STALE_AFTER_MINUTES) {
            return true;
        }
        self.hostname == platform::hostname() && !platform::process_alive(self.pid)
    }

    fn describe(&self) -> String {
        format!(
            "{}@{} (pid {}, {} lock, acquired {})",
            self.username,
            self.hostname,
            self.pid,
            if self.exclusive { "exclusive" } else { "shared" },
            self.time.to_rfc3339()
        )
    }
}

/// Handle to a held lock. Dropping removes the lock file on a best-effort
/// basis; call [`LockGuard::unlock`] to observe removal errors.
pub struct LockGuard<'r> {
    repo: &'r Repository,
    lock: Lock,
    id: Option<Id>,
}

impl Repository {
    /// Acquire a shared lock: succeeds while no live exclusive lock exists.
    pub fn lock_shared(&self) -> Result<LockGuard<'_>> {
        self.acquire_lock(false)
    }

    /// Acquire an exclusive lock: succeeds while no other live lock of any
    /// kind exists.
    pub fn lock_exclusive(&self) -> Result<LockGuard<'_>> {
        self.acquire_lock(true)
    }

    fn acquire_lock(&self, exclusive: bool) -> Result<LockGuard<'_>> {
        self.check_for_other_locks(exclusive, None)?;

        let lock = Lock::new(exclusive);
        let id = self.save_json_unpacked(FileKind::Lock, &lock)?;

        // Another process may have written its lock between the check and
        // our write. Re-list; on conflict, back our own lock out.
        if let Err(e) = self.check_for_other_locks(exclusive, Some(&id)) {
            let _ = self
                .backend()
                .remove(&Handle::new(FileKind::Lock, &id.to_hex()));
            return Err(e);
        }

        Ok(LockGuard {
            repo: self,
            lock,
            id: Some(id),
        })
    }

    fn check_for_other_locks(&self, exclusive: bool, own: Option<&Id>) -> Result<()> {
        let mut names = Vec::new();
        self.backend().list(FileKind::Lock, &mut |info| {
            names.push(info.name.clone());
            Ok(())
        })?;

        for name in names {
            if own.is_some_and(|id| id.to_hex() == name) {
                continue;
            }
            let other: Lock = match self.load_json_unpacked(FileKind::Lock, &name) {
                Ok(lock) => lock,
                Err(e) => {
                    tracing::warn!("ignoring unreadable lock {name}: {e}");
                    continue;
                }
            };
            if other.stale() {
                continue;
            }
            if exclusive || other.exclusive {
                return Err(SiloError::AlreadyLocked(other.describe()));
            }
        }
        Ok(())
    }

    /// Remove every stale lock. Returns how many were removed.
    pub fn remove_stale_locks(&self) -> Result<usize> {
        self.remove_locks(|lock| lock.map(|l| l.stale()).unwrap_or(true))
    }

    /// Remove every lock, stale or not. A recovery hammer.
    pub fn remove_all_locks(&self) -> Result<usize> {
        self.remove_locks(|_| true)
    }

    fn remove_locks(&self, should_remove: impl Fn(Option<&Lock>) -> bool) -> Result<usize> {
        let mut names = Vec::new();
        self.backend().list(FileKind::Lock, &mut |info| {
            names.push(info.name.clone());
            Ok(())
        })?;

        let mut removed = 0;
        for name in names {
            let lock: Option<Lock> = self.load_json_unpacked(FileKind::Lock, &name).ok();
            if should_remove(lock.as_ref()) {
                tracing::debug!("removing lock {name}");
                self.backend().remove(&Handle::new(FileKind::Lock, &name))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl LockGuard<'_> {
    pub fn is_exclusive(&self) -> bool {
        self.lock.exclusive
    }

    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// Rewrite the lock with a fresh timestamp under a new id, then delete
    /// the old file, so long operations never look stale.
    pub fn refresh(&mut self) -> Result<()> {
        let old = self.id.take();
        self.lock.time = Utc::now();
        let new_id = self.repo.save_json_unpacked(FileKind::Lock, &self.lock)?;
        self.id = Some(new_id);
        if let Some(old) = old {
            self.repo
                .backend()
                .remove(&Handle::new(FileKind::Lock, &old.to_hex()))?;
        }
        Ok(())
    }

    /// Release the lock, surfacing removal errors.
    pub fn unlock(mut self) -> Result<()> {
        if let Some(id) = self.id.take() {
            self.repo
                .backend()
                .remove(&Handle::new(FileKind::Lock, &id.to_hex()))?;
        }
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let handle = Handle::new(FileKind::Lock, &id.to_hex());
            if let Err(e) = self.repo.backend().remove(&handle) {
                tracing::warn!("failed to remove lock {}: {e}", id.short());
            }
        }
    }
}
