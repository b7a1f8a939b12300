use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Result, SiloError};

use super::{Backend, FileInfo, FileKind, Handle};

/// Backoff parameters for [`RetryBackend`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Give up once this much time has passed, even with attempts left.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay: Duration::from_millis(500),
            factor: 1.5,
            max_attempts: 10,
            max_elapsed: Some(Duration::from_secs(15 * 60)),
        }
    }
}

/// Called after each failed attempt with the operation name, the error, and
/// the delay before the next try.
pub type RetryObserver = dyn Fn(&str, &SiloError, Duration) + Send + Sync;

/// Wraps a backend with exponential backoff on transient failures.
///
/// Permanent errors (including not-found) are surfaced immediately.
pub struct RetryBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
    observer: Option<Box<RetryObserver>>,
    cancel: CancelToken,
}

impl RetryBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig, cancel: CancelToken) -> Self {
        RetryBackend {
            inner,
            config,
            observer: None,
            cancel,
        }
    }

    /// Install a callback observing each retried failure.
    pub fn with_observer(mut self, observer: Box<RetryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn retry<T>(&self, op: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let mut delay = self.config.initial_delay;
        let mut attempt = 0;

        loop {
            self.cancel.check()?;
            attempt += 1;

            let err = match f() {
                Ok(val) => return Ok(val),
                Err(e) => e,
            };

            let out_of_budget = attempt >= self.config.max_attempts
                || self
                    .config
                    .max_elapsed
                    .is_some_and(|cap| started.elapsed() >= cap);
            if err.is_permanent() || !err.is_transient() || out_of_budget {
                return Err(err);
            }

            // full jitter: sleep a random duration up to the current delay
            let jittered = delay.mul_f64(rand::random::<f64>().max(0.1));
            tracing::warn!(
                "{op}: transient error (attempt {attempt}/{}), retrying in {jittered:?}: {err}",
                self.config.max_attempts
            );
            if let Some(observer) = &self.observer {
                observer(op, &err, jittered);
            }
            std::thread::sleep(jittered);
            delay = delay.mul_f64(self.config.factor);
        }
    }
}

impl Backend for RetryBackend {
    fn location(&self) -> String {
        self.inner.location()
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        self.retry("test", || self.inner.test(handle))
    }

    fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        self.retry("stat", || self.inner.stat(handle))
    }

    fn save(&self, handle: &Handle, data: &[u8]) -> Result<()> {
        let result = self.retry("save", || self.inner.save(handle, data));
        if result.is_err() {
            // Remove whatever partial object the failed saves left behind so
            // a later list never sees it.
            if let Err(e) = self.inner.remove(handle) {
                tracing::debug!("cleanup of failed save {handle} failed: {e}");
            }
        }
        result
    }

    fn load(&self, handle: &Handle, length: u32, offset: u64) -> Result<Vec<u8>> {
        self.retry("load", || self.inner.load(handle, length, offset))
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        self.retry("remove", || self.inner.remove(handle))
    }

    /// Listing retries resume mid-stream: names already delivered to `f` are
    /// remembered and skipped, so each file is reported exactly once. An
    /// error from `f` aborts the listing and takes precedence over any
    /// transport error from the same round.
    fn list(&self, kind: FileKind, f: &mut dyn FnMut(&FileInfo) -> Result<()>) -> Result<()> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut inner_err: Option<SiloError> = None;

        let result = self.retry("list", || {
            self.inner.list(kind, &mut |info| {
                if !seen.insert(info.name.clone()) {
                    return Ok(());
                }
                if let Err(e) = f(info) {
                    inner_err = Some(e);
                    // abort the underlying listing; the stored error wins
                    return Err(SiloError::Cancelled);
                }
                Ok(())
            })
        });

        if let Some(err) = inner_err {
            return Err(err);
        }
        result
    }

    fn delete_all(&self) -> Result<()> {
        self.inner.delete_all()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
