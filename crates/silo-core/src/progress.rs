use std::sync::Arc;

/// Progress reporting consumed by long-running operations. Implementations
/// are provided by the caller (a terminal bar, a log line, a test recorder).
pub trait Progress: Send + Sync {
    fn add(&self, n: u64);
    fn set_max(&self, max: u64);
    fn done(&self);
}

/// Nil-tolerant progress handle: every method is a no-op when no reporter
/// was attached, so callers never have to branch.
#[derive(Clone, Default)]
pub struct Counter {
    inner: Option<Arc<dyn Progress>>,
}

impl Counter {
    pub fn none() -> Self {
        Counter { inner: None }
    }

    pub fn new(progress: Arc<dyn Progress>) -> Self {
        Counter {
            inner: Some(progress),
        }
    }

    pub fn add(&self, n: u64) {
        if let Some(p) = &self.inner {
            p.add(n);
        }
    }

    pub fn set_max(&self, max: u64) {
        if let Some(p) = &self.inner {
            p.set_max(max);
        }
    }

    pub fn done(&self) {
        if let Some(p) = &self.inner {
            p.done();
        }
    }
}
