use std::collections::HashMap;
use std::collections::VecDeque;

use crate::id::Id;

/// Per-entry bookkeeping cost added to each value's capacity when charging
/// against the cache budget.
pub const ENTRY_OVERHEAD: usize = 64;

/// Byte-bounded LRU cache for decrypted blobs.
///
/// Eviction is strict least-recently-used; `get` refreshes recency. Values
/// are charged by their allocation capacity, not length. An entry larger
/// than the whole budget is handed back to the caller un-retained.
pub struct BlobLru {
    entries: HashMap<Id, Vec<u8>>,
    // front = least recently used
    order: VecDeque<Id>,
    used: usize,
    capacity: usize,
}

impl BlobLru {
    pub fn new(capacity: usize) -> Self {
        BlobLru {
            entries: HashMap::new(),
            order: VecDeque::new(),
            used: 0,
            capacity,
        }
    }

    fn cost(value: &Vec<u8>) -> usize {
        value.capacity() + ENTRY_OVERHEAD
    }

    fn touch(&mut self, id: &Id) {
        if let Some(pos) = self.order.iter().position(|x| x == id) {
            self.order.remove(pos);
            self.order.push_back(*id);
        }
    }

    /// Fetch a clone of the cached blob, refreshing its recency.
    pub fn get(&mut self, id: &Id) -> Option<Vec<u8>> {
        if !self.entries.contains_key(id) {
            return None;
        }
        self.touch(id);
        self.entries.get(id).cloned()
    }

    /// Insert a blob, evicting least-recently-used entries to make room.
    /// Returns the value unchanged (and caches a copy of nothing) when it is
    /// too large to ever fit.
    pub fn add(&mut self, id: Id, value: Vec<u8>) -> Option<Vec<u8>> {
        let cost = Self::cost(&value);
        if cost > self.capacity {
            tracing::debug!(
                "blob {} too large for cache ({} > {} bytes)",
                id.short(),
                cost,
                self.capacity
            );
            return Some(value);
        }

        if let Some(old) = self.entries.remove(&id) {
            self.used -= Self::cost(&old);
            if let Some(pos) = self.order.iter().position(|x| x == &id) {
                self.order.remove(pos);
            }
        }

        while self.used + cost > self.capacity {
            let Some(evict) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&evict) {
                self.used -= Self::cost(&evicted);
            }
        }

        self.used += cost;
        self.entries.insert(id, value);
        self.order.push_back(id);
        None
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(fill: u8, len: usize) -> Vec<u8> {
        // exact capacity so the charged cost is predictable
        let mut v = Vec::with_capacity(len);
        v.resize(len, fill);
        v
    }

    fn id(byte: u8) -> Id {
        Id([byte; 32])
    }

    #[test]
    fn strict_lru_eviction() {
        // room for three entries of 32/30/10 KiB minus one: the oldest goes
        let mut cache = BlobLru::new(64 * 1024 + 3 * ENTRY_OVERHEAD);
        assert!(cache.add(id(1), blob(1, 32 * 1024)).is_none());
        assert!(cache.add(id(2), blob(2, 30 * 1024)).is_none());
        assert!(cache.add(id(3), blob(3, 10 * 1024)).is_none());

        assert!(!cache.contains(&id(1)), "oldest entry should be evicted");
        assert!(cache.contains(&id(2)));
        assert!(cache.contains(&id(3)));
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let mut cache = BlobLru::new(64 * 1024 + 3 * ENTRY_OVERHEAD);
        cache.add(id(1), blob(1, 32 * 1024));
        cache.add(id(2), blob(2, 30 * 1024));

        let returned = cache.add(id(9), blob(9, 65 * 1024));
        assert_eq!(returned.unwrap().len(), 65 * 1024);
        assert!(!cache.contains(&id(9)));
        // residents untouched
        assert!(cache.contains(&id(1)));
        assert!(cache.contains(&id(2)));
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = BlobLru::new(3 * (1024 + ENTRY_OVERHEAD));
        cache.add(id(1), blob(1, 1024));
        cache.add(id(2), blob(2, 1024));
        cache.add(id(3), blob(3, 1024));

        // touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(&id(1)).is_some());
        cache.add(id(4), blob(4, 1024));

        assert!(cache.contains(&id(1)));
        assert!(!cache.contains(&id(2)));
        assert!(cache.contains(&id(3)));
        assert!(cache.contains(&id(4)));
    }

    #[test]
    fn reinsert_replaces_value() {
        let mut cache = BlobLru::new(8 * 1024);
        cache.add(id(1), blob(1, 100));
        cache.add(id(1), blob(7, 200));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&id(1)).unwrap(), blob(7, 200));
    }

    #[test]
    fn accounting_balances_after_churn() {
        let mut cache = BlobLru::new(4 * 1024);
        for i in 0..50u8 {
            cache.add(id(i), blob(i, 512));
        }
        assert!(cache.used_bytes() <= 4 * 1024);
        assert!(!cache.is_empty());
    }
}
