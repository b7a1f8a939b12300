use std::collections::HashMap;

/// Remembers the first restored path for each hard-linked inode so later
/// occurrences become links instead of second copies.
#[derive(Debug, Default)]
pub struct HardlinkIndex {
    // (inode, device) -> first-seen location within the snapshot
    paths: HashMap<(u64, u64), String>,
}

impl HardlinkIndex {
    pub fn new() -> Self {
        HardlinkIndex::default()
    }

    pub fn has(&self, inode: u64, device: u64) -> bool {
        inode != 0 && self.paths.contains_key(&(inode, device))
    }

    pub fn add(&mut self, inode: u64, device: u64, location: &str) {
        if inode == 0 {
            return;
        }
        self.paths
            .entry((inode, device))
            .or_insert_with(|| location.to_string());
    }

    pub fn path(&self, inode: u64, device: u64) -> Option<&str> {
        self.paths.get(&(inode, device)).map(String::as_str)
    }
}
