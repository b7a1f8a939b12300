pub mod filerestorer;
pub mod hardlinks;

use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::blob::BlobType;
use crate::cancel::CancelToken;
use crate::error::{Result, SiloError};
use crate::id::Id;
use crate::platform::fs as pfs;
use crate::repo::Repository;
use crate::snapshot::tree::{Node, NodeType};
use crate::snapshot::Snapshot;

pub use filerestorer::FileRestorer;
pub use hardlinks::HardlinkIndex;

/// Per-error decision callback: return `Ok(())` to skip the node and keep
/// walking, or an error to abort the restore.
pub type ErrorPolicy = Box<dyn Fn(&str, SiloError) -> Result<()> + Send + Sync>;

/// Node selection callback. Unselected directories are not descended into.
pub type SelectFilter = Box<dyn Fn(&str, &Node) -> bool + Send + Sync>;

/// Materializes one snapshot to a directory in two tree passes: layout and
/// file contents first, then specials, hardlinks, and metadata, restoring
/// each directory's metadata only after everything inside it.
pub struct Restorer<'r> {
    repo: &'r Repository,
    snapshot: Snapshot,
    pub error: ErrorPolicy,
    pub select: SelectFilter,
}

struct Visit<'a> {
    node: &'a Node,
    target: PathBuf,
    location: String,
}

impl<'r> Restorer<'r> {
    /// A restorer for the given snapshot, aborting on every error until the
    /// caller installs a different policy.
    pub fn new(repo: &'r Repository, snapshot_id: &Id) -> Result<Self> {
        let snapshot = repo.load_snapshot(snapshot_id)?;
        Ok(Restorer {
            repo,
            snapshot,
            error: Box::new(|_, err| Err(err)),
            select: Box::new(|_, _| true),
        })
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Restore the snapshot below `dst`.
    pub fn restore_to(&self, dst: &Path, cancel: &CancelToken) -> Result<()> {
        std::fs::create_dir_all(dst)?;

        let mut hardlinks = HardlinkIndex::new();
        let mut files = FileRestorer::new(self.repo);

        // Pass 1: directories and file contents.
        self.traverse(
            dst,
            "",
            &self.snapshot.tree,
            cancel,
            &mut |visit, phase| match phase {
                Phase::EnterDir => {
                    std::fs::create_dir_all(&visit.target)?;
                    pfs::apply_mode(&visit.target, 0o700)?;
                    Ok(())
                }
                Phase::Node => {
                    if visit.node.node_type != NodeType::File || visit.node.size == 0 {
                        return Ok(());
                    }
                    if visit.node.links > 1 {
                        if hardlinks.has(visit.node.inode, visit.node.device_id) {
                            return Ok(());
                        }
                        hardlinks.add(visit.node.inode, visit.node.device_id, &visit.location);
                    }
                    files.add_file(
                        visit.target.clone(),
                        visit.node.content.clone(),
                        visit.node.size,
                    );
                    Ok(())
                }
                Phase::LeaveDir => Ok(()),
            },
        )?;

        files.restore_files(cancel)?;

        // Pass 2: specials, empty files, hardlinks, metadata; directory
        // metadata last so writes inside don't disturb its times.
        self.traverse(
            dst,
            "",
            &self.snapshot.tree,
            cancel,
            &mut |visit, phase| match phase {
                Phase::EnterDir => Ok(()),
                Phase::Node => self.restore_node_pass2(dst, visit, &mut hardlinks),
                Phase::LeaveDir => self.restore_metadata(visit.node, &visit.target),
            },
        )?;

        Ok(())
    }

    fn restore_node_pass2(
        &self,
        dst: &Path,
        visit: &Visit<'_>,
        hardlinks: &mut HardlinkIndex,
    ) -> Result<()> {
        let node = visit.node;
        let target = &visit.target;

        if node.node_type != NodeType::File {
            self.create_special(node, target)?;
            return self.restore_metadata(node, target);
        }

        // empty files were skipped by the file restorer, but hardlinks to
        // them still coalesce
        if node.size == 0
            && (node.links < 2 || !hardlinks.has(node.inode, node.device_id))
        {
            if node.links > 1 {
                hardlinks.add(node.inode, node.device_id, &visit.location);
            }
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(target)?;
            return self.restore_metadata(node, target);
        }

        if hardlinks.has(node.inode, node.device_id) {
            let first = hardlinks
                .path(node.inode, node.device_id)
                .expect("hardlink index entry")
                .to_string();
            if first != visit.location {
                let first_target = dst.join(&first);
                match std::fs::remove_file(target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                pfs::create_hardlink(&first_target, target)?;
                return self.restore_metadata(node, target);
            }
        }

        // contents were written in pass 1; only metadata remains
        self.restore_metadata(node, target)
    }

    fn create_special(&self, node: &Node, target: &Path) -> Result<()> {
        match node.node_type {
            NodeType::Symlink => {
                let link_target = node.linktarget.as_deref().ok_or_else(|| {
                    SiloError::InvalidNode {
                        name: node.name.clone(),
                        reason: "symlink without target".into(),
                    }
                })?;
                match std::fs::remove_file(target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                pfs::create_symlink(Path::new(link_target), target)?;
            }
            NodeType::Fifo => pfs::create_fifo(target, node.mode)?,
            NodeType::Dev => pfs::create_device(target, node.mode, node.device, false)?,
            NodeType::Chardev => pfs::create_device(target, node.mode, node.device, true)?,
            NodeType::Dir => {
                // created in pass 1; nothing to do here
            }
            NodeType::Socket | NodeType::File => {}
        }
        Ok(())
    }

    /// Apply ownership, permissions, xattrs, and times, in that order.
    fn restore_metadata(&self, node: &Node, target: &Path) -> Result<()> {
        let is_symlink = node.node_type == NodeType::Symlink;

        if let Err(e) = pfs::apply_owner(target, node.uid, node.gid) {
            // unprivileged restores cannot chown; keep going
            tracing::debug!("chown {}: {e}", target.display());
        }

        if !is_symlink {
            pfs::apply_mode(target, node.mode)?;
        }

        if let Some(xattrs) = &node.extended_attributes {
            for attr in xattrs {
                if let Err(e) = pfs::set_xattr(target, &attr.name, &attr.value) {
                    tracing::debug!(
                        "setting xattr {} on {}: {e}",
                        attr.name,
                        target.display()
                    );
                }
            }
        }

        let mtime_ns = node
            .mtime
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let atime_ns = node.atime.and_then(|t| t.timestamp_nanos_opt());
        pfs::set_times(target, atime_ns, mtime_ns)?;
        Ok(())
    }

    /// Depth-first walk applying `visit` to every selected node. Node names
    /// that could escape the target directory are rejected through the error
    /// policy; sockets are skipped entirely.
    fn traverse(
        &self,
        target: &Path,
        location: &str,
        tree_id: &Id,
        cancel: &CancelToken,
        visit: &mut dyn FnMut(&Visit<'_>, Phase) -> Result<()>,
    ) -> Result<()> {
        cancel.check()?;

        let tree = match self.repo.load_tree(tree_id) {
            Ok(tree) => tree,
            Err(e) => return (self.error)(location, e),
        };

        for node in &tree.nodes {
            if !valid_node_name(&node.name) {
                (self.error)(
                    location,
                    SiloError::InvalidNode {
                        name: node.name.clone(),
                        reason: "name would escape the restore target".into(),
                    },
                )?;
                continue;
            }

            if node.node_type == NodeType::Socket {
                continue;
            }

            let node_target = target.join(&node.name);
            let node_location = if location.is_empty() {
                node.name.clone()
            } else {
                format!("{location}/{}", node.name)
            };

            if !(self.select)(&node_location, node) {
                continue;
            }

            let v = Visit {
                node,
                target: node_target,
                location: node_location,
            };

            if node.node_type == NodeType::Dir {
                let Some(subtree) = node.subtree else {
                    (self.error)(
                        &v.location,
                        SiloError::InvalidNode {
                            name: node.name.clone(),
                            reason: "directory without subtree".into(),
                        },
                    )?;
                    continue;
                };

                if let Err(e) = visit(&v, Phase::EnterDir) {
                    (self.error)(&v.location, e)?;
                    continue;
                }
                self.traverse(&v.target, &v.location, &subtree, cancel, visit)?;
                if let Err(e) = visit(&v, Phase::LeaveDir) {
                    (self.error)(&v.location, e)?;
                }
                continue;
            }

            if let Err(e) = visit(&v, Phase::Node) {
                (self.error)(&v.location, e)?;
            }
        }

        Ok(())
    }

    /// Re-read every restored file and compare each blob-sized range against
    /// its expected hash. Returns the number of files verified.
    pub fn verify_files(&self, dst: &Path, cancel: &CancelToken) -> Result<usize> {
        let mut count = 0usize;
        self.verify_tree(dst, &self.snapshot.tree, cancel, &mut count)?;
        Ok(count)
    }

    fn verify_tree(
        &self,
        target: &Path,
        tree_id: &Id,
        cancel: &CancelToken,
        count: &mut usize,
    ) -> Result<()> {
        cancel.check()?;
        let tree = self.repo.load_tree(tree_id)?;
        for node in &tree.nodes {
            if !valid_node_name(&node.name) || node.node_type == NodeType::Socket {
                continue;
            }
            let node_target = target.join(&node.name);
            match node.node_type {
                NodeType::Dir => {
                    if let Some(subtree) = node.subtree {
                        self.verify_tree(&node_target, &subtree, cancel, count)?;
                    }
                }
                NodeType::File => {
                    *count += 1;
                    self.verify_file(node, &node_target)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn verify_file(&self, node: &Node, target: &Path) -> Result<()> {
        let metadata = std::fs::metadata(target)?;
        if metadata.len() != node.size {
            return Err(SiloError::Other(format!(
                "{}: wrong size, expected {}, got {}",
                target.display(),
                node.size,
                metadata.len()
            )));
        }

        let mut file = std::fs::File::open(target)?;
        for blob_id in &node.content {
            let length = self
                .repo
                .lookup_blob_size(blob_id, BlobType::Data)
                .ok_or(SiloError::BlobNotFound(*blob_id))?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf)?;
            if &Id::hash(&buf) != blob_id {
                return Err(SiloError::BlobCorrupt {
                    id: *blob_id,
                    reason: format!("restored file {} does not match", target.display()),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    EnterDir,
    Node,
    LeaveDir,
}

/// Names may not be empty, absolute, multi-component, or dot-dots.
fn valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
