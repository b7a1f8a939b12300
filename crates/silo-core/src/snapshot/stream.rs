use crossbeam_channel::unbounded;

use crate::cancel::CancelToken;
use crate::error::{Result, SiloError};
use crate::id::Id;
use crate::repo::Repository;
use crate::snapshot::tree::{NodeType, Tree};

/// Number of tree-loading workers when the caller does not override it.
pub const DEFAULT_STREAM_WORKERS: usize = 5;

/// One loaded (or failed) tree delivered by [`stream_trees`].
pub struct TreeItem {
    pub id: Id,
    pub tree: Result<Tree>,
}

/// Bounded-parallel traversal over a set of tree roots.
///
/// A worker pool loads trees while the scheduler owns the pending queue.
/// `seen` is consulted (keyed by tree id, never by path) before a subtree is
/// scheduled; returning `true` skips it, which keeps shared subtrees from
/// being walked twice. Children are enqueued in node order once their parent
/// has loaded, so parents are always delivered before their children within
/// a root. `visit` runs on the calling thread; an error from it cancels the
/// workers and is returned.
pub fn stream_trees(
    repo: &Repository,
    roots: &[Id],
    workers: usize,
    cancel: &CancelToken,
    mut seen: impl FnMut(&Id) -> bool,
    mut visit: impl FnMut(TreeItem) -> Result<()>,
) -> Result<()> {
    let workers = workers.max(1);
    let cancel = cancel.child();
    let (job_tx, job_rx) = unbounded::<Id>();
    let (item_tx, item_rx) = unbounded::<TreeItem>();

    std::thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let item_tx = item_tx.clone();
            let cancel = cancel.clone();
            s.spawn(move || {
                while let Ok(id) = job_rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let tree = repo.load_tree(&id);
                    if item_tx.send(TreeItem { id, tree }).is_err() {
                        break;
                    }
                }
            });
        }
        drop(item_tx);

        let mut pending = 0usize;
        for root in roots {
            if root.is_null() || seen(root) {
                continue;
            }
            job_tx.send(*root).expect("job channel open");
            pending += 1;
        }

        let run = (|| -> Result<()> {
            while pending > 0 {
                cancel.check()?;
                let item = item_rx
                    .recv()
                    .map_err(|_| SiloError::Other("tree stream workers exited early".into()))?;
                pending -= 1;

                if let Ok(tree) = &item.tree {
                    for node in &tree.nodes {
                        if node.node_type != NodeType::Dir {
                            continue;
                        }
                        let Some(subtree) = node.subtree else {
                            continue;
                        };
                        if subtree.is_null() || seen(&subtree) {
                            continue;
                        }
                        job_tx.send(subtree).expect("job channel open");
                        pending += 1;
                    }
                }

                visit(item)?;
            }
            Ok(())
        })();

        if run.is_err() {
            cancel.cancel();
        }
        drop(job_tx);
        run
    })
}
