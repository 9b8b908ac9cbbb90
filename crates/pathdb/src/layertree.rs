//! The indexed collection of all live layers.

use crate::difflayer::DiffLayer;
use crate::disklayer::DiskLayer;
use crate::error::{PathDbError, PathDbResult};
use crate::nodes::NodeSet;
use crate::states::StateSetWithOrigin;
use crate::types::Hash;
use crate::Layer;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

struct TreeInner {
    disk: Arc<DiskLayer>,
    diffs: HashMap<Hash, Arc<DiffLayer>>,
}

/// Maps root hashes to live layers and enforces the structural
/// invariants: a single disk layer at the bottom, diff layers forming
/// a tree above it, flattened on demand by [`LayerTree::cap`].
pub struct LayerTree {
    inner: RwLock<TreeInner>,
}

impl LayerTree {
    /// Build a tree around the given disk layer.
    pub(crate) fn new(disk: Arc<DiskLayer>) -> Self {
        Self {
            inner: RwLock::new(TreeInner {
                disk,
                diffs: HashMap::new(),
            }),
        }
    }

    /// Replace the whole tree with a single disk layer.
    pub(crate) fn init(&self, disk: Arc<DiskLayer>) {
        let mut inner = self.inner.write();
        inner.disk = disk;
        inner.diffs.clear();
    }

    /// The disk layer at the bottom of the tree.
    pub fn bottom(&self) -> Arc<DiskLayer> {
        Arc::clone(&self.inner.read().disk)
    }

    /// Look up the layer with the given root.
    pub fn get(&self, root: Hash) -> Option<Layer> {
        let inner = self.inner.read();
        if inner.disk.root() == root {
            return Some(Layer::Disk(Arc::clone(&inner.disk)));
        }
        inner.diffs.get(&root).map(|d| Layer::Diff(Arc::clone(d)))
    }

    /// Number of live layers, the disk layer included.
    pub fn len(&self) -> usize {
        self.inner.read().diffs.len() + 1
    }

    /// Whether only the disk layer is live.
    pub fn is_empty(&self) -> bool {
        self.inner.read().diffs.is_empty()
    }

    /// Run the closure over every live layer.
    pub fn for_each(&self, mut f: impl FnMut(&Layer)) {
        let inner = self.inner.read();
        f(&Layer::Disk(Arc::clone(&inner.disk)));
        for diff in inner.diffs.values() {
            f(&Layer::Diff(Arc::clone(diff)));
        }
    }

    /// The chain of layers from the given root down to the disk layer.
    pub fn descend(&self, root: Hash) -> Option<Vec<Layer>> {
        let mut chain = Vec::new();
        let mut layer = self.get(root)?;
        loop {
            match layer {
                Layer::Diff(diff) => {
                    let parent = diff.parent();
                    chain.push(Layer::Diff(diff));
                    layer = parent;
                }
                Layer::Disk(disk) => {
                    chain.push(Layer::Disk(disk));
                    return Some(chain);
                }
            }
        }
    }

    /// Stack a new diff layer on an existing parent.
    pub(crate) fn add(
        &self,
        root: Hash,
        parent_root: Hash,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> PathDbResult<()> {
        if root == parent_root {
            return Err(PathDbError::Cycle(root));
        }
        // Already known layers are accepted silently: identical state
        // can be committed by different blocks.
        if self.get(root).is_some() {
            return Ok(());
        }
        let parent = self
            .get(parent_root)
            .ok_or(PathDbError::UnknownRoot(parent_root))?;
        if let Layer::Disk(disk) = &parent {
            if disk.is_stale() {
                return Err(PathDbError::Stale);
            }
        }
        let diff = parent.update(root, block, nodes, states);
        self.inner.write().diffs.insert(root, diff);
        Ok(())
    }

    /// Insert a rehydrated diff layer without structural checks.
    pub(crate) fn add_loaded(&self, diff: Arc<DiffLayer>) {
        self.inner.write().diffs.insert(diff.root(), diff);
    }

    /// Flatten the diff stack below `root` until at most
    /// `allowed_depth` diff layers remain above the disk layer. With a
    /// zero depth the whole chain is committed and flushed through.
    pub(crate) fn cap(&self, root: Hash, allowed_depth: usize) -> PathDbResult<()> {
        let mut inner = self.inner.write();
        let head = match inner.diffs.get(&root) {
            Some(diff) => Arc::clone(diff),
            None if inner.disk.root() == root => return Ok(()), // already flat
            None => return Err(PathDbError::UnknownRoot(root)),
        };
        // Full commitment: merge everything below the head into the
        // disk layer and drop all in-memory layers, forks included.
        if allowed_depth == 0 {
            let base = Self::persist(&Layer::Diff(head), true)?;
            inner.diffs.clear();
            inner.disk = base;
            return Ok(());
        }
        // Walk up the chain to find the lowest diff allowed to remain.
        let mut diff = head;
        for _ in 0..allowed_depth - 1 {
            match diff.parent() {
                Layer::Diff(parent) => diff = parent,
                // The stack is already shallow enough.
                Layer::Disk(_) => return Ok(()),
            }
        }
        let parent = match diff.parent() {
            Layer::Disk(_) => return Ok(()),
            Layer::Diff(parent) => parent,
        };
        let base = Self::persist(&Layer::Diff(parent), false)?;
        diff.set_parent(Layer::Disk(Arc::clone(&base)));
        inner.disk = Arc::clone(&base);

        // Drop the committed chain and every subtree orphaned by it.
        // Survivors are exactly the strict descendants of the new disk
        // root; their direct children are re-anchored on it.
        let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();
        for (child_root, child) in &inner.diffs {
            children
                .entry(child.parent().root())
                .or_default()
                .push(*child_root);
        }
        let mut retained = HashSet::new();
        let mut queue = vec![base.root()];
        while let Some(parent_root) = queue.pop() {
            for child_root in children.remove(&parent_root).unwrap_or_default() {
                if child_root == base.root() {
                    continue; // the committed layer itself
                }
                if parent_root == base.root() {
                    if let Some(child) = inner.diffs.get(&child_root) {
                        child.set_parent(Layer::Disk(Arc::clone(&base)));
                    }
                }
                retained.insert(child_root);
                queue.push(child_root);
            }
        }
        let before = inner.diffs.len();
        inner.diffs.retain(|root, _| retained.contains(root));
        debug!(
            flattened = before - inner.diffs.len(),
            remaining = inner.diffs.len(),
            "Capped layer tree"
        );
        Ok(())
    }

    /// Commit the given layer and all of its ancestors into the disk
    /// layer, bottom-most first, returning the final disk layer.
    fn persist(layer: &Layer, force: bool) -> PathDbResult<Arc<DiskLayer>> {
        match layer {
            Layer::Diff(diff) => {
                let parent = diff.parent();
                let base = match &parent {
                    Layer::Disk(disk) => Arc::clone(disk),
                    Layer::Diff(_) => {
                        let base = Self::persist(&parent, force)?;
                        diff.set_parent(Layer::Disk(Arc::clone(&base)));
                        base
                    }
                };
                base.commit(diff, force)
            }
            Layer::Disk(disk) => Ok(Arc::clone(disk)),
        }
    }
}
