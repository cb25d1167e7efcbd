use crate::tree::NodeIndex;

/// Freshness of a cached per-node computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Every cached value and the aggregate are current.
    Known,
    /// The nodes in the dirty list (an upward-closed set) are stale.
    PartiallyDirty,
    /// Every node is stale.
    FullyDirty,
}

/// Which nodes must be recomputed on the next evaluation.
///
/// `FullyDirty` is a sentinel: the per-node flags are not touched when it is
/// entered, and [`DirtyTracker::is_dirty`] answers `true` for every node.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyTracker {
    state: DirtyState,
    update_node: Vec<bool>,
    dirty: Vec<NodeIndex>,
}

impl DirtyTracker {
    /// A tracker for a fresh cache; nothing has been computed yet.
    pub fn new(node_count: usize) -> DirtyTracker {
        DirtyTracker {
            state: DirtyState::FullyDirty,
            update_node: vec![false; node_count],
            dirty: Vec::new(),
        }
    }

    pub fn state(&self) -> DirtyState {
        self.state
    }

    pub fn node_count(&self) -> usize {
        self.update_node.len()
    }

    pub fn is_dirty(&self, node: NodeIndex) -> bool {
        match self.state {
            DirtyState::FullyDirty => true,
            _ => self.update_node[node],
        }
    }

    /// Nodes marked individually, in marking order. Empty under the sentinel.
    pub fn dirty_nodes(&self) -> &[NodeIndex] {
        &self.dirty
    }

    /// Mark `node` and every ancestor given by `parent`. Nodes already marked
    /// are skipped. Returns the number of newly marked nodes.
    pub fn mark_path<F>(&mut self, node: NodeIndex, mut parent: F) -> usize
    where
        F: FnMut(NodeIndex) -> Option<NodeIndex>,
    {
        if self.state == DirtyState::FullyDirty {
            return 0;
        }
        let mut marked = 0;
        let mut current = Some(node);
        while let Some(node) = current {
            if !self.update_node[node] {
                self.update_node[node] = true;
                self.dirty.push(node);
                marked += 1;
            }
            current = parent(node);
        }
        if marked > 0 {
            self.state = DirtyState::PartiallyDirty;
        }
        marked
    }

    pub fn mark_all(&mut self) {
        self.state = DirtyState::FullyDirty;
    }

    /// Return to `Known` after a successful evaluation.
    pub fn clear(&mut self) {
        for &node in self.dirty.iter() {
            self.update_node[node] = false;
        }
        self.dirty.clear();
        self.state = DirtyState::Known;
    }

    pub(crate) fn copy_from(&mut self, other: &DirtyTracker) {
        self.state = other.state;
        self.update_node.clone_from(&other.update_node);
        self.dirty.clone_from(&other.dirty);
    }
}
