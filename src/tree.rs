//! Arena-backed rooted binary time tree.
//!
//! External nodes take indices `0..taxon_count` and internal nodes
//! `taxon_count..2 * taxon_count - 1`. Indices are stable for the lifetime of
//! the tree: topology edits move parent and child links, never nodes.

use crate::{
    error::{GraphError, Result},
    model::{Model, ModelBase, ModelEvent, ModelId, ModelRef},
    traversal,
    variable::{ChangeType, VariableId},
};

pub type NodeIndex = usize;

/// What a tree mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeChangedEvent {
    /// The branch above the node changed length or attachment point.
    Branch(NodeIndex),
    /// The node moved in time, which changes its own branch and the branches
    /// of its children.
    Height(NodeIndex),
    AllInternalHeights,
    Whole,
}

#[derive(Debug, Clone, PartialEq)]
struct Topology {
    parents: Vec<Option<NodeIndex>>,
    children: Vec<Option<[NodeIndex; 2]>>,
    heights: Vec<f64>,
    root: NodeIndex,
}

impl Topology {
    fn copy_from(&mut self, other: &Topology) {
        self.parents.clone_from(&other.parents);
        self.children.clone_from(&other.children);
        self.heights.clone_from(&other.heights);
        self.root = other.root;
    }
}

#[derive(Debug)]
pub struct TreeModel {
    base: ModelBase,
    taxa: Vec<String>,
    live: Topology,
    stored: Topology,
}

impl TreeModel {
    /// Build a tree from parent links and node heights.
    ///
    /// `parents[n]` is `None` for the root only. Internal nodes must have
    /// exactly two children and external nodes none.
    pub fn new(
        name: impl Into<String>,
        taxa: Vec<String>,
        parents: Vec<Option<NodeIndex>>,
        heights: Vec<f64>,
    ) -> Result<TreeModel> {
        let taxon_count = taxa.len();
        if taxon_count < 2 {
            return Err(GraphError::InvalidTree(format!(
                "need at least two taxa, got {}",
                taxon_count
            )));
        }
        let node_count = 2 * taxon_count - 1;
        if parents.len() != node_count || heights.len() != node_count {
            return Err(GraphError::InvalidTree(format!(
                "{} taxa need {} nodes, got {} parents and {} heights",
                taxon_count,
                node_count,
                parents.len(),
                heights.len()
            )));
        }

        let mut root = None;
        let mut slots: Vec<Vec<NodeIndex>> = vec![Vec::new(); node_count];
        for (node, parent) in parents.iter().enumerate() {
            match *parent {
                None if root.is_some() => {
                    return Err(GraphError::InvalidTree("more than one root".to_string()))
                }
                None => root = Some(node),
                Some(parent) if parent >= node_count || parent < taxon_count => {
                    return Err(GraphError::InvalidTree(format!(
                        "node {} has parent {} which is not an internal node",
                        node, parent
                    )))
                }
                Some(parent) => slots[parent].push(node),
            }
        }
        let root = root.ok_or_else(|| GraphError::InvalidTree("no root".to_string()))?;
        if root < taxon_count {
            return Err(GraphError::InvalidTree(format!(
                "root {} is an external node",
                root
            )));
        }

        let mut children = Vec::with_capacity(node_count);
        for (node, slot) in slots.into_iter().enumerate() {
            match (node < taxon_count, slot.as_slice()) {
                (true, []) => children.push(None),
                (false, &[left, right]) => children.push(Some([left, right])),
                (_, slot) => {
                    return Err(GraphError::InvalidTree(format!(
                        "node {} has {} children",
                        node,
                        slot.len()
                    )))
                }
            }
        }

        // Every node must reach the root without revisiting a node.
        for start in 0..node_count {
            let mut node = start;
            let mut steps = 0;
            while let Some(parent) = parents[node] {
                node = parent;
                steps += 1;
                if steps > node_count {
                    return Err(GraphError::InvalidTree(format!(
                        "node {} is on a cycle",
                        start
                    )));
                }
            }
        }

        if let Some(node) = heights.iter().position(|height| !height.is_finite()) {
            return Err(GraphError::InvalidTree(format!(
                "node {} has non-finite height",
                node
            )));
        }

        let live = Topology {
            parents,
            children,
            heights,
            root,
        };
        Ok(TreeModel {
            base: ModelBase::new(name),
            taxa,
            stored: live.clone(),
            live,
        })
    }

    pub fn node_count(&self) -> usize {
        self.live.parents.len()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn taxon(&self, node: NodeIndex) -> Option<&str> {
        self.taxa.get(node).map(String::as_str)
    }

    pub fn root(&self) -> NodeIndex {
        self.live.root
    }

    pub fn is_root(&self, node: NodeIndex) -> bool {
        node == self.live.root
    }

    pub fn is_external(&self, node: NodeIndex) -> bool {
        node < self.taxa.len()
    }

    pub fn parent(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.live.parents[node]
    }

    pub fn parents(&self) -> &[Option<NodeIndex>] {
        &self.live.parents
    }

    pub fn children(&self, node: NodeIndex) -> Option<[NodeIndex; 2]> {
        self.live.children[node]
    }

    pub fn sibling(&self, node: NodeIndex) -> Option<NodeIndex> {
        let [left, right] = self.children(self.parent(node)?)?;
        Some(if left == node { right } else { left })
    }

    pub fn height(&self, node: NodeIndex) -> f64 {
        self.live.heights[node]
    }

    pub fn heights(&self) -> &[f64] {
        &self.live.heights
    }

    /// Time between the node and its parent; zero for the root.
    pub fn branch_length(&self, node: NodeIndex) -> f64 {
        match self.parent(node) {
            Some(parent) => self.height(parent) - self.height(node),
            None => 0.0,
        }
    }

    pub fn is_ancestor(&self, ancestor: NodeIndex, node: NodeIndex) -> bool {
        traversal::ancestors(self, node).any(|n| n == ancestor)
    }

    /// Sum of all branch lengths.
    pub fn total_length(&self) -> f64 {
        (0..self.node_count())
            .map(|node| self.branch_length(node))
            .sum()
    }

    pub fn post_order(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.node_count());
        traversal::post_order(self, |node| {
            order.push(node);
            Ok::<(), std::convert::Infallible>(())
        })
        .unwrap_or_else(|never| match never {});
        order
    }

    fn check_node(&self, node: NodeIndex) -> Result<()> {
        if node >= self.node_count() {
            return Err(GraphError::IndexOutOfRange {
                name: self.base.name().to_string(),
                index: node,
                dim: self.node_count(),
            });
        }
        Ok(())
    }

    pub(crate) fn set_height(&mut self, node: NodeIndex, height: f64) -> Result<Vec<ModelEvent>> {
        self.check_node(node)?;
        if !height.is_finite() {
            return Err(GraphError::InvalidTree(format!(
                "non-finite height {} for node {}",
                height, node
            )));
        }
        self.live.heights[node] = height;
        Ok(vec![ModelEvent::Tree(TreeChangedEvent::Height(node))])
    }

    fn set_branch(&mut self, node: NodeIndex, length: f64) -> Result<Vec<ModelEvent>> {
        self.check_node(node)?;
        let parent = self.parent(node).ok_or_else(|| {
            GraphError::InvalidTree(format!("node {} is the root and has no branch", node))
        })?;
        self.set_height(node, self.height(parent) - length)
    }

    fn scale_heights(&mut self, factor: f64) -> Result<Vec<ModelEvent>> {
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(GraphError::InvalidTree(format!(
                "invalid height scale factor {}",
                factor
            )));
        }
        let taxon_count = self.taxon_count();
        for height in self.live.heights[taxon_count..].iter_mut() {
            *height *= factor;
        }
        Ok(vec![ModelEvent::Tree(TreeChangedEvent::AllInternalHeights)])
    }

    fn exchange(&mut self, first: NodeIndex, second: NodeIndex) -> Result<Vec<ModelEvent>> {
        self.check_node(first)?;
        self.check_node(second)?;
        let (Some(first_parent), Some(second_parent)) = (self.parent(first), self.parent(second))
        else {
            return Err(GraphError::InvalidTree(
                "cannot exchange the root".to_string(),
            ));
        };
        if first_parent == second_parent
            || self.is_ancestor(first, second)
            || self.is_ancestor(second, first)
        {
            return Err(GraphError::InvalidTree(format!(
                "nodes {} and {} cannot be exchanged",
                first, second
            )));
        }

        for (parent, old, new) in [(first_parent, first, second), (second_parent, second, first)] {
            if let Some(slots) = self.live.children[parent].as_mut() {
                for slot in slots.iter_mut() {
                    if *slot == old {
                        *slot = new;
                    }
                }
            }
        }
        self.live.parents[first] = Some(second_parent);
        self.live.parents[second] = Some(first_parent);

        Ok(vec![
            ModelEvent::Tree(TreeChangedEvent::Branch(first)),
            ModelEvent::Tree(TreeChangedEvent::Branch(second)),
        ])
    }

    /// Newick string with tip names and branch lengths.
    pub fn to_newick(&self) -> String {
        let mut buf = String::new();
        self.write_subtree(self.root(), &mut buf);
        buf.push(';');
        buf
    }

    fn write_subtree(&self, root: NodeIndex, buf: &mut String) {
        // (node, children already written)
        let mut stack = vec![(root, 0)];
        while let Some((node, written)) = stack.pop() {
            match (self.children(node), written) {
                (Some([left, _]), 0) => {
                    buf.push('(');
                    stack.push((node, 1));
                    stack.push((left, 0));
                    continue;
                }
                (Some([_, right]), 1) => {
                    buf.push(',');
                    stack.push((node, 2));
                    stack.push((right, 0));
                    continue;
                }
                (Some(_), _) => buf.push(')'),
                (None, _) => buf.push_str(&self.taxa[node]),
            }
            if !self.is_root(node) {
                buf.push(':');
                buf.push_str(&self.branch_length(node).to_string());
            }
        }
    }
}

impl Model for TreeModel {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn handle_model_changed(&mut self, source: ModelId, _event: &ModelEvent) -> Result<()> {
        Err(self.base.unknown_model(source))
    }

    fn handle_variable_changed(&mut self, source: VariableId, _change: &ChangeType) -> Result<()> {
        Err(self.base.unknown_variable(source))
    }

    fn store_state(&mut self) {
        self.stored.copy_from(&self.live);
    }

    fn restore_state(&mut self) {
        std::mem::swap(&mut self.live, &mut self.stored);
    }
}

/// Mutations that notify every model depending on the tree.
impl ModelRef<TreeModel> {
    pub fn set_node_height(&self, node: NodeIndex, height: f64) -> Result<()> {
        self.update(|tree| tree.set_height(node, height))
    }

    /// Move `node` so that its branch has the given length.
    pub fn set_branch_length(&self, node: NodeIndex, length: f64) -> Result<()> {
        self.update(|tree| tree.set_branch(node, length))
    }

    /// Multiply every internal node height by `factor`.
    pub fn scale_internal_heights(&self, factor: f64) -> Result<()> {
        self.update(|tree| tree.scale_heights(factor))
    }

    /// Swap the subtrees below `first` and `second` between their parents.
    pub fn exchange_subtrees(&self, first: NodeIndex, second: NodeIndex) -> Result<()> {
        self.update(|tree| tree.exchange(first, second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{checkpoint::CheckpointManager, model::share};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn taxa(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    /// ((A,B),(C,D)) with tips at height 0.
    fn four_taxon() -> Result<TreeModel> {
        TreeModel::new(
            "tree",
            taxa(&["A", "B", "C", "D"]),
            vec![Some(4), Some(4), Some(5), Some(5), Some(6), Some(6), None],
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0],
        )
    }

    #[test]
    fn structure() -> Result<()> {
        let tree = four_taxon()?;
        assert_eq!(tree.node_count(), 7);
        assert_eq!(tree.root(), 6);
        assert_eq!(tree.children(6), Some([4, 5]));
        assert_eq!(tree.sibling(0), Some(1));
        assert_eq!(tree.post_order(), vec![0, 1, 4, 2, 3, 5, 6]);
        assert_abs_diff_eq!(tree.branch_length(4), 2.0);
        assert_abs_diff_eq!(tree.total_length(), 1.0 + 1.0 + 2.0 + 2.0 + 2.0 + 1.0);
        assert!(tree.is_ancestor(6, 0));
        assert!(!tree.is_ancestor(5, 0));
        Ok(())
    }

    #[test]
    fn rejects_malformed_trees() {
        let bad = TreeModel::new(
            "tree",
            taxa(&["A", "B", "C"]),
            vec![Some(3), Some(3), Some(3), None, None],
            vec![0.0; 5],
        );
        assert!(matches!(bad, Err(GraphError::InvalidTree(_))));

        let cyclic = TreeModel::new(
            "tree",
            taxa(&["A", "B", "C"]),
            vec![Some(3), Some(3), Some(4), Some(4), Some(3)],
            vec![0.0; 5],
        );
        assert!(matches!(cyclic, Err(GraphError::InvalidTree(_))));
    }

    #[test]
    fn exchange_keeps_indices() -> Result<()> {
        let tree = share(four_taxon()?)?;
        tree.exchange_subtrees(1, 2)?;
        let tree = tree.borrow()?;
        assert_eq!(tree.parent(1), Some(5));
        assert_eq!(tree.parent(2), Some(4));
        assert_eq!(tree.children(4), Some([0, 2]));
        assert_eq!(tree.children(5), Some([1, 3]));
        Ok(())
    }

    #[test]
    fn exchange_rejects_ancestors() -> Result<()> {
        let tree = share(four_taxon()?)?;
        assert!(matches!(
            tree.exchange_subtrees(0, 4),
            Err(GraphError::InvalidTree(_))
        ));
        assert!(matches!(
            tree.exchange_subtrees(0, 1),
            Err(GraphError::InvalidTree(_))
        ));
        assert!(matches!(
            tree.exchange_subtrees(6, 1),
            Err(GraphError::InvalidTree(_))
        ));
        Ok(())
    }

    #[test]
    fn restore_undoes_topology_and_heights() -> Result<()> {
        let tree = share(four_taxon()?)?;
        let before = tree.borrow()?.to_newick();
        let mut checkpoint = CheckpointManager::new();
        checkpoint.add_root(&tree);

        checkpoint.store_state()?;
        tree.exchange_subtrees(0, 3)?;
        tree.set_branch_length(1, 0.25)?;
        tree.scale_internal_heights(2.0)?;
        assert_ne!(tree.borrow()?.to_newick(), before);

        checkpoint.restore_state()?;
        assert_eq!(tree.borrow()?.to_newick(), before);
        Ok(())
    }

    #[test]
    fn root_has_no_branch() -> Result<()> {
        let tree = share(four_taxon()?)?;
        assert!(matches!(
            tree.set_branch_length(6, 1.0),
            Err(GraphError::InvalidTree(_))
        ));
        assert!(matches!(
            tree.set_node_height(9, 1.0),
            Err(GraphError::IndexOutOfRange { .. })
        ));
        Ok(())
    }
}
