//! Tree walks shared by every model that visits nodes.
//!
//! All walks are iterative, so caterpillar trees with thousands of taxa do
//! not exhaust the stack.

use crate::tree::{NodeIndex, TreeModel};

/// Post-order walk from the root that only enters nodes for which `enter`
/// holds. A node that is skipped hides its whole subtree.
///
/// Children are visited left before right, so a pruned walk visits its nodes
/// in the same relative order as the unpruned one.
pub fn post_order_where<E, P, A>(tree: &TreeModel, mut enter: P, mut action: A) -> Result<(), E>
where
    P: FnMut(NodeIndex) -> bool,
    A: FnMut(NodeIndex) -> Result<(), E>,
{
    let root = tree.root();
    if !enter(root) {
        return Ok(());
    }
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            action(node)?;
            continue;
        }
        stack.push((node, true));
        if let Some([left, right]) = tree.children(node) {
            if enter(right) {
                stack.push((right, false));
            }
            if enter(left) {
                stack.push((left, false));
            }
        }
    }
    Ok(())
}

pub fn post_order<E, A>(tree: &TreeModel, action: A) -> Result<(), E>
where
    A: FnMut(NodeIndex) -> Result<(), E>,
{
    post_order_where(tree, |_| true, action)
}

/// Pre-order walk over every branch, carrying a value from parent to child.
///
/// `action(parent, child, state)` receives the state produced for the
/// parent's own branch (or `root_state` below the root) and returns the state
/// handed down to the child's children.
pub fn walk_branches<S, E, A>(tree: &TreeModel, root_state: S, mut action: A) -> Result<(), E>
where
    S: Copy,
    A: FnMut(NodeIndex, NodeIndex, S) -> Result<S, E>,
{
    let root = tree.root();
    let mut stack = Vec::new();
    if let Some([left, right]) = tree.children(root) {
        stack.push((root, right, root_state));
        stack.push((root, left, root_state));
    }
    while let Some((parent, child, state)) = stack.pop() {
        let state = action(parent, child, state)?;
        if let Some([left, right]) = tree.children(child) {
            stack.push((child, right, state));
            stack.push((child, left, state));
        }
    }
    Ok(())
}

/// Iterator over the proper ancestors of a node, nearest first.
pub struct Ancestors<'a> {
    tree: &'a TreeModel,
    current: Option<NodeIndex>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<NodeIndex> {
        let node = self.tree.parent(self.current?);
        self.current = node;
        node
    }
}

pub fn ancestors(tree: &TreeModel, node: NodeIndex) -> Ancestors<'_> {
    Ancestors {
        tree,
        current: Some(node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick::parse_newick;
    use pretty_assertions::assert_eq;
    use std::convert::Infallible;

    #[test]
    fn pruned_order_is_a_subsequence() -> crate::Result<()> {
        let tree = parse_newick("tree", "(((A:1,B:1):1,C:2):1,(D:1.5,E:1.5):1.5);")?;
        let full = tree.post_order();

        // Only the path from B to the root is entered.
        let path: Vec<_> = std::iter::once(1).chain(ancestors(&tree, 1)).collect();
        let mut visited = Vec::new();
        post_order_where(
            &tree,
            |node| path.contains(&node),
            |node| {
                visited.push(node);
                Ok::<_, Infallible>(())
            },
        )
        .unwrap_or_else(|never| match never {});

        let expected: Vec<_> = full.into_iter().filter(|node| path.contains(node)).collect();
        assert_eq!(visited, expected);
        assert_eq!(visited.len(), 4);
        Ok(())
    }

    #[test]
    fn branches_carry_depth() -> crate::Result<()> {
        let tree = parse_newick("tree", "((A:1,B:1):1,C:2);")?;
        let mut depths = vec![0; tree.node_count()];
        walk_branches(&tree, 0usize, |_, child, depth| {
            depths[child] = depth + 1;
            Ok::<_, Infallible>(depth + 1)
        })
        .unwrap_or_else(|never| match never {});
        let a = tree.taxa().iter().position(|t| t == "A").unwrap_or(0);
        let c = tree.taxa().iter().position(|t| t == "C").unwrap_or(0);
        assert_eq!(depths[a], 2);
        assert_eq!(depths[c], 1);
        assert_eq!(depths[tree.root()], 0);
        Ok(())
    }
}
