//! Newick input for rooted binary time trees.
//!
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' subtree ',' subtree ')' label | label
//! label    = name? (':' length)?
//! ```
//!
//! Node heights are derived from root-to-tip distances, so the tip furthest
//! from the root ends up at height zero.

use std::collections::HashSet;

use crate::{
    error::{GraphError, Result},
    tree::{NodeIndex, TreeModel},
};

/// Parse a Newick string into a [`TreeModel`].
pub fn parse_newick(name: impl Into<String>, input: &str) -> Result<TreeModel> {
    let mut parser = Parser::new(input.as_bytes());
    let nodes = parser.parse_tree()?;
    build(name.into(), nodes)
}

impl TreeModel {
    pub fn from_newick(name: impl Into<String>, input: &str) -> Result<TreeModel> {
        parse_newick(name, input)
    }
}

#[derive(Debug, Default)]
struct RawNode {
    parent: Option<usize>,
    children: Vec<usize>,
    name: Option<String>,
    length: Option<f64>,
}

fn build(name: String, nodes: Vec<RawNode>) -> Result<TreeModel> {
    // Raw nodes are allocated parent-first, so depths fill in one pass.
    let mut depths = vec![0.0; nodes.len()];
    for (raw, node) in nodes.iter().enumerate() {
        if let Some(parent) = node.parent {
            let length = node.length.unwrap_or(0.0);
            if !(length >= 0.0) {
                return Err(GraphError::InvalidTree(format!(
                    "negative branch length {}",
                    length
                )));
            }
            depths[raw] = depths[parent] + length;
        }
    }
    let max_depth = depths.iter().copied().fold(0.0, f64::max);

    // Tips keep their order of appearance; internal nodes follow in post-order.
    let mut index = vec![0; nodes.len()];
    let mut taxa = Vec::new();
    let mut seen = HashSet::new();
    for (raw, node) in nodes.iter().enumerate() {
        match node.children.len() {
            0 => {
                let taxon = node
                    .name
                    .clone()
                    .ok_or_else(|| GraphError::InvalidTree("unnamed tip".to_string()))?;
                if !seen.insert(taxon.clone()) {
                    return Err(GraphError::InvalidTree(format!(
                        "duplicate taxon `{}`",
                        taxon
                    )));
                }
                index[raw] = taxa.len();
                taxa.push(taxon);
            }
            2 => {}
            count => {
                return Err(GraphError::InvalidTree(format!(
                    "node with {} children; only binary trees are supported",
                    count
                )))
            }
        }
    }
    let mut next = taxa.len();
    for raw in raw_post_order(&nodes) {
        if !nodes[raw].children.is_empty() {
            index[raw] = next;
            next += 1;
        }
    }

    let node_count = nodes.len();
    let mut parents: Vec<Option<NodeIndex>> = vec![None; node_count];
    let mut heights = vec![0.0; node_count];
    for (raw, node) in nodes.iter().enumerate() {
        parents[index[raw]] = node.parent.map(|parent| index[parent]);
        heights[index[raw]] = max_depth - depths[raw];
    }
    TreeModel::new(name, taxa, parents, heights)
}

fn raw_post_order(nodes: &[RawNode]) -> Vec<usize> {
    let mut order = Vec::with_capacity(nodes.len());
    let mut stack = vec![(0, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        stack.push((node, true));
        for &child in nodes[node].children.iter().rev() {
            stack.push((child, false));
        }
    }
    order
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn error(&self, message: &str) -> GraphError {
        GraphError::InvalidTree(format!("{} at byte {} of Newick string", message, self.pos))
    }

    fn parse_tree(&mut self) -> Result<Vec<RawNode>> {
        self.skip_whitespace();
        self.parse_subtree()?;
        self.skip_whitespace();
        if self.peek() != Some(b';') {
            return Err(self.error("expected ';'"));
        }
        self.pos += 1;
        Ok(std::mem::take(&mut self.nodes))
    }

    /// Parse one subtree with an explicit stack of open parentheses, so the
    /// nesting depth is bounded by memory rather than the call stack.
    fn parse_subtree(&mut self) -> Result<()> {
        let mut open: Vec<usize> = Vec::new();
        loop {
            self.skip_whitespace();
            let id = self.nodes.len();
            self.nodes.push(RawNode {
                parent: open.last().copied(),
                ..Default::default()
            });
            if self.peek() == Some(b'(') {
                self.pos += 1;
                open.push(id);
                continue;
            }

            let mut finished = id;
            loop {
                self.parse_label(finished)?;
                let Some(&parent) = open.last() else {
                    return Ok(());
                };
                self.nodes[parent].children.push(finished);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => {
                        self.pos += 1;
                        break;
                    }
                    Some(b')') => {
                        self.pos += 1;
                        open.pop();
                        finished = parent;
                    }
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }
    }

    fn parse_label(&mut self, id: usize) -> Result<()> {
        self.skip_whitespace();
        let name = self.take_while(|byte| {
            !matches!(
                byte,
                b':' | b',' | b')' | b'(' | b';' | b' ' | b'\t' | b'\n' | b'\r'
            )
        });
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_whitespace();
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            let number = self.take_while(|byte| {
                matches!(byte, b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E')
            });
            let length: f64 = number
                .parse()
                .map_err(|_| self.error(&format!("invalid branch length '{}'", number)))?;
            self.nodes[id].length = Some(length);
        }
        Ok(())
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|byte| byte.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}
