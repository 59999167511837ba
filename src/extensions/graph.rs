//! Ordering graph over extension groups.
//!
//! Each registration contributes `before`/`after` edges, normalized here to
//! one direction: an edge `a -> b` means group `a` must run before group
//! `b`. The graph either yields a total order consistent with every edge or
//! reports the exact cycle as an ordered path with the first repeated node
//! closing the loop.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::token::TokenId;

/// Directed graph over extension group identifiers.
#[derive(Default)]
pub struct GroupGraph {
    nodes: Vec<TokenId>,
    present: HashSet<TokenId>,
    succs: HashMap<TokenId, Vec<TokenId>>,
}

impl GroupGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node; a group with no edges is still a valid singleton group
    /// and appears in the order.
    pub fn add_node(&mut self, node: TokenId) {
        if self.present.insert(node) {
            self.nodes.push(node);
        }
    }

    /// Adds a predecessor → successor edge. Duplicate edges are idempotent;
    /// a self-edge is recorded and reported as a one-node cycle.
    pub fn add_edge(&mut self, pred: TokenId, succ: TokenId) {
        self.add_node(pred);
        self.add_node(succ);
        let succs = self.succs.entry(pred).or_default();
        if !succs.contains(&succ) {
            succs.push(succ);
        }
    }

    /// Direct predecessors of `node`: the groups that must run before it.
    pub fn predecessors(&self, node: TokenId) -> Vec<TokenId> {
        self.nodes
            .iter()
            .copied()
            .filter(|n| {
                self.succs
                    .get(n)
                    .map_or(false, |succs| succs.contains(&node))
            })
            .collect()
    }

    /// Searches for a cycle, returning its exact path (first node repeated
    /// at the end) or `None`.
    pub fn find_cycle(&self) -> Option<Vec<TokenId>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();
        for &node in &self.nodes {
            if !visited.contains(&node) {
                if let Some(cycle) =
                    self.dfs_cycle(node, &mut visited, &mut on_stack, &mut path)
                {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: TokenId,
        visited: &mut HashSet<TokenId>,
        on_stack: &mut HashSet<TokenId>,
        path: &mut Vec<TokenId>,
    ) -> Option<Vec<TokenId>> {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        if let Some(succs) = self.succs.get(&node) {
            for &succ in succs {
                if on_stack.contains(&succ) {
                    // Close the loop at the first occurrence of the
                    // revisited node.
                    let start = path.iter().position(|&n| n == succ).expect("on stack");
                    let mut cycle = path[start..].to_vec();
                    cycle.push(succ);
                    return Some(cycle);
                }
                if !visited.contains(&succ) {
                    if let Some(cycle) = self.dfs_cycle(succ, visited, on_stack, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        on_stack.remove(&node);
        path.pop();
        None
    }

    /// Computes a total order consistent with every edge: predecessors
    /// first. `Err` carries the exact cycle path.
    pub fn topo_order(&self) -> Result<Vec<TokenId>, Vec<TokenId>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(cycle);
        }

        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(self.nodes.len());
        for &node in &self.nodes {
            if !visited.contains(&node) {
                self.dfs_post_order(node, &mut visited, &mut out);
            }
        }
        // Post-order pushes a node after all of its successors; reversing
        // puts predecessors first.
        out.reverse();
        debug!(groups = out.len(), "extension group order computed");
        Ok(out)
    }

    fn dfs_post_order(
        &self,
        node: TokenId,
        visited: &mut HashSet<TokenId>,
        out: &mut Vec<TokenId>,
    ) {
        visited.insert(node);
        if let Some(succs) = self.succs.get(&node) {
            for &succ in succs {
                if !visited.contains(&succ) {
                    self.dfs_post_order(succ, visited, out);
                }
            }
        }
        out.push(node);
    }
}
