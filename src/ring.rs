//! Consistent hash ring with virtual nodes.

use crate::hash::ring_token;
use crate::node::{NodeId, NodeTable};

#[derive(Debug, Default)]
pub struct Ring {
    /// `(token, node)` pairs, sorted by token; ties broken by insertion
    /// order via a stable sort.
    tokens: Vec<(u128, NodeId)>,
    virtual_nodes: usize,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the ring from scratch for the node table's currently
    /// included replicas, `virtual_nodes` tokens per physical node.
    pub fn rebuild(&mut self, nodes: &NodeTable, virtual_nodes: usize) {
        self.virtual_nodes = virtual_nodes;
        self.tokens.clear();
        for id in nodes.included_replicas() {
            let name = nodes.name(id);
            for i in 0..virtual_nodes {
                let token = ring_token(&format!("{name}:{i}"));
                self.tokens.push((token, id));
            }
        }
        self.tokens.sort_by_key(|(token, _)| *token);
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    fn bisect_right(&self, value: u128) -> usize {
        self.tokens.partition_point(|(token, _)| *token <= value)
    }

    /// Walk clockwise from the first token strictly greater than
    /// `hash(key)`, gathering the first `count` distinct nodes not in
    /// `avoid` (the primary preference list) and, separately, the distinct
    /// `avoid` members stepped over before `count` primaries were found
    /// (the avoided list, in order of first encounter). The walk makes at
    /// most one full revolution.
    pub fn find_nodes(&self, key: &str, count: usize, avoid: &[NodeId]) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut primary = Vec::new();
        let mut avoided = Vec::new();
        if self.tokens.is_empty() || count == 0 {
            return (primary, avoided);
        }
        let n = self.tokens.len();
        let start = self.bisect_right(ring_token(key));
        for step in 0..n {
            let (_, node) = self.tokens[(start + step) % n];
            if avoid.contains(&node) {
                if !avoided.contains(&node) {
                    avoided.push(node);
                }
            } else if !primary.contains(&node) {
                primary.push(node);
                if primary.len() >= count {
                    break;
                }
            }
        }
        (primary, avoided)
    }

    /// Debug helper for inspecting token distribution in tests; not
    /// load-bearing for protocol correctness.
    pub fn describe(&self, nodes: &NodeTable) -> String {
        self.tokens
            .iter()
            .map(|(token, id)| format!("({token:032x}, {})", nodes.name(*id)))
            .collect::<Vec<_>>()
            .join(",")
    }
}
