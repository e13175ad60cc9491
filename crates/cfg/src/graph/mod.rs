//! Input flow graph of begin/end control markers.
//!
//! A [`FlowGraph`] is the raw control-flow input consumed by
//! [`ControlFlowGraph::compute`](crate::cfg::ControlFlowGraph::compute): an arena
//! of marker nodes chained through [`Node::next`]. Begin markers
//! ([`Begin`](NodeKind::Begin), [`LoopBegin`](NodeKind::LoopBegin),
//! [`LoopExit`](NodeKind::LoopExit)) open basic blocks; terminators
//! ([`End`](NodeKind::End), [`LoopEnd`](NodeKind::LoopEnd),
//! [`Split`](NodeKind::Split), [`Return`](NodeKind::Return)) close them.
//!
//! Loops are explicit: a loop is entered through a forward jump to its
//! `LoopBegin`, closed by `LoopEnd` jumps back to it, and left through
//! `LoopExit` markers tied to it. A path that leaves a loop without passing
//! through one of the loop's exit markers must sink in a `Return`; such escapes
//! are absorbed into the loop during loop detection.

use smallvec::SmallVec;
use std::{fmt, ops::Index};

mod builder;
pub use builder::GraphBuilder;

mod display;
pub use display::dot;

index_vec::define_index_type! {
    /// A unique identifier for a node in a [`FlowGraph`].
    pub struct NodeId = u32;
    DEBUG_FORMAT = "n{}";
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.index())
    }
}

/// A marker node in the flow graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// What this node does.
    pub kind: NodeKind,
    /// The straight-line successor. `None` for terminators, `Some` for every
    /// other kind; a `next` pointing at a begin marker is a block boundary.
    pub next: Option<NodeId>,
}

/// The kind of a flow-graph node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// Plain block entry; also the target of forward [`End`](Self::End) jumps.
    Begin,
    /// Loop-header entry. Carries the profile-derived average iteration count
    /// of the loop (finite, ≥ 1).
    LoopBegin {
        /// Average number of iterations per loop entry.
        frequency: f64,
    },
    /// Structured exit marker for the loop headed by `header`. Starts its own
    /// block with exactly one predecessor.
    LoopExit {
        /// The `LoopBegin` node of the loop being left.
        header: NodeId,
    },
    /// Straight-line operation with no control-flow effect.
    Op,
    /// Unconditional jump to a begin marker.
    End {
        /// The jump target; must be a `Begin` or `LoopBegin`.
        target: NodeId,
    },
    /// Loop-closing jump back to `header`.
    LoopEnd {
        /// The `LoopBegin` node of the loop being closed.
        header: NodeId,
    },
    /// N-way control split with per-successor branch probabilities.
    ///
    /// Every target is a dedicated begin marker: it has no other predecessor
    /// edges. Probabilities are finite, ≥ 0, and sum to ≈ 1.
    Split {
        /// The split targets, one block each.
        targets: SmallVec<[NodeId; 2]>,
        /// Branch probability per target, same length as `targets`.
        probabilities: SmallVec<[f64; 2]>,
    },
    /// Control sink; no successors.
    Return,
}

impl NodeKind {
    /// Returns true if this kind opens a basic block.
    #[must_use]
    pub const fn is_begin_marker(&self) -> bool {
        matches!(self, Self::Begin | Self::LoopBegin { .. } | Self::LoopExit { .. })
    }

    /// Returns true if this kind ends a basic block with an explicit transfer.
    #[must_use]
    pub const fn is_terminator(&self) -> bool {
        matches!(self, Self::End { .. } | Self::LoopEnd { .. } | Self::Split { .. } | Self::Return)
    }

    /// Returns the mnemonic for this kind.
    #[must_use]
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::LoopBegin { .. } => "loopbegin",
            Self::LoopExit { .. } => "loopexit",
            Self::Op => "op",
            Self::End { .. } => "end",
            Self::LoopEnd { .. } => "loopend",
            Self::Split { .. } => "split",
            Self::Return => "return",
        }
    }
}

/// An error raised by [`FlowGraph::validate`] for a malformed input graph.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// The entry node does not open a block.
    #[error("entry node {0} is not a begin marker")]
    EntryNotBegin(NodeId),
    /// A terminator carries a straight-line successor.
    #[error("terminator {node} has a straight-line successor")]
    TerminatorWithNext {
        /// The offending terminator.
        node: NodeId,
    },
    /// A non-terminator chain dead-ends without reaching a terminator or a
    /// block boundary.
    #[error("node {node} has no straight-line successor and is not a terminator")]
    DanglingChain {
        /// The node missing its `next`.
        node: NodeId,
    },
    /// A non-begin node is entered by more than one straight-line chain.
    #[error("node {node} is claimed by more than one straight-line chain")]
    ChainShared {
        /// The node claimed twice.
        node: NodeId,
    },
    /// An [`End`](NodeKind::End) jump targets a node that cannot be jumped to.
    #[error("jump at {node} targets {target}, which is not a merge point")]
    JumpToNonBegin {
        /// The jump node.
        node: NodeId,
        /// Its target.
        target: NodeId,
    },
    /// A [`Split`](NodeKind::Split) target is not a dedicated begin marker.
    #[error("split at {node} targets {target}, which cannot start a split successor block")]
    SplitToNonBegin {
        /// The split node.
        node: NodeId,
        /// The offending target.
        target: NodeId,
    },
    /// A split's probability list does not match its target list.
    #[error("split at {node} has {targets} targets but {probabilities} probabilities")]
    ProbabilityCountMismatch {
        /// The split node.
        node: NodeId,
        /// Number of targets.
        targets: usize,
        /// Number of probabilities.
        probabilities: usize,
    },
    /// A branch probability is negative, NaN, or infinite.
    #[error("split at {node} carries invalid branch probability {probability}")]
    InvalidProbability {
        /// The split node.
        node: NodeId,
        /// The offending value.
        probability: f64,
    },
    /// A loop frequency is below one, NaN, or infinite.
    #[error("loop begin {node} carries invalid loop frequency {frequency}")]
    InvalidLoopFrequency {
        /// The loop begin node.
        node: NodeId,
        /// The offending value.
        frequency: f64,
    },
    /// A `LoopEnd` or `LoopExit` references a header that is not a `LoopBegin`.
    #[error("node {node} references {header}, which is not a loop begin")]
    InvalidLoopHeader {
        /// The referencing node.
        node: NodeId,
        /// The claimed header.
        header: NodeId,
    },
    /// A reachable loop header is never closed by a reachable back edge.
    #[error("loop begin {header} has no reachable loop end")]
    MissingLoopEnd {
        /// The loop begin node.
        header: NodeId,
    },
    /// A reachable loop header is reached through one of its loop ends before
    /// any forward entry edge.
    #[error("loop begin {header} has no forward entry edge")]
    MissingLoopEntry {
        /// The loop begin node.
        header: NodeId,
    },
    /// A forward edge flows backwards without closing a loop through a loop
    /// end.
    #[error("edge from {node} re-enters {target} without closing a loop")]
    IrregularLoop {
        /// The source block's begin node.
        node: NodeId,
        /// The re-entered begin node.
        target: NodeId,
    },
    /// A reachable loop exit marker has more than one predecessor block.
    #[error("loop exit {node} has {count} predecessors, expected exactly one")]
    ExitPredecessors {
        /// The loop exit node.
        node: NodeId,
        /// The observed predecessor count.
        count: usize,
    },
    /// A reachable split target is shared with another predecessor.
    #[error("split target {target} has {count} predecessors, expected exactly one")]
    SplitTargetShared {
        /// The shared target node.
        target: NodeId,
        /// The observed predecessor count.
        count: usize,
    },
}

/// The raw control-flow input graph: an arena of marker nodes with a
/// designated entry.
///
/// Node ids index into this graph's arena; passing an id from a different
/// graph panics like any other out-of-range arena access.
#[derive(Clone, Debug)]
pub struct FlowGraph {
    /// All nodes, in allocation order.
    pub nodes: index_vec::IndexVec<NodeId, Node>,
    /// The entry node; always a begin marker in valid graphs.
    pub entry: NodeId,
}

impl FlowGraph {
    /// Creates a new graph holding only the entry begin marker.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = index_vec::IndexVec::new();
        let entry = nodes.push(Node { kind: NodeKind::Begin, next: None });
        Self { nodes, entry }
    }

    /// Allocates a new node.
    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the begin markers of the blocks the block ending at `end`
    /// transfers to, in edge order.
    ///
    /// `end` is a block's last node: a terminator, or a node whose `next` is a
    /// begin marker (fall-through).
    #[must_use]
    pub fn successor_begins(&self, end: NodeId) -> SmallVec<[NodeId; 2]> {
        match &self[end].kind {
            NodeKind::End { target } => smallvec::smallvec![*target],
            NodeKind::LoopEnd { header } => smallvec::smallvec![*header],
            NodeKind::Split { targets, .. } => targets.clone(),
            NodeKind::Return => SmallVec::new(),
            _ => self[end].next.into_iter().collect(),
        }
    }

    /// Checks every node's own shape, failing fast on the first violation.
    ///
    /// Covers the entry kind, the `next` discipline of terminators and
    /// non-terminators, jump and split target kinds, probability arity and
    /// values, loop frequencies, and loop header references. Stands in for the
    /// structural guarantees a typed node hierarchy would give for free.
    /// Reachability-dependent rules (single-predecessor exits, dedicated split
    /// targets, closed loop headers) are checked once blocks are known.
    pub fn validate(&self) -> Result<(), GraphError> {
        if !self[self.entry].kind.is_begin_marker() {
            return Err(GraphError::EntryNotBegin(self.entry));
        }
        for (id, node) in self.nodes.iter_enumerated() {
            if node.kind.is_terminator() {
                if node.next.is_some() {
                    return Err(GraphError::TerminatorWithNext { node: id });
                }
            } else if node.next.is_none() {
                return Err(GraphError::DanglingChain { node: id });
            }
            match &node.kind {
                NodeKind::LoopBegin { frequency } => {
                    if !frequency.is_finite() || *frequency < 1.0 {
                        return Err(GraphError::InvalidLoopFrequency {
                            node: id,
                            frequency: *frequency,
                        });
                    }
                }
                NodeKind::LoopEnd { header } | NodeKind::LoopExit { header } => {
                    if !matches!(self[*header].kind, NodeKind::LoopBegin { .. }) {
                        return Err(GraphError::InvalidLoopHeader { node: id, header: *header });
                    }
                }
                NodeKind::End { target } => {
                    if !matches!(self[*target].kind, NodeKind::Begin | NodeKind::LoopBegin { .. }) {
                        return Err(GraphError::JumpToNonBegin { node: id, target: *target });
                    }
                }
                NodeKind::Split { targets, probabilities } => {
                    if targets.len() != probabilities.len() {
                        return Err(GraphError::ProbabilityCountMismatch {
                            node: id,
                            targets: targets.len(),
                            probabilities: probabilities.len(),
                        });
                    }
                    for &probability in probabilities {
                        if !probability.is_finite() || probability < 0.0 {
                            return Err(GraphError::InvalidProbability { node: id, probability });
                        }
                    }
                    for &target in targets {
                        if !matches!(
                            self[target].kind,
                            NodeKind::Begin | NodeKind::LoopExit { .. }
                        ) {
                            return Err(GraphError::SplitToNonBegin { node: id, target });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for FlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<NodeId> for FlowGraph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_must_open_a_block() {
        let mut graph = FlowGraph::new();
        graph.nodes[graph.entry] = Node { kind: NodeKind::Return, next: None };
        assert_eq!(graph.validate(), Err(GraphError::EntryNotBegin(graph.entry)));
    }

    #[test]
    fn dangling_chain_is_rejected() {
        let graph = FlowGraph::new();
        // The entry begin marker has no `next` yet.
        assert_eq!(graph.validate(), Err(GraphError::DanglingChain { node: graph.entry }));
    }

    #[test]
    fn terminator_with_next_is_rejected() {
        let mut graph = FlowGraph::new();
        let ret = graph.push(Node { kind: NodeKind::Return, next: None });
        graph.nodes[graph.entry].next = Some(ret);
        graph.nodes[ret].next = Some(graph.entry);
        assert_eq!(graph.validate(), Err(GraphError::TerminatorWithNext { node: ret }));
    }

    #[test]
    fn jump_target_must_be_a_merge_point() {
        let mut graph = FlowGraph::new();
        let op = graph.push(Node { kind: NodeKind::Op, next: None });
        let end = graph.push(Node { kind: NodeKind::End { target: op }, next: None });
        graph.nodes[graph.entry].next = Some(end);
        graph.nodes[op].next = Some(end);
        assert_eq!(
            graph.validate(),
            Err(GraphError::JumpToNonBegin { node: end, target: op })
        );
    }

    #[test]
    fn split_probability_arity_must_match() {
        let mut builder = GraphBuilder::new();
        let (a, b) = (builder.create_begin(), builder.create_begin());
        builder.split([(a, 0.5), (b, 0.5)]);
        builder.switch_to(a);
        builder.ret();
        builder.switch_to(b);
        builder.ret();
        let mut graph = builder.finish();
        // Drop one probability behind the builder's back.
        let split = graph
            .nodes
            .iter_enumerated()
            .find_map(|(id, n)| matches!(n.kind, NodeKind::Split { .. }).then_some(id))
            .unwrap();
        if let NodeKind::Split { probabilities, .. } = &mut graph.nodes[split].kind {
            probabilities.pop();
        }
        assert_eq!(
            graph.validate(),
            Err(GraphError::ProbabilityCountMismatch { node: split, targets: 2, probabilities: 1 })
        );
    }

    #[test]
    fn negative_probability_is_rejected() {
        let mut builder = GraphBuilder::new();
        let (a, b) = (builder.create_begin(), builder.create_begin());
        let split = builder.split([(a, -0.25), (b, 1.25)]);
        builder.switch_to(a);
        builder.ret();
        builder.switch_to(b);
        builder.ret();
        let graph = builder.finish();
        assert_eq!(
            graph.validate(),
            Err(GraphError::InvalidProbability { node: split, probability: -0.25 })
        );
    }

    #[test]
    fn loop_frequency_below_one_is_rejected() {
        let mut builder = GraphBuilder::new();
        let header = builder.create_loop_begin(0.5);
        builder.jump(header);
        builder.switch_to(header);
        builder.loop_end(header);
        let graph = builder.finish();
        assert_eq!(
            graph.validate(),
            Err(GraphError::InvalidLoopFrequency { node: header, frequency: 0.5 })
        );
    }

    #[test]
    fn loop_end_header_must_be_a_loop_begin() {
        let mut graph = FlowGraph::new();
        let kind = NodeKind::LoopEnd { header: NodeId::from_raw(0) };
        let end = graph.push(Node { kind, next: None });
        graph.nodes[graph.entry].next = Some(end);
        assert_eq!(
            graph.validate(),
            Err(GraphError::InvalidLoopHeader { node: end, header: graph.entry })
        );
    }

    #[test]
    fn successor_begins_cover_all_terminators() {
        let mut builder = GraphBuilder::new();
        let (t, e) = (builder.create_begin(), builder.create_begin());
        let split = builder.branch(0.5, t, e);
        builder.switch_to(t);
        let ret = builder.ret();
        builder.switch_to(e);
        let merge = builder.create_begin();
        let jump = builder.jump(merge);
        builder.switch_to(merge);
        builder.ret();
        let graph = builder.finish();

        assert_eq!(graph.successor_begins(split).as_slice(), &[t, e]);
        assert_eq!(graph.successor_begins(jump).as_slice(), &[merge]);
        assert!(graph.successor_begins(ret).is_empty());
    }
}
