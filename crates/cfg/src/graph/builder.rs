//! Flow graph builder.

use super::{FlowGraph, Node, NodeId, NodeKind};
use smallvec::SmallVec;

/// A builder for constructing [`FlowGraph`]s block by block.
///
/// The builder keeps an append cursor on the open block. Begin markers are
/// allocated detached with [`create_begin`](Self::create_begin) and friends,
/// wired up by the terminator that jumps to them, and opened for appending
/// with [`switch_to`](Self::switch_to). Terminators close the open block.
pub struct GraphBuilder {
    /// The graph being built.
    graph: FlowGraph,
    /// The last node of the open block, if any.
    current: Option<NodeId>,
}

impl GraphBuilder {
    /// Creates a new builder with the entry block open.
    #[must_use]
    pub fn new() -> Self {
        let graph = FlowGraph::new();
        let current = Some(graph.entry);
        Self { graph, current }
    }

    /// Returns the entry begin marker.
    #[must_use]
    pub fn entry(&self) -> NodeId {
        self.graph.entry
    }

    /// Returns a reference to the graph built so far.
    #[must_use]
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Creates a detached plain block entry.
    pub fn create_begin(&mut self) -> NodeId {
        self.graph.push(Node { kind: NodeKind::Begin, next: None })
    }

    /// Creates a detached loop header carrying the loop's average iteration
    /// count per entry.
    pub fn create_loop_begin(&mut self, frequency: f64) -> NodeId {
        self.graph.push(Node { kind: NodeKind::LoopBegin { frequency }, next: None })
    }

    /// Creates a detached exit marker for the loop headed by `header`.
    pub fn create_loop_exit(&mut self, header: NodeId) -> NodeId {
        self.graph.push(Node { kind: NodeKind::LoopExit { header }, next: None })
    }

    /// Moves the append cursor to the block opened by `begin`.
    ///
    /// Panics if the block is already closed by a terminator or a
    /// fall-through boundary.
    pub fn switch_to(&mut self, begin: NodeId) {
        assert!(
            self.graph[begin].kind.is_begin_marker(),
            "cannot switch to {begin}: not a begin marker"
        );
        let mut tail = begin;
        while let Some(next) = self.graph[tail].next {
            assert!(
                !self.graph[next].kind.is_begin_marker(),
                "block at {begin} already falls through to {next}"
            );
            tail = next;
        }
        assert!(!self.graph[tail].kind.is_terminator(), "block at {begin} is already terminated");
        self.current = Some(tail);
    }

    fn append(&mut self, kind: NodeKind) -> NodeId {
        let tail = self.current.expect("no open block; switch_to a begin marker first");
        let closes = kind.is_terminator();
        let id = self.graph.push(Node { kind, next: None });
        self.graph.nodes[tail].next = Some(id);
        self.current = if closes { None } else { Some(id) };
        id
    }

    /// Appends a straight-line operation to the open block.
    pub fn op(&mut self) -> NodeId {
        self.append(NodeKind::Op)
    }

    /// Closes the open block with an unconditional jump to `target`.
    pub fn jump(&mut self, target: NodeId) -> NodeId {
        self.append(NodeKind::End { target })
    }

    /// Closes the open block with a loop-closing jump back to `header`.
    pub fn loop_end(&mut self, header: NodeId) -> NodeId {
        self.append(NodeKind::LoopEnd { header })
    }

    /// Closes the open block with a two-way split.
    ///
    /// `probability` is the chance of taking `then_target`; `else_target`
    /// gets the complement.
    pub fn branch(&mut self, probability: f64, then_target: NodeId, else_target: NodeId) -> NodeId {
        self.split([(then_target, probability), (else_target, 1.0 - probability)])
    }

    /// Closes the open block with an n-way split over `(target, probability)`
    /// arms, in arm order.
    pub fn split(&mut self, arms: impl IntoIterator<Item = (NodeId, f64)>) -> NodeId {
        let mut targets = SmallVec::new();
        let mut probabilities = SmallVec::new();
        for (target, probability) in arms {
            targets.push(target);
            probabilities.push(probability);
        }
        self.append(NodeKind::Split { targets, probabilities })
    }

    /// Closes the open block with a control sink.
    pub fn ret(&mut self) -> NodeId {
        self.append(NodeKind::Return)
    }

    /// Closes the open block by falling straight through into `begin`.
    pub fn fall_through(&mut self, begin: NodeId) {
        assert!(
            self.graph[begin].kind.is_begin_marker(),
            "cannot fall through to {begin}: not a begin marker"
        );
        let tail = self.current.take().expect("no open block; switch_to a begin marker first");
        self.graph.nodes[tail].next = Some(begin);
    }

    /// Consumes the builder and returns the finished graph.
    ///
    /// The graph is not validated here; [`FlowGraph::validate`] and the block
    /// construction that consumes it report malformed inputs.
    #[must_use]
    pub fn finish(self) -> FlowGraph {
        self.graph
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_chain() {
        let mut builder = GraphBuilder::new();
        let op1 = builder.op();
        let op2 = builder.op();
        let ret = builder.ret();
        let graph = builder.finish();

        assert_eq!(graph.validate(), Ok(()));
        assert_eq!(graph[graph.entry].next, Some(op1));
        assert_eq!(graph[op1].next, Some(op2));
        assert_eq!(graph[op2].next, Some(ret));
        assert_eq!(graph[ret].next, None);
    }

    #[test]
    fn diamond_is_well_formed() {
        let mut builder = GraphBuilder::new();
        let (t, e) = (builder.create_begin(), builder.create_begin());
        builder.branch(0.7, t, e);
        let merge = builder.create_begin();
        builder.switch_to(t);
        builder.jump(merge);
        builder.switch_to(e);
        builder.jump(merge);
        builder.switch_to(merge);
        builder.ret();
        let graph = builder.finish();

        assert_eq!(graph.validate(), Ok(()));
        let split = graph[graph.entry].next.unwrap();
        let NodeKind::Split { targets, probabilities } = &graph[split].kind else {
            panic!("entry does not end in a split")
        };
        assert_eq!(targets.as_slice(), &[t, e]);
        assert_eq!(probabilities.as_slice(), &[0.7, 1.0 - 0.7]);
    }

    #[test]
    fn fall_through_marks_a_block_boundary() {
        let mut builder = GraphBuilder::new();
        builder.op();
        let next = builder.create_begin();
        builder.fall_through(next);
        builder.switch_to(next);
        let ret = builder.ret();
        let graph = builder.finish();

        assert_eq!(graph.validate(), Ok(()));
        let op = graph[graph.entry].next.unwrap();
        assert_eq!(graph[op].next, Some(next));
        assert_eq!(graph.successor_begins(op).as_slice(), &[next]);
        assert_eq!(graph[next].next, Some(ret));
    }

    #[test]
    fn loop_with_exit_is_well_formed() {
        let mut builder = GraphBuilder::new();
        let header = builder.create_loop_begin(8.0);
        builder.jump(header);
        builder.switch_to(header);
        let exit = builder.create_loop_exit(header);
        let body = builder.create_begin();
        builder.split([(body, 0.875), (exit, 0.125)]);
        builder.switch_to(body);
        builder.loop_end(header);
        builder.switch_to(exit);
        builder.ret();
        let graph = builder.finish();

        assert_eq!(graph.validate(), Ok(()));
        assert_eq!(graph[exit].kind, NodeKind::LoopExit { header });
    }

    #[test]
    #[should_panic = "already terminated"]
    fn switching_to_a_closed_block_panics() {
        let mut builder = GraphBuilder::new();
        builder.ret();
        builder.switch_to(builder.entry());
    }
}
