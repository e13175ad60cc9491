//! Basic-block analyses over a [`FlowGraph`]: block identification in reverse
//! postorder, edge wiring, relative execution frequencies, dominator and
//! postdominator trees, and natural-loop detection.

use crate::graph::{FlowGraph, GraphError, NodeId, NodeKind};
use index_vec::{index_vec, IndexVec};
use smallvec::SmallVec;
use std::{fmt, ops::Index};

mod display;
pub use display::dot;

mod loops;
pub use loops::{Loop, LoopForest, LoopId};

mod verify;
pub use verify::verify;

index_vec::define_index_type! {
    /// A unique identifier for a basic block in a [`ControlFlowGraph`].
    ///
    /// Block ids are reverse-postorder positions: every non-loop-closing edge
    /// goes from a smaller id to a strictly larger one.
    pub struct BlockId = u32;
    DEBUG_FORMAT = "B{}";
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.index())
    }
}

/// Smallest relative frequency a block can be assigned, 2⁻⁵⁰⁰.
///
/// Frequencies are clamped into
/// [`MIN_RELATIVE_FREQUENCY`, `MAX_RELATIVE_FREQUENCY`] so that products over
/// deeply nested loops and improbable branches stay finite, non-zero, and
/// well-ordered.
pub const MIN_RELATIVE_FREQUENCY: f64 = 3.054936363499605e-151;

/// Largest relative frequency a block can be assigned, 2⁵⁰⁰.
pub const MAX_RELATIVE_FREQUENCY: f64 = 1.0 / MIN_RELATIVE_FREQUENCY;

/// A basic block: a maximal straight-line chain of flow-graph nodes.
#[derive(Clone, Debug)]
pub struct Block {
    /// The begin marker opening this block.
    pub begin: NodeId,
    /// The last node of this block: a terminator, or a node whose `next`
    /// falls through into another block.
    pub end: NodeId,
    /// Predecessor blocks: forward predecessors in ascending id order, then
    /// loop-closing predecessors in ascending id order.
    pub predecessors: SmallVec<[BlockId; 2]>,
    /// Successor blocks in edge order.
    pub successors: SmallVec<[BlockId; 2]>,
    /// Relative execution frequency, `1.0` for the entry.
    pub frequency: f64,
    /// The immediate dominator; `None` for the entry.
    pub dominator: Option<BlockId>,
    /// Blocks immediately dominated by this one, in ascending id order.
    pub dominated: Vec<BlockId>,
    /// Distance from the entry in the dominator tree.
    pub dominator_depth: u32,
    /// The immediate postdominator on forward edges, if any.
    pub postdominator: Option<BlockId>,
    /// The innermost loop containing this block, if any.
    pub loop_id: Option<LoopId>,
    // Preorder interval in the dominator tree; `dominates` is a range check.
    dominator_number: u32,
    max_child_dominator_number: u32,
}

impl Block {
    fn new(begin: NodeId, end: NodeId) -> Self {
        Self {
            begin,
            end,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            frequency: 1.0,
            dominator: None,
            dominated: Vec::new(),
            dominator_depth: 0,
            postdominator: None,
            loop_id: None,
            dominator_number: u32::MAX,
            max_child_dominator_number: u32::MAX,
        }
    }
}

/// The analyzed control-flow graph: reachable basic blocks in reverse
/// postorder, their edges, and the analyses requested at construction.
///
/// Unreachable nodes are dropped; [`ControlFlowGraph::block_for`] returns
/// `None` for them.
pub struct ControlFlowGraph<'g> {
    /// The underlying flow graph.
    pub graph: &'g FlowGraph,
    /// All reachable blocks; the entry is block 0.
    pub blocks: IndexVec<BlockId, Block>,
    /// The natural loops, outer loops first. Empty unless loop detection ran.
    pub loops: LoopForest,
    node_to_block: IndexVec<NodeId, Option<BlockId>>,
    max_dominator_depth: u32,
}

/// Configures which analyses a [`ControlFlowGraph`] computes.
///
/// Block identification and edge wiring always run; everything else is off
/// by default.
#[must_use]
#[derive(Clone, Copy, Debug)]
pub struct CfgBuilder<'g> {
    graph: &'g FlowGraph,
    frequencies: bool,
    loops: bool,
    dominators: bool,
    postdominators: bool,
}

impl<'g> CfgBuilder<'g> {
    /// Toggles relative execution frequencies.
    pub fn frequencies(mut self, enable: bool) -> Self {
        self.frequencies = enable;
        self
    }

    /// Toggles natural-loop detection.
    pub fn loops(mut self, enable: bool) -> Self {
        self.loops = enable;
        self
    }

    /// Toggles the dominator tree and its query ranges.
    pub fn dominators(mut self, enable: bool) -> Self {
        self.dominators = enable;
        self
    }

    /// Toggles postdominator links.
    pub fn postdominators(mut self, enable: bool) -> Self {
        self.postdominators = enable;
        self
    }

    /// Validates the graph and runs the configured analyses.
    pub fn build(self) -> Result<ControlFlowGraph<'g>, GraphError> {
        let Self { graph, frequencies, loops, dominators, postdominators } = self;
        graph.validate()?;
        let mut cfg = ControlFlowGraph {
            graph,
            blocks: IndexVec::new(),
            loops: LoopForest::default(),
            node_to_block: IndexVec::new(),
            max_dominator_depth: 0,
        };
        cfg.identify_blocks()?;
        cfg.connect_edges()?;
        if frequencies {
            cfg.compute_frequencies();
        }
        if loops {
            loops::compute(&mut cfg)?;
        }
        if dominators {
            cfg.compute_dominators();
        }
        if postdominators {
            cfg.compute_postdominators();
        }
        debug_assert!(verify(&cfg));
        Ok(cfg)
    }
}

impl<'g> ControlFlowGraph<'g> {
    /// Computes the control-flow graph with every analysis enabled.
    pub fn compute(graph: &'g FlowGraph) -> Result<Self, GraphError> {
        Self::builder(graph)
            .frequencies(true)
            .loops(true)
            .dominators(true)
            .postdominators(true)
            .build()
    }

    /// Returns a builder computing only the analyses switched on.
    pub fn builder(graph: &'g FlowGraph) -> CfgBuilder<'g> {
        CfgBuilder {
            graph,
            frequencies: false,
            loops: false,
            dominators: false,
            postdominators: false,
        }
    }

    /// Returns the entry block's id.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        BlockId::from_usize(0)
    }

    /// Returns the block containing `node`, or `None` if `node` is
    /// unreachable.
    #[must_use]
    pub fn block_for(&self, node: NodeId) -> Option<BlockId> {
        self.node_to_block[node]
    }

    /// Returns true if `block` starts at a loop header.
    #[must_use]
    pub fn is_loop_header(&self, block: BlockId) -> bool {
        matches!(self.graph[self.blocks[block].begin].kind, NodeKind::LoopBegin { .. })
    }

    /// Returns true if `block` ends in a loop-closing jump.
    #[must_use]
    pub fn is_loop_end(&self, block: BlockId) -> bool {
        matches!(self.graph[self.blocks[block].end].kind, NodeKind::LoopEnd { .. })
    }

    /// Returns the loop nesting depth of `block`; 0 outside any loop.
    #[must_use]
    pub fn loop_depth(&self, block: BlockId) -> u32 {
        self.blocks[block].loop_id.map_or(0, |l| self.loops[l].depth)
    }

    /// Returns the probability of the `from` → `to` edge: the matching split
    /// arm's probability, or `1.0` for unconditional transfers.
    ///
    /// Panics if `from` ends in a split and `to` is not one of its targets.
    #[must_use]
    pub fn edge_probability(&self, from: BlockId, to: BlockId) -> f64 {
        match &self.graph[self.blocks[from].end].kind {
            NodeKind::Split { targets, probabilities } => {
                let begin = self.blocks[to].begin;
                let arm = targets
                    .iter()
                    .position(|&t| t == begin)
                    .expect("`to` is not a split successor of `from`");
                probabilities[arm]
            }
            _ => 1.0,
        }
    }

    /// Returns true if `a` dominates `b`: every path from the entry to `b`
    /// passes through `a`. Every block dominates itself.
    #[must_use]
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let a = &self.blocks[a];
        let b = &self.blocks[b];
        debug_assert!(a.dominator_number != u32::MAX, "dominator tree not computed");
        a.dominator_number <= b.dominator_number
            && b.dominator_number <= a.max_child_dominator_number
    }

    /// Returns true if `a` dominates `b` and `a != b`.
    #[must_use]
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Returns the deepest block dominating both `a` and `b`.
    #[must_use]
    pub fn common_dominator(&self, a: BlockId, b: BlockId) -> BlockId {
        let (mut a, mut b) = (a, b);
        while a != b {
            while a > b {
                a = self.blocks[a].dominator.expect("dominator not computed");
            }
            while b > a {
                b = self.blocks[b].dominator.expect("dominator not computed");
            }
        }
        a
    }

    /// Returns the depth of the deepest dominator-tree leaf.
    #[must_use]
    pub fn max_dominator_depth(&self) -> u32 {
        self.max_dominator_depth
    }

    /// Walks every reachable chain once, assigning reverse-postorder block
    /// ids. The entry becomes block 0.
    #[instrument(level = "debug", skip_all)]
    fn identify_blocks(&mut self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Visit {
            New,
            Pending,
            Done,
        }

        // Walks the straight-line chain from `begin` to the node ending its
        // block, claiming interior nodes so shared tails are caught.
        fn walk_chain(
            graph: &FlowGraph,
            begin: NodeId,
            claimed: &mut IndexVec<NodeId, bool>,
        ) -> Result<NodeId, GraphError> {
            let mut node = begin;
            loop {
                if graph[node].kind.is_terminator() {
                    return Ok(node);
                }
                let next = graph[node].next.expect("non-terminator without next");
                if graph[next].kind.is_begin_marker() {
                    return Ok(node);
                }
                if claimed[next] {
                    return Err(GraphError::ChainShared { node: next });
                }
                claimed[next] = true;
                node = next;
            }
        }

        let graph = self.graph;
        let mut state = index_vec![Visit::New; graph.len()];
        let mut claimed = index_vec![false; graph.len()];
        let mut chain_end = index_vec![None::<NodeId>; graph.len()];
        let mut postorder = Vec::new();
        let mut stack = vec![graph.entry];

        while let Some(&begin) = stack.last() {
            match state[begin] {
                Visit::New => {
                    state[begin] = Visit::Pending;
                    let end = walk_chain(graph, begin, &mut claimed)?;
                    chain_end[begin] = Some(end);
                    // Reversed so the first edge is explored first.
                    for &succ in graph.successor_begins(end).iter().rev() {
                        if state[succ] == Visit::New {
                            stack.push(succ);
                        }
                    }
                }
                Visit::Pending => {
                    state[begin] = Visit::Done;
                    postorder.push(begin);
                    stack.pop();
                }
                Visit::Done => {
                    stack.pop();
                }
            }
        }

        self.node_to_block = index_vec![None; graph.len()];
        self.blocks = IndexVec::with_capacity(postorder.len());
        for &begin in postorder.iter().rev() {
            let end = chain_end[begin].expect("visited chain without an end");
            let id = self.blocks.push(Block::new(begin, end));
            let mut node = begin;
            loop {
                self.node_to_block[node] = Some(id);
                if node == end {
                    break;
                }
                node = graph[node].next.expect("non-terminator without next");
            }
        }
        debug_assert_eq!(self.node_to_block[graph.entry], Some(self.entry()));
        debug!(blocks = self.blocks.len(), nodes = graph.len(), "identified blocks");
        Ok(())
    }

    /// Wires block edges and checks the rules that need reachability: edge
    /// direction, dedicated split targets, single-predecessor exits, and
    /// closed loop headers.
    #[instrument(level = "debug", skip_all)]
    fn connect_edges(&mut self) -> Result<(), GraphError> {
        let mut back_edges = Vec::new();
        for i in 0..self.blocks.len() {
            let b = BlockId::from_usize(i);
            let end = self.blocks[b].end;
            let closes_loop = matches!(self.graph[end].kind, NodeKind::LoopEnd { .. });
            let mut successors = SmallVec::new();
            for target in self.graph.successor_begins(end) {
                let t = self.node_to_block[target].expect("reachable successor without a block");
                successors.push(t);
                if closes_loop {
                    // A loop end jumping ahead of its header means the header
                    // was never entered through a forward edge.
                    if t > b {
                        return Err(GraphError::MissingLoopEntry { header: target });
                    }
                    back_edges.push((b, t));
                } else {
                    if t <= b {
                        return Err(GraphError::IrregularLoop {
                            node: self.blocks[b].begin,
                            target,
                        });
                    }
                    self.blocks[t].predecessors.push(b);
                }
            }
            self.blocks[b].successors = successors;
        }
        // Loop-closing predecessors go after all forward ones.
        for (b, t) in back_edges {
            self.blocks[t].predecessors.push(b);
        }

        for i in 0..self.blocks.len() {
            let b = BlockId::from_usize(i);
            let block = &self.blocks[b];
            if let NodeKind::Split { targets, .. } = &self.graph[block.end].kind {
                for &target in targets {
                    let arm = self.node_to_block[target].expect("split target without a block");
                    let count = self.blocks[arm].predecessors.len();
                    if count != 1 {
                        return Err(GraphError::SplitTargetShared { target, count });
                    }
                }
            }
            match self.graph[block.begin].kind {
                NodeKind::LoopExit { .. } => {
                    let count = block.predecessors.len();
                    if count != 1 {
                        return Err(GraphError::ExitPredecessors { node: block.begin, count });
                    }
                }
                NodeKind::LoopBegin { .. } => {
                    let closed = block.predecessors.iter().any(|&p| {
                        matches!(self.graph[self.blocks[p].end].kind, NodeKind::LoopEnd { .. })
                    });
                    if !closed {
                        return Err(GraphError::MissingLoopEnd { header: block.begin });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Propagates relative frequencies along forward edges in block order.
    ///
    /// A block's frequency is the probability-weighted sum over its forward
    /// predecessors; blocks with none (the entry) start at `1.0`. Loop
    /// headers are additionally scaled by their iteration count.
    #[instrument(level = "debug", skip_all)]
    fn compute_frequencies(&mut self) {
        for i in 0..self.blocks.len() {
            let b = BlockId::from_usize(i);
            let predecessors = self.blocks[b].predecessors.clone();
            let mut frequency = 0.0;
            let mut entered = false;
            for &p in &predecessors {
                if self.is_loop_end(p) {
                    continue;
                }
                entered = true;
                frequency += self.blocks[p].frequency * self.edge_probability(p, b);
            }
            if !entered {
                frequency = 1.0;
            }
            if let NodeKind::LoopBegin { frequency: iterations } =
                self.graph[self.blocks[b].begin].kind
            {
                frequency *= iterations;
            }
            self.blocks[b].frequency =
                frequency.clamp(MIN_RELATIVE_FREQUENCY, MAX_RELATIVE_FREQUENCY);
        }
    }

    /// Builds the dominator tree in one ascending pass: each block's
    /// immediate dominator is the meet over its forward predecessors, all of
    /// which are already placed.
    #[instrument(level = "debug", skip_all)]
    fn compute_dominators(&mut self) {
        for i in 1..self.blocks.len() {
            let b = BlockId::from_usize(i);
            let predecessors = self.blocks[b].predecessors.clone();
            let mut dominator: Option<BlockId> = None;
            for &p in &predecessors {
                if self.is_loop_end(p) {
                    continue;
                }
                dominator = Some(match dominator {
                    None => p,
                    Some(d) => self.common_dominator(d, p),
                });
            }
            let dominator = dominator.expect("non-entry block without forward predecessor");
            self.blocks[b].dominator = Some(dominator);
            self.blocks[dominator].dominated.push(b);
            let depth = self.blocks[dominator].dominator_depth + 1;
            self.blocks[b].dominator_depth = depth;
            self.max_dominator_depth = self.max_dominator_depth.max(depth);
        }
        self.compute_dominator_ranges();
    }

    /// Numbers the dominator tree in preorder so [`Self::dominates`] becomes
    /// an interval check: `a` dominates `b` iff `b`'s number falls within
    /// `a`'s subtree range.
    fn compute_dominator_ranges(&mut self) {
        let mut number = 0u32;
        let mut stack = vec![(self.entry(), false)];
        while let Some((b, expanded)) = stack.pop() {
            if expanded {
                let own = self.blocks[b].dominator_number;
                let max = self.blocks[b]
                    .dominated
                    .iter()
                    .map(|&c| self.blocks[c].max_child_dominator_number)
                    .max()
                    .unwrap_or(own);
                self.blocks[b].max_child_dominator_number = max;
            } else {
                self.blocks[b].dominator_number = number;
                number += 1;
                stack.push((b, true));
                for &c in self.blocks[b].dominated.iter().rev() {
                    stack.push((c, false));
                }
            }
        }
    }

    /// Links each block to its immediate postdominator on forward edges, in
    /// one descending pass. Loop-closing blocks and blocks whose paths split
    /// without rejoining keep `None`.
    #[instrument(level = "debug", skip_all)]
    fn compute_postdominators(&mut self) {
        for i in (0..self.blocks.len()).rev() {
            let b = BlockId::from_usize(i);
            if self.is_loop_end(b) {
                continue;
            }
            let successors = self.blocks[b].successors.clone();
            let postdominator = match successors.as_slice() {
                [] => None,
                [s] => Some(*s),
                [first, rest @ ..] => {
                    let mut pd = Some(*first);
                    for &s in rest {
                        let Some(d) = pd else { break };
                        pd = self.common_postdominator(d, s);
                    }
                    if let Some(d) = pd {
                        debug_assert!(
                            !successors.contains(&d),
                            "postdominator of a split cannot be one of its arms"
                        );
                    }
                    pd
                }
            };
            self.blocks[b].postdominator = postdominator;
        }
    }

    fn common_postdominator(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let (mut a, mut b) = (a, b);
        while a != b {
            while a < b {
                a = self.blocks[a].postdominator?;
            }
            while b < a {
                b = self.blocks[b].postdominator?;
            }
        }
        Some(a)
    }
}

impl Index<BlockId> for ControlFlowGraph<'_> {
    type Output = Block;

    fn index(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }
}

impl fmt::Debug for ControlFlowGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlFlowGraph")
            .field("blocks", &self.blocks)
            .field("loops", &self.loops)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Node};

    fn diamond(probability: f64) -> (FlowGraph, NodeId, NodeId, NodeId, NodeId) {
        let mut builder = GraphBuilder::new();
        let entry = builder.entry();
        let (t, e) = (builder.create_begin(), builder.create_begin());
        builder.op();
        builder.branch(probability, t, e);
        let merge = builder.create_begin();
        builder.switch_to(t);
        builder.jump(merge);
        builder.switch_to(e);
        builder.jump(merge);
        builder.switch_to(merge);
        builder.ret();
        (builder.finish(), entry, t, e, merge)
    }

    #[test]
    fn diamond_blocks_and_edges() {
        let (graph, entry, t, e, merge) = diamond(0.5);
        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        assert_eq!(cfg.blocks.len(), 4);

        let b0 = cfg.block_for(entry).unwrap();
        let bt = cfg.block_for(t).unwrap();
        let be = cfg.block_for(e).unwrap();
        let bm = cfg.block_for(merge).unwrap();
        assert_eq!(b0, cfg.entry());

        // Successors keep edge order; predecessors are ascending.
        assert_eq!(cfg[b0].successors.as_slice(), &[bt, be]);
        assert_eq!(cfg[bm].predecessors.as_slice(), &[be.min(bt), be.max(bt)]);
        assert!(cfg[bm].successors.is_empty());

        // Interior op nodes map to their containing block.
        let op = graph[entry].next.unwrap();
        assert_eq!(cfg.block_for(op), Some(b0));

        // Forward edges strictly increase block ids.
        for (b, block) in cfg.blocks.iter_enumerated() {
            for &s in &block.successors {
                assert!(s > b);
            }
        }
    }

    #[test]
    fn diamond_frequencies() {
        let (graph, entry, t, e, merge) = diamond(0.25);
        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        assert_eq!(cfg[cfg.block_for(entry).unwrap()].frequency, 1.0);
        assert_eq!(cfg[cfg.block_for(t).unwrap()].frequency, 0.25);
        assert_eq!(cfg[cfg.block_for(e).unwrap()].frequency, 0.75);
        assert_eq!(cfg[cfg.block_for(merge).unwrap()].frequency, 1.0);

        let b0 = cfg.block_for(entry).unwrap();
        assert_eq!(cfg.edge_probability(b0, cfg.block_for(t).unwrap()), 0.25);
        assert_eq!(cfg.edge_probability(b0, cfg.block_for(e).unwrap()), 0.75);
    }

    #[test]
    fn diamond_dominators() {
        let (graph, entry, t, e, merge) = diamond(0.5);
        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        let b0 = cfg.block_for(entry).unwrap();
        let bt = cfg.block_for(t).unwrap();
        let be = cfg.block_for(e).unwrap();
        let bm = cfg.block_for(merge).unwrap();

        assert_eq!(cfg[b0].dominator, None);
        assert_eq!(cfg[bt].dominator, Some(b0));
        assert_eq!(cfg[be].dominator, Some(b0));
        assert_eq!(cfg[bm].dominator, Some(b0));
        assert_eq!(cfg[b0].dominated, vec![be.min(bt), be.max(bt), bm]);
        assert_eq!(cfg.max_dominator_depth(), 1);

        assert!(cfg.dominates(b0, bm));
        assert!(cfg.dominates(bm, bm));
        assert!(!cfg.strictly_dominates(bm, bm));
        assert!(!cfg.dominates(bt, bm));
        assert_eq!(cfg.common_dominator(bt, be), b0);

        // Both arms rejoin, so the merge postdominates the branch.
        assert_eq!(cfg[b0].postdominator, Some(bm));
        assert_eq!(cfg[bt].postdominator, Some(bm));
        assert_eq!(cfg[bm].postdominator, None);
    }

    #[test]
    fn dominates_agrees_with_dominator_links() {
        // Two nested diamonds give a dominator tree three levels deep.
        let mut builder = GraphBuilder::new();
        let (a, b) = (builder.create_begin(), builder.create_begin());
        builder.branch(0.5, a, b);
        let (c, d) = (builder.create_begin(), builder.create_begin());
        builder.switch_to(a);
        builder.branch(0.5, c, d);
        let inner = builder.create_begin();
        builder.switch_to(c);
        builder.jump(inner);
        builder.switch_to(d);
        builder.jump(inner);
        let merge = builder.create_begin();
        builder.switch_to(inner);
        builder.jump(merge);
        builder.switch_to(b);
        builder.jump(merge);
        builder.switch_to(merge);
        builder.ret();
        let graph = builder.finish();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();

        for (a, _) in cfg.blocks.iter_enumerated() {
            for (b, _) in cfg.blocks.iter_enumerated() {
                let mut walked = false;
                let mut at = Some(b);
                while let Some(block) = at {
                    if block == a {
                        walked = true;
                        break;
                    }
                    at = cfg[block].dominator;
                }
                assert_eq!(cfg.dominates(a, b), walked, "dominates({a}, {b})");
            }
        }
    }

    #[test]
    fn loop_blocks_and_frequencies() {
        let mut builder = GraphBuilder::new();
        let header = builder.create_loop_begin(4.0);
        builder.jump(header);
        builder.switch_to(header);
        builder.op();
        let exit = builder.create_loop_exit(header);
        let body = builder.create_begin();
        builder.split([(body, 0.75), (exit, 0.25)]);
        builder.switch_to(body);
        builder.loop_end(header);
        builder.switch_to(exit);
        builder.ret();
        let graph = builder.finish();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();

        let bh = cfg.block_for(header).unwrap();
        let bb = cfg.block_for(body).unwrap();
        let bx = cfg.block_for(exit).unwrap();
        assert!(cfg.is_loop_header(bh));
        assert!(cfg.is_loop_end(bb));
        assert!(!cfg.is_loop_header(bb));

        // Forward predecessor first, loop-closing one appended.
        assert_eq!(cfg[bh].predecessors.as_slice(), &[cfg.entry(), bb]);

        assert_eq!(cfg[bh].frequency, 4.0);
        assert_eq!(cfg[bb].frequency, 3.0);
        assert_eq!(cfg[bx].frequency, 1.0);

        // The loop-closing block has no forward path out.
        assert_eq!(cfg[bb].postdominator, None);
        assert_eq!(cfg[cfg.entry()].postdominator, Some(bh));
        assert_eq!(cfg.loop_depth(bh), 1);
        assert_eq!(cfg.loop_depth(bx), 0);
    }

    #[test]
    fn entry_loop_header_keeps_base_frequency() {
        let mut builder = GraphBuilder::new();
        let entry = builder.entry();
        let exit = builder.create_loop_exit(entry);
        let body = builder.create_begin();
        builder.split([(body, 0.75), (exit, 0.25)]);
        builder.switch_to(body);
        builder.loop_end(entry);
        builder.switch_to(exit);
        builder.ret();
        let mut graph = builder.finish();
        graph.nodes[entry].kind = NodeKind::LoopBegin { frequency: 3.0 };

        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        assert_eq!(cfg[cfg.entry()].frequency, 3.0);
        assert_eq!(cfg[cfg.block_for(body).unwrap()].frequency, 2.25);
        assert_eq!(cfg[cfg.block_for(exit).unwrap()].frequency, 0.75);
    }

    #[test]
    fn frequency_is_clamped() {
        let mut builder = GraphBuilder::new();
        let header = builder.create_loop_begin(1e308);
        builder.jump(header);
        builder.switch_to(header);
        let exit = builder.create_loop_exit(header);
        let (cold, body) = (builder.create_begin(), builder.create_begin());
        builder.split([(cold, 0.0), (body, 1.0)]);
        builder.switch_to(cold);
        builder.fall_through(exit);
        builder.switch_to(body);
        builder.loop_end(header);
        builder.switch_to(exit);
        builder.ret();
        let graph = builder.finish();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();

        assert_eq!(cfg[cfg.block_for(header).unwrap()].frequency, MAX_RELATIVE_FREQUENCY);
        assert_eq!(cfg[cfg.block_for(cold).unwrap()].frequency, MIN_RELATIVE_FREQUENCY);
    }

    #[test]
    fn unreachable_code_is_dropped() {
        let (mut graph, ..) = diamond(0.5);
        let orphan = graph.push(Node { kind: NodeKind::Begin, next: None });
        let ret = graph.push(Node { kind: NodeKind::Return, next: None });
        graph.nodes[orphan].next = Some(ret);

        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(cfg.block_for(orphan), None);
        assert_eq!(cfg.block_for(ret), None);
    }

    #[test]
    fn shared_chain_is_rejected() {
        let mut graph = FlowGraph::new();
        let op = graph.push(Node { kind: NodeKind::Op, next: None });
        let second = graph.push(Node { kind: NodeKind::Begin, next: Some(op) });
        graph.nodes[graph.entry].next = Some(op);
        graph.nodes[op].next = Some(second);

        let err = ControlFlowGraph::compute(&graph).unwrap_err();
        assert_eq!(err, GraphError::ChainShared { node: op });
    }

    #[test]
    fn irregular_back_edge_is_rejected() {
        let mut builder = GraphBuilder::new();
        let m = builder.create_begin();
        builder.jump(m);
        builder.switch_to(m);
        builder.op();
        builder.jump(m);
        let graph = builder.finish();

        let err = ControlFlowGraph::compute(&graph).unwrap_err();
        assert_eq!(err, GraphError::IrregularLoop { node: m, target: m });
    }

    #[test]
    fn loop_without_end_is_rejected() {
        let mut builder = GraphBuilder::new();
        let header = builder.create_loop_begin(2.0);
        builder.jump(header);
        builder.switch_to(header);
        builder.ret();
        let graph = builder.finish();

        let err = ControlFlowGraph::compute(&graph).unwrap_err();
        assert_eq!(err, GraphError::MissingLoopEnd { header });
    }

    #[test]
    fn loop_entered_through_its_end_is_rejected() {
        let mut builder = GraphBuilder::new();
        let header = builder.create_loop_begin(2.0);
        builder.loop_end(header);
        builder.switch_to(header);
        builder.ret();
        let graph = builder.finish();

        let err = ControlFlowGraph::compute(&graph).unwrap_err();
        assert_eq!(err, GraphError::MissingLoopEntry { header });
    }

    #[test]
    fn shared_split_target_is_rejected() {
        let mut builder = GraphBuilder::new();
        let (p, q) = (builder.create_begin(), builder.create_begin());
        builder.split([(p, 0.5), (q, 0.5)]);
        builder.switch_to(p);
        builder.jump(q);
        builder.switch_to(q);
        builder.ret();
        let graph = builder.finish();

        let err = ControlFlowGraph::compute(&graph).unwrap_err();
        assert_eq!(err, GraphError::SplitTargetShared { target: q, count: 2 });
    }

    #[test]
    fn shared_loop_exit_is_rejected() {
        let mut builder = GraphBuilder::new();
        let header = builder.create_loop_begin(2.0);
        builder.jump(header);
        builder.switch_to(header);
        let exit = builder.create_loop_exit(header);
        let (x, y, z) = (builder.create_begin(), builder.create_begin(), builder.create_begin());
        builder.split([(x, 0.5), (y, 0.25), (z, 0.25)]);
        builder.switch_to(x);
        builder.fall_through(exit);
        builder.switch_to(y);
        builder.fall_through(exit);
        builder.switch_to(z);
        builder.loop_end(header);
        builder.switch_to(exit);
        builder.ret();
        let graph = builder.finish();

        let err = ControlFlowGraph::compute(&graph).unwrap_err();
        assert_eq!(err, GraphError::ExitPredecessors { node: exit, count: 2 });
    }

    #[test]
    fn linear_chain_postdominators() {
        let mut builder = GraphBuilder::new();
        let a = builder.create_begin();
        builder.jump(a);
        builder.switch_to(a);
        let b = builder.create_begin();
        builder.jump(b);
        builder.switch_to(b);
        builder.ret();
        let graph = builder.finish();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();

        let ba = cfg.block_for(a).unwrap();
        let bb = cfg.block_for(b).unwrap();
        assert_eq!(cfg[cfg.entry()].postdominator, Some(ba));
        assert_eq!(cfg[ba].postdominator, Some(bb));
        assert_eq!(cfg[bb].postdominator, None);
    }

    #[test]
    fn analyses_are_opt_in() {
        let (graph, entry, t, ..) = diamond(0.25);
        let cfg = ControlFlowGraph::builder(&graph).frequencies(true).build().unwrap();

        assert_eq!(cfg[cfg.block_for(t).unwrap()].frequency, 0.25);
        assert!(cfg.loops.is_empty());
        assert_eq!(cfg[cfg.block_for(entry).unwrap()].postdominator, None);
        for (_, block) in cfg.blocks.iter_enumerated() {
            assert_eq!(block.dominator, None);
        }
    }
}
