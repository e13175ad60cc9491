//! Trace formation: partitioning the blocks into linear sequences chained
//! along forward edges, ordered so hot paths stay together.

use crate::cfg::{BlockId, ControlFlowGraph};
use index_vec::{index_vec, IndexVec};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    fmt,
};

index_vec::define_index_type! {
    /// A unique identifier for a trace.
    pub struct TraceId = u32;
    DEBUG_FORMAT = "T{}";
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.index())
    }
}

/// Strategy for growing traces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracePolicy {
    /// Grows traces forward only. Seeds are taken from a frequency-ordered
    /// worklist of blocks whose forward predecessors are all scheduled.
    Unidirectional,
    /// Seeds each trace at the most frequent unscheduled block, grows it
    /// backwards towards the entry, then forwards.
    Bidirectional,
}

/// A scheduled sequence of blocks; consecutive entries are connected by
/// forward edges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    /// The member blocks in schedule order.
    pub blocks: Vec<BlockId>,
}

impl Trace {
    /// Returns the number of blocks in this trace.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the trace holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// An ordered partition of all blocks into traces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceBuilderResult {
    traces: IndexVec<TraceId, Trace>,
    trace_of: IndexVec<BlockId, TraceId>,
    position_of: IndexVec<BlockId, u32>,
}

impl TraceBuilderResult {
    /// All traces, in creation order.
    #[must_use]
    pub fn traces(&self) -> &IndexVec<TraceId, Trace> {
        &self.traces
    }

    /// Returns the trace containing `block`.
    #[must_use]
    pub fn trace_of(&self, block: BlockId) -> TraceId {
        self.trace_of[block]
    }

    /// Returns `block`'s position within its trace.
    #[must_use]
    pub fn position_of(&self, block: BlockId) -> usize {
        self.position_of[block] as usize
    }

    /// Checks that the traces partition every block exactly once and only
    /// chain blocks along forward edges.
    ///
    /// Panics with a descriptive message on the first violation; returns
    /// `true` so it can sit inside a `debug_assert!`.
    pub fn verify(&self, cfg: &ControlFlowGraph<'_>) -> bool {
        assert_eq!(self.trace_of.len(), cfg.blocks.len(), "trace assignment arity mismatch");
        let mut seen = index_vec![false; cfg.blocks.len()];
        for (id, trace) in self.traces.iter_enumerated() {
            assert!(!trace.is_empty(), "{id} is empty");
            for (i, &b) in trace.blocks.iter().enumerate() {
                assert!(!seen[b], "{b} scheduled twice");
                seen[b] = true;
                assert_eq!(self.trace_of(b), id, "{b} trace id mismatch");
                assert_eq!(self.position_of(b), i, "{b} position mismatch");
            }
            for pair in trace.blocks.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                assert!(
                    !cfg.is_loop_end(a) && cfg.blocks[a].successors.contains(&b),
                    "{a} -> {b} is not a forward edge"
                );
            }
        }
        assert!(seen.iter().all(|&s| s), "unscheduled blocks remain");
        true
    }
}

/// Partitions all blocks of `cfg` into traces using `policy`.
#[instrument(level = "debug", skip_all)]
pub fn compute_traces(cfg: &ControlFlowGraph<'_>, policy: TracePolicy) -> TraceBuilderResult {
    let result = match policy {
        TracePolicy::Unidirectional => unidirectional(cfg),
        TracePolicy::Bidirectional => bidirectional(cfg),
    };
    debug!(traces = result.traces.len(), ?policy, "built traces");
    debug_assert!(result.verify(cfg));
    result
}

/// Worklist entry ordering blocks by frequency, ties towards the lowest id.
#[derive(Clone, Copy, Debug)]
struct Seed {
    frequency: f64,
    block: BlockId,
}

impl PartialEq for Seed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Seed {}

impl PartialOrd for Seed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Seed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.frequency.total_cmp(&other.frequency).then_with(|| other.block.cmp(&self.block))
    }
}

fn unidirectional(cfg: &ControlFlowGraph<'_>) -> TraceBuilderResult {
    // A block is blocked until all its forward predecessors are scheduled.
    let mut blocked: IndexVec<BlockId, u32> = cfg
        .blocks
        .iter()
        .map(|b| b.predecessors.iter().filter(|&&p| !cfg.is_loop_end(p)).count() as u32)
        .collect();
    let mut traces: IndexVec<TraceId, Trace> = IndexVec::new();
    let mut trace_of: IndexVec<BlockId, Option<TraceId>> = index_vec![None; cfg.blocks.len()];
    let mut position_of: IndexVec<BlockId, u32> = index_vec![0; cfg.blocks.len()];

    let entry = cfg.entry();
    let mut worklist = BinaryHeap::new();
    worklist.push(Seed { frequency: cfg.blocks[entry].frequency, block: entry });

    while let Some(Seed { block, .. }) = worklist.pop() {
        if trace_of[block].is_some() {
            continue;
        }
        let id = traces.next_idx();
        let mut blocks = Vec::new();
        let mut current = Some(block);
        while let Some(b) = current {
            trace_of[b] = Some(id);
            position_of[b] = blocks.len() as u32;
            blocks.push(b);
            // Scheduling `b` unblocks its forward successors.
            if !cfg.is_loop_end(b) {
                for &s in &cfg.blocks[b].successors {
                    blocked[s] -= 1;
                    if blocked[s] == 0 && trace_of[s].is_none() {
                        worklist.push(Seed { frequency: cfg.blocks[s].frequency, block: s });
                    }
                }
            }
            // The trace follows the hottest unscheduled successor, blocked
            // or not.
            current = select_successor(cfg, &trace_of, b);
        }
        traces.push(Trace { blocks });
    }
    finish(traces, trace_of, position_of)
}

fn bidirectional(cfg: &ControlFlowGraph<'_>) -> TraceBuilderResult {
    let mut order: Vec<BlockId> = cfg.blocks.indices().collect();
    order.sort_by(|&a, &b| {
        cfg.blocks[b].frequency.total_cmp(&cfg.blocks[a].frequency).then_with(|| a.cmp(&b))
    });

    let mut traces: IndexVec<TraceId, Trace> = IndexVec::new();
    let mut trace_of: IndexVec<BlockId, Option<TraceId>> = index_vec![None; cfg.blocks.len()];
    let mut position_of: IndexVec<BlockId, u32> = index_vec![0; cfg.blocks.len()];

    for &seed in &order {
        if trace_of[seed].is_some() {
            continue;
        }
        let id = traces.next_idx();
        let mut deque = VecDeque::new();
        deque.push_back(seed);
        trace_of[seed] = Some(id);

        // Grow towards the entry first, then away from it.
        let mut current = seed;
        while let Some(p) = select_predecessor(cfg, &trace_of, current) {
            trace_of[p] = Some(id);
            deque.push_front(p);
            current = p;
        }
        let mut current = seed;
        while let Some(s) = select_successor(cfg, &trace_of, current) {
            trace_of[s] = Some(id);
            deque.push_back(s);
            current = s;
        }

        let blocks: Vec<BlockId> = deque.into();
        for (i, &b) in blocks.iter().enumerate() {
            position_of[b] = i as u32;
        }
        traces.push(Trace { blocks });
    }
    finish(traces, trace_of, position_of)
}

fn select_successor(
    cfg: &ControlFlowGraph<'_>,
    trace_of: &IndexVec<BlockId, Option<TraceId>>,
    block: BlockId,
) -> Option<BlockId> {
    if cfg.is_loop_end(block) {
        return None;
    }
    cfg.blocks[block]
        .successors
        .iter()
        .copied()
        .filter(|&s| trace_of[s].is_none())
        .max_by(|&a, &b| {
            cfg.blocks[a].frequency.total_cmp(&cfg.blocks[b].frequency).then_with(|| b.cmp(&a))
        })
}

fn select_predecessor(
    cfg: &ControlFlowGraph<'_>,
    trace_of: &IndexVec<BlockId, Option<TraceId>>,
    block: BlockId,
) -> Option<BlockId> {
    cfg.blocks[block]
        .predecessors
        .iter()
        .copied()
        .filter(|&p| trace_of[p].is_none() && !cfg.is_loop_end(p))
        .max_by(|&a, &b| {
            cfg.blocks[a].frequency.total_cmp(&cfg.blocks[b].frequency).then_with(|| b.cmp(&a))
        })
}

fn finish(
    traces: IndexVec<TraceId, Trace>,
    trace_of: IndexVec<BlockId, Option<TraceId>>,
    position_of: IndexVec<BlockId, u32>,
) -> TraceBuilderResult {
    let trace_of =
        trace_of.into_iter().map(|t| t.expect("block not assigned to a trace")).collect();
    TraceBuilderResult { traces, trace_of, position_of }
}
