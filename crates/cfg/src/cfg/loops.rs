//! Natural-loop detection.
//!
//! Loops are discovered per header in ascending block order, so enclosing
//! loops are built before the loops nested inside them. Membership is claimed
//! by walking backwards from the loop-closing blocks and from the
//! predecessors of the loop's exit markers; a later (inner) loop re-claims
//! blocks from its enclosing loop, while the enclosing loop's member list
//! keeps them.

use crate::cfg::{BlockId, ControlFlowGraph};
use crate::graph::{GraphError, NodeKind};
use index_vec::IndexVec;
use itertools::Itertools;
use std::{fmt, ops::Index};

index_vec::define_index_type! {
    /// A unique identifier for a natural loop.
    ///
    /// Loops are numbered by ascending header id, so an enclosing loop always
    /// has a smaller id than the loops nested inside it.
    pub struct LoopId = u32;
    DEBUG_FORMAT = "L{}";
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.index())
    }
}

/// A natural loop: a header block plus every block on a path from the header
/// to one of its loop-closing blocks, and any path that escapes the loop
/// without passing an exit marker.
#[derive(Clone, Debug)]
pub struct Loop {
    /// This loop's id.
    pub id: LoopId,
    /// The loop header; always the first entry of [`blocks`](Self::blocks).
    pub header: BlockId,
    /// The directly enclosing loop, if any.
    pub parent: Option<LoopId>,
    /// Directly nested loops, in ascending header order.
    pub children: Vec<LoopId>,
    /// Nesting depth; outermost loops have depth 1.
    pub depth: u32,
    /// Member blocks: the header first, then claim order. Blocks of nested
    /// loops are included.
    pub blocks: Vec<BlockId>,
    /// Members ending in a loop-closing jump to this header, ascending.
    pub ends: Vec<BlockId>,
    /// Exit-marker blocks tied to this header, ascending. Exits are not
    /// members; each has its single predecessor inside the loop.
    pub exits: Vec<BlockId>,
    /// Successor blocks outside the loop, ascending and deduplicated.
    pub natural_exits: Vec<BlockId>,
}

/// All natural loops of a graph, outer loops first.
#[derive(Clone, Debug, Default)]
pub struct LoopForest {
    /// The loops, indexed by [`LoopId`].
    pub loops: IndexVec<LoopId, Loop>,
}

impl LoopForest {
    /// Returns the number of loops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Returns true if the graph has no loops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Iterates all loops, outer loops first.
    pub fn iter(&self) -> impl Iterator<Item = &Loop> {
        self.loops.iter()
    }
}

impl Index<LoopId> for LoopForest {
    type Output = Loop;

    fn index(&self, id: LoopId) -> &Loop {
        &self.loops[id]
    }
}

/// Detects every natural loop and assigns block memberships.
#[instrument(level = "debug", skip_all)]
pub(super) fn compute(cfg: &mut ControlFlowGraph<'_>) -> Result<(), GraphError> {
    for i in 0..cfg.blocks.len() {
        let header = BlockId::from_usize(i);
        if !cfg.is_loop_header(header) {
            continue;
        }
        compute_loop(cfg, header)?;
    }
    debug!(loops = cfg.loops.len(), "detected loops");
    Ok(())
}

fn compute_loop(cfg: &mut ControlFlowGraph<'_>, header: BlockId) -> Result<(), GraphError> {
    let parent = cfg.blocks[header].loop_id;
    let depth = parent.map_or(1, |p| cfg.loops[p].depth + 1);
    let id = cfg.loops.loops.push(Loop {
        id: cfg.loops.loops.next_idx(),
        header,
        parent,
        children: Vec::new(),
        depth,
        blocks: Vec::new(),
        ends: Vec::new(),
        exits: Vec::new(),
        natural_exits: Vec::new(),
    });
    if let Some(p) = parent {
        cfg.loops.loops[p].children.push(id);
    }
    cfg.blocks[header].loop_id = Some(id);

    let ends: Vec<BlockId> = cfg.blocks[header]
        .predecessors
        .iter()
        .copied()
        .filter(|&p| cfg.is_loop_end(p))
        .collect();
    debug_assert!(!ends.is_empty(), "{header} has no loop-closing predecessor");

    let header_begin = cfg.blocks[header].begin;
    let mut exits = Vec::new();
    for (b, block) in cfg.blocks.iter_enumerated() {
        let kind = &cfg.graph[block.begin].kind;
        if matches!(*kind, NodeKind::LoopExit { header: h } if h == header_begin) {
            exits.push(b);
        }
    }

    let mut members = vec![header];
    for &end in &ends {
        claim(cfg, id, header, end, header, &mut members)?;
    }
    for &exit in &exits {
        let pred = cfg.blocks[exit].predecessors[0];
        claim(cfg, id, header, pred, exit, &mut members)?;
    }

    // Paths that leave the loop without passing one of its exit markers sink
    // in a return; pull them in. The member list grows while scanning it.
    let mut i = 0;
    while i < members.len() {
        let m = members[i];
        i += 1;
        let successors = cfg.blocks[m].successors.clone();
        for s in successors {
            if cfg.blocks[s].loop_id == Some(id) {
                continue;
            }
            let begin = &cfg.graph[cfg.blocks[s].begin].kind;
            if matches!(*begin, NodeKind::LoopExit { header: h } if h == header_begin) {
                continue;
            }
            debug_assert!(
                !matches!(begin, NodeKind::LoopBegin { .. }),
                "escape path from {header} enters another loop at {s}"
            );
            if !reclaim(cfg, id, s) {
                return Err(GraphError::IrregularLoop {
                    node: cfg.blocks[m].begin,
                    target: cfg.blocks[s].begin,
                });
            }
            members.push(s);
        }
    }

    let natural_exits = members
        .iter()
        .flat_map(|&m| cfg.blocks[m].successors.iter().copied())
        .filter(|&s| cfg.blocks[s].loop_id != Some(id))
        .sorted()
        .dedup()
        .collect();

    let l = &mut cfg.loops.loops[id];
    l.blocks = members;
    l.ends = ends;
    l.exits = exits;
    l.natural_exits = natural_exits;
    Ok(())
}

/// Claims `start` and everything backwards from it up to the header. A block
/// before the header means an edge enters the loop without passing it.
fn claim(
    cfg: &mut ControlFlowGraph<'_>,
    id: LoopId,
    header: BlockId,
    start: BlockId,
    via: BlockId,
    members: &mut Vec<BlockId>,
) -> Result<(), GraphError> {
    let mut stack = vec![(start, via)];
    while let Some((b, via)) = stack.pop() {
        if cfg.blocks[b].loop_id == Some(id) {
            continue;
        }
        if b < header || !reclaim(cfg, id, b) {
            return Err(GraphError::IrregularLoop {
                node: cfg.blocks[b].begin,
                target: cfg.blocks[via].begin,
            });
        }
        members.push(b);
        for &p in &cfg.blocks[b].predecessors {
            stack.push((p, b));
        }
    }
    Ok(())
}

/// Moves `b` into `id`. Ownership may only move from an enclosing loop to a
/// nested one; anything else is an edge crossing between unrelated loops and
/// fails the reclaim.
fn reclaim(cfg: &mut ControlFlowGraph<'_>, id: LoopId, b: BlockId) -> bool {
    if let Some(old) = cfg.blocks[b].loop_id {
        let mut at = Some(id);
        while at != Some(old) {
            let Some(l) = at else { return false };
            at = cfg.loops[l].parent;
        }
    }
    cfg.blocks[b].loop_id = Some(id);
    true
}
