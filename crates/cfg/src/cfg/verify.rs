//! Structural self-checks for an analyzed graph.

use crate::cfg::{
    BlockId, ControlFlowGraph, LoopId, MAX_RELATIVE_FREQUENCY, MIN_RELATIVE_FREQUENCY,
};
use crate::graph::NodeKind;
use rustc_hash::FxHashSet;

/// Checks every structural invariant of an analyzed graph: block/node
/// ownership, edge symmetry and direction, frequency bounds, dominator and
/// postdominator consistency, and loop memberships.
///
/// Panics with a descriptive message on the first violation; returns `true`
/// so it can sit inside a `debug_assert!`.
pub fn verify(cfg: &ControlFlowGraph<'_>) -> bool {
    verify_blocks(cfg);
    verify_dominators(cfg);
    verify_postdominators(cfg);
    verify_loops(cfg);
    true
}

fn verify_blocks(cfg: &ControlFlowGraph<'_>) {
    assert!(!cfg.blocks.is_empty(), "graph without blocks");
    assert_eq!(cfg.block_for(cfg.graph.entry), Some(cfg.entry()), "entry is not block 0");
    for (b, block) in cfg.blocks.iter_enumerated() {
        assert!(
            cfg.graph[block.begin].kind.is_begin_marker(),
            "{b} does not start at a begin marker"
        );
        assert_eq!(cfg.block_for(block.begin), Some(b), "{b} does not own its begin node");
        assert_eq!(cfg.block_for(block.end), Some(b), "{b} does not own its end node");
        let end = &cfg.graph[block.end];
        assert!(
            end.kind.is_terminator()
                || end.next.is_some_and(|n| cfg.graph[n].kind.is_begin_marker()),
            "{b} neither terminates nor falls through"
        );

        let targets = cfg.graph.successor_begins(block.end);
        assert_eq!(targets.len(), block.successors.len(), "{b} successor arity mismatch");
        for (&node, &s) in targets.iter().zip(&block.successors) {
            assert_eq!(cfg.block_for(node), Some(s), "{b} successor {s} does not start at {node}");
        }

        let closes_loop = cfg.is_loop_end(b);
        for &s in &block.successors {
            if closes_loop {
                assert!(s <= b, "loop-closing edge {b} -> {s} goes forward");
                assert!(cfg.is_loop_header(s), "loop-closing edge {b} -> {s} misses a header");
            } else {
                assert!(s > b, "forward edge {b} -> {s} does not increase");
            }
            let out = block.successors.iter().filter(|&&x| x == s).count();
            let into = cfg.blocks[s].predecessors.iter().filter(|&&x| x == b).count();
            assert_eq!(out, into, "edge {b} -> {s} multiplicity mismatch");
        }
        for &p in &block.predecessors {
            assert!(cfg.blocks[p].successors.contains(&b), "{p} missing successor {b}");
        }

        // Forward predecessors ascending, then loop-closing ones ascending.
        let boundary = block
            .predecessors
            .iter()
            .position(|&p| cfg.is_loop_end(p))
            .unwrap_or(block.predecessors.len());
        let (forward, back) = block.predecessors.split_at(boundary);
        assert!(
            back.iter().all(|&p| cfg.is_loop_end(p)),
            "{b} interleaves forward and loop-closing predecessors"
        );
        assert!(forward.windows(2).all(|w| w[0] < w[1]), "{b} forward predecessors not ascending");
        assert!(
            back.windows(2).all(|w| w[0] < w[1]),
            "{b} loop-closing predecessors not ascending"
        );

        assert!(
            block.frequency.is_finite()
                && (MIN_RELATIVE_FREQUENCY..=MAX_RELATIVE_FREQUENCY).contains(&block.frequency),
            "{b} frequency {} out of range",
            block.frequency
        );
    }
}

fn verify_dominators(cfg: &ControlFlowGraph<'_>) {
    assert_eq!(cfg.blocks[cfg.entry()].dominator, None, "entry has a dominator");
    let computed = cfg.blocks.iter_enumerated().skip(1).any(|(_, b)| b.dominator.is_some());
    if !computed {
        return;
    }
    let mut max_depth = 0;
    for (b, block) in cfg.blocks.iter_enumerated() {
        if b != cfg.entry() {
            let d = block.dominator.unwrap_or_else(|| panic!("{b} has no dominator"));
            assert!(d < b, "{b} dominated by later {d}");
            assert!(cfg.blocks[d].dominated.contains(&b), "{d} missing dominated {b}");
            assert_eq!(
                block.dominator_depth,
                cfg.blocks[d].dominator_depth + 1,
                "{b} dominator depth mismatch"
            );
        }
        max_depth = max_depth.max(block.dominator_depth);
        assert!(block.dominated.windows(2).all(|w| w[0] < w[1]), "{b} dominated not ascending");
        for &c in &block.dominated {
            assert_eq!(cfg.blocks[c].dominator, Some(b), "{c} not dominated by {b}");
        }
        if block.dominator_number != u32::MAX {
            assert!(cfg.dominates(cfg.entry(), b), "entry does not dominate {b}");
            if let Some(d) = block.dominator {
                assert!(cfg.strictly_dominates(d, b), "{d} does not strictly dominate {b}");
            }
        }
    }
    assert_eq!(max_depth, cfg.max_dominator_depth(), "max dominator depth mismatch");
}

fn verify_postdominators(cfg: &ControlFlowGraph<'_>) {
    for (b, block) in cfg.blocks.iter_enumerated() {
        let Some(pd) = block.postdominator else { continue };
        assert!(pd > b, "{b} postdominated by earlier {pd}");
        assert!(!cfg.is_loop_end(b), "loop-closing {b} has a postdominator");

        // Every forward path from `b` must reach `pd`.
        let mut visited = FxHashSet::default();
        let mut stack = vec![b];
        while let Some(s) = stack.pop() {
            if s == pd || !visited.insert(s) {
                continue;
            }
            assert!(s < pd, "forward path from {b} escapes past {pd} at {s}");
            let onward = &cfg.blocks[s].successors;
            assert!(
                !cfg.is_loop_end(s) && !onward.is_empty(),
                "forward path from {b} dead-ends at {s} before {pd}"
            );
            stack.extend(onward.iter().copied());
        }
    }
}

fn verify_loops(cfg: &ControlFlowGraph<'_>) {
    for l in cfg.loops.iter() {
        let header = l.header;
        let header_begin = cfg.blocks[header].begin;
        assert!(cfg.is_loop_header(header), "{} header {header} is not a loop begin", l.id);
        assert_eq!(l.blocks.first(), Some(&header), "{} does not lead with its header", l.id);
        assert_eq!(cfg.blocks[header].loop_id, Some(l.id), "{header} not owned by {}", l.id);

        match l.parent {
            Some(p) => {
                assert_eq!(cfg.loops[p].depth + 1, l.depth, "{} depth mismatch", l.id);
                assert!(cfg.loops[p].children.contains(&l.id), "{p} missing child {}", l.id);
                assert!(cfg.loops[p].blocks.contains(&header), "{p} missing member {header}");
            }
            None => assert_eq!(l.depth, 1, "{} depth mismatch", l.id),
        }
        for &c in &l.children {
            assert_eq!(cfg.loops[c].parent, Some(l.id), "{c} parent mismatch");
        }

        for &m in &l.blocks {
            assert!(is_member(cfg, l.id, m), "{m} listed in {} without membership", l.id);
            if m != header {
                for &p in &cfg.blocks[m].predecessors {
                    assert!(is_member(cfg, l.id, p), "{m} in {} has outside predecessor {p}", l.id);
                }
            }
        }

        assert!(!l.ends.is_empty(), "{} has no loop end", l.id);
        for &e in &l.ends {
            assert!(is_member(cfg, l.id, e), "end {e} outside {}", l.id);
            let end = &cfg.graph[cfg.blocks[e].end].kind;
            assert!(
                matches!(*end, NodeKind::LoopEnd { header: h } if h == header_begin),
                "{e} does not close {}",
                l.id
            );
        }
        for &x in &l.exits {
            let begin = &cfg.graph[cfg.blocks[x].begin].kind;
            assert!(
                matches!(*begin, NodeKind::LoopExit { header: h } if h == header_begin),
                "{x} is not an exit marker of {}",
                l.id
            );
            assert_eq!(cfg.blocks[x].predecessors.len(), 1, "exit {x} predecessor count");
            assert!(!is_member(cfg, l.id, x), "exit {x} claimed by {}", l.id);
            assert!(
                is_member(cfg, l.id, cfg.blocks[x].predecessors[0]),
                "exit {x} predecessor outside {}",
                l.id
            );
        }
        assert!(
            l.natural_exits.windows(2).all(|w| w[0] < w[1]),
            "{} natural exits not ascending",
            l.id
        );
        for &x in &l.natural_exits {
            assert!(!is_member(cfg, l.id, x), "natural exit {x} claimed by {}", l.id);
        }
    }

    for (b, block) in cfg.blocks.iter_enumerated() {
        if let Some(l) = block.loop_id {
            assert!(cfg.loops[l].blocks.contains(&b), "{b} owned by {l} but not listed");
        }
    }
}

fn is_member(cfg: &ControlFlowGraph<'_>, l: LoopId, b: BlockId) -> bool {
    let mut at = cfg.blocks[b].loop_id;
    while let Some(id) = at {
        if id == l {
            return true;
        }
        at = cfg.loops[id].parent;
    }
    false
}
