//! DOT rendering of analyzed graphs.

use super::ControlFlowGraph;
use crate::graph::NodeKind;
use std::fmt::Write;

/// Renders the block-level graph in DOT format: one node per block annotated
/// with its analysis results, dashed loop-closing edges, and split arms
/// labeled with their probability.
#[must_use]
pub fn dot(cfg: &ControlFlowGraph<'_>) -> String {
    let mut dot = String::new();

    writeln!(dot, "digraph cfg {{").unwrap();
    writeln!(dot, "    node [shape=box, fontname=\"Courier\", fontsize=10];").unwrap();
    writeln!(dot, "    edge [fontname=\"Courier\", fontsize=9];").unwrap();
    writeln!(dot).unwrap();

    for (b, block) in cfg.blocks.iter_enumerated() {
        let mut label = format!("{b}");
        if b == cfg.entry() {
            label.push_str(" (entry)");
        }
        write!(label, "\\n{}..{}", block.begin, block.end).unwrap();
        write!(label, "\\nfreq {}", block.frequency).unwrap();
        if let Some(d) = block.dominator {
            write!(label, "\\ndom {d}").unwrap();
        }
        if let Some(l) = block.loop_id {
            write!(label, "\\n{l} depth {}", cfg.loop_depth(b)).unwrap();
        }
        let color = if b == cfg.entry() { ", fillcolor=\"#e0ffe0\", style=filled" } else { "" };
        writeln!(dot, "    {b} [label=\"{label}\"{color}];").unwrap();
    }

    writeln!(dot).unwrap();

    for (b, block) in cfg.blocks.iter_enumerated() {
        let closes_loop = cfg.is_loop_end(b);
        let splits = matches!(cfg.graph[block.end].kind, NodeKind::Split { .. });
        for &s in &block.successors {
            if closes_loop {
                writeln!(dot, "    {b} -> {s} [style=dashed];").unwrap();
            } else if splits {
                let probability = cfg.edge_probability(b, s);
                writeln!(dot, "    {b} -> {s} [label=\"{probability}\"];").unwrap();
            } else {
                writeln!(dot, "    {b} -> {s};").unwrap();
            }
        }
    }

    writeln!(dot, "}}").unwrap();
    dot
}
