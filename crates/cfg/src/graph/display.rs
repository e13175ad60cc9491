//! DOT rendering of raw flow graphs.

use super::{FlowGraph, NodeKind};
use std::fmt::Write;

/// Renders the node-level flow graph in DOT format for visualization.
#[must_use]
pub fn dot(graph: &FlowGraph) -> String {
    let mut dot = String::new();

    writeln!(dot, "digraph flowgraph {{").unwrap();
    writeln!(dot, "    node [shape=box, fontname=\"Courier\", fontsize=10];").unwrap();
    writeln!(dot, "    edge [fontname=\"Courier\", fontsize=9];").unwrap();
    writeln!(dot).unwrap();

    for (id, node) in graph.nodes.iter_enumerated() {
        let mut label = format!("{id}: {}", node.kind.mnemonic());
        match &node.kind {
            NodeKind::LoopBegin { frequency } => write!(label, " ({frequency})").unwrap(),
            NodeKind::LoopExit { header } => write!(label, " ({header})").unwrap(),
            _ => {}
        }
        let color = if id == graph.entry { ", fillcolor=\"#e0ffe0\", style=filled" } else { "" };
        writeln!(dot, "    {id} [label=\"{label}\"{color}];").unwrap();
    }

    writeln!(dot).unwrap();

    for (id, node) in graph.nodes.iter_enumerated() {
        if let Some(next) = node.next {
            writeln!(dot, "    {id} -> {next};").unwrap();
        }
        match &node.kind {
            NodeKind::End { target } => {
                writeln!(dot, "    {id} -> {target};").unwrap();
            }
            NodeKind::LoopEnd { header } => {
                writeln!(dot, "    {id} -> {header} [style=dashed];").unwrap();
            }
            NodeKind::Split { targets, probabilities } => {
                for (target, probability) in targets.iter().zip(probabilities) {
                    writeln!(dot, "    {id} -> {target} [label=\"{probability}\"];").unwrap();
                }
            }
            _ => {}
        }
    }

    writeln!(dot, "}}").unwrap();
    dot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;

    #[test]
    fn dot_lists_every_node_and_edge_once() {
        let mut builder = GraphBuilder::new();
        let (t, e) = (builder.create_begin(), builder.create_begin());
        builder.branch(0.5, t, e);
        builder.switch_to(t);
        builder.ret();
        builder.switch_to(e);
        builder.ret();
        let graph = builder.finish();

        let out = dot(&graph);
        assert!(out.starts_with("digraph flowgraph {"));
        for (id, _) in graph.nodes.iter_enumerated() {
            assert_eq!(out.matches(&format!("    {id} [label=")).count(), 1);
        }
        assert_eq!(out.matches("[label=\"0.5\"]").count(), 2);
        assert_eq!(out.matches("style=filled").count(), 1);
    }
}
