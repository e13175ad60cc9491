#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, allow(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

pub mod graph;
pub use graph::{FlowGraph, GraphBuilder, GraphError, Node, NodeId, NodeKind};

pub mod cfg;
pub use cfg::{
    Block, BlockId, CfgBuilder, ControlFlowGraph, Loop, LoopForest, LoopId,
    MAX_RELATIVE_FREQUENCY, MIN_RELATIVE_FREQUENCY,
};

pub mod trace;
pub use trace::{compute_traces, Trace, TraceBuilderResult, TraceId, TracePolicy};

pub mod moves;
pub use moves::{
    Location, MoveError, MoveResolver, MoveSource, MoveTarget, Schedule, ScheduledMove,
};
