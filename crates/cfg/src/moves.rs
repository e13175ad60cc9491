//! Parallel move resolution.
//!
//! At a control-flow merge the register allocator must realize a set of
//! simultaneous location assignments whose reads all observe the pre-merge
//! state. [`MoveResolver`] orders them into an equivalent sequential
//! [`Schedule`], routing each cycle through the single scratch temporary.
//!
//! The requests form a graph whose nodes are locations: a declared target has
//! at most one incoming move and arbitrarily many outgoing reads, so every
//! connected component holds at most one cycle.

use derive_more::derive::Display;
use index_vec::{index_vec, IndexVec};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use std::{collections::VecDeque, fmt};

index_vec::define_index_type! {
    /// An abstract value location (register or stack slot) named by the
    /// caller.
    pub struct Location = u32;
    DEBUG_FORMAT = "loc{}";
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc{}", self.index())
    }
}

/// An error raised by [`MoveResolver::add_move`] for an invalid assignment.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    /// A move names a target outside the declared target set.
    #[error("{target} is not a declared move target")]
    UndeclaredTarget {
        /// The undeclared location.
        target: Location,
    },
    /// A second move assigns an already-assigned target.
    #[error("{target} is assigned by more than one move")]
    ConflictingAssignment {
        /// The doubly-assigned location.
        target: Location,
    },
}

/// The origin of a scheduled move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum MoveSource {
    /// A concrete location.
    #[display("{_0}")]
    Location(Location),
    /// The scratch temporary.
    #[display("temp")]
    Temporary,
}

/// The destination of a scheduled move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum MoveTarget {
    /// A concrete location.
    #[display("{_0}")]
    Location(Location),
    /// The scratch temporary.
    #[display("temp")]
    Temporary,
}

/// A single sequential move of the final schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[display("{source} -> {target}")]
pub struct ScheduledMove {
    /// Where the value is read from.
    pub source: MoveSource,
    /// Where it is written.
    pub target: MoveTarget,
}

/// An ordered move sequence reproducing atomic parallel execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    /// The moves, in execution order.
    pub moves: Vec<ScheduledMove>,
    /// Whether executing the schedule requires the scratch temporary.
    pub needs_temporary: bool,
}

index_vec::define_index_type! {
    /// Arena index of a node in the move graph.
    struct MoveNodeId = u32;
    DEBUG_FORMAT = "mv{}";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MoveNodeKind {
    /// A location only ever read.
    Source(Location),
    /// A declared target location.
    Target(Location),
    /// The scratch cell, holding the saved value of the wrapped target while
    /// its cycle is rewritten.
    Temp(MoveNodeId),
}

#[derive(Debug)]
struct MoveNode {
    kind: MoveNodeKind,
    /// The single move writing this node, if any.
    incoming: Option<MoveNodeId>,
    /// The moves reading this node.
    outgoing: SmallVec<[MoveNodeId; 2]>,
}

/// Schedules a set of simultaneous location assignments into an equivalent
/// sequential move order.
///
/// A resolver is created fresh per merge point with the full set of assigned
/// locations, populated through [`add_move`](Self::add_move), and consumed by
/// [`schedule_moves`](Self::schedule_moves).
#[derive(Debug)]
pub struct MoveResolver {
    nodes: IndexVec<MoveNodeId, MoveNode>,
    /// Location interning. Never iterated.
    node_of: FxHashMap<Location, MoveNodeId>,
}

impl MoveResolver {
    /// Creates a resolver for one merge point over the given set of assigned
    /// locations.
    #[must_use]
    pub fn new(targets: impl IntoIterator<Item = Location>) -> Self {
        let mut resolver = Self { nodes: IndexVec::new(), node_of: FxHashMap::default() };
        for target in targets {
            let node = resolver.nodes.push(MoveNode {
                kind: MoveNodeKind::Target(target),
                incoming: None,
                outgoing: SmallVec::new(),
            });
            resolver.node_of.insert(target, node);
        }
        resolver
    }

    /// Requests that `target` receive the value currently held by `source`.
    ///
    /// Self-moves are discarded on the spot. Fails if `target` was not
    /// declared up front or is already assigned by an earlier move.
    pub fn add_move(&mut self, source: Location, target: Location) -> Result<(), MoveError> {
        let node = match self.node_of.get(&target) {
            Some(&node) if matches!(self.nodes[node].kind, MoveNodeKind::Target(_)) => node,
            _ => return Err(MoveError::UndeclaredTarget { target }),
        };
        if source == target {
            trace!(%target, "discarding self-move");
            return Ok(());
        }
        if self.nodes[node].incoming.is_some() {
            return Err(MoveError::ConflictingAssignment { target });
        }
        let source = self.intern_source(source);
        self.nodes[source].outgoing.push(node);
        self.nodes[node].incoming = Some(source);
        Ok(())
    }

    fn intern_source(&mut self, location: Location) -> MoveNodeId {
        if let Some(&node) = self.node_of.get(&location) {
            return node;
        }
        let node = self.nodes.push(MoveNode {
            kind: MoveNodeKind::Source(location),
            incoming: None,
            outgoing: SmallVec::new(),
        });
        self.node_of.insert(location, node);
        node
    }

    /// Consumes the resolver and produces the sequential schedule.
    ///
    /// Cycles are broken through the scratch temporary; components are
    /// scheduled one after another, so their saved values never overlap and
    /// one scratch cell serves the whole schedule.
    #[instrument(level = "debug", skip_all)]
    #[must_use]
    pub fn schedule_moves(mut self) -> Schedule {
        let saved = self.break_cycles();

        let mut moves = Vec::new();
        let mut order = VecDeque::new();
        let mut stack = Vec::new();
        for root in self.nodes.indices() {
            if self.nodes[root].incoming.is_some() {
                continue;
            }
            // Reverse topological order: every node goes in front of the
            // nodes feeding it, so all reads of a location precede the write
            // clobbering it.
            order.clear();
            stack.push(root);
            while let Some(node) = stack.pop() {
                order.push_front(node);
                stack.extend(self.nodes[node].outgoing.iter().copied());
            }
            for &node in &order {
                self.emit(node, &saved, &mut moves);
            }
        }

        let needs_temporary = !saved.is_empty();
        debug!(moves = moves.len(), needs_temporary, "scheduled parallel moves");
        Schedule { moves, needs_temporary }
    }

    /// Reroutes the back edge of every move cycle through a fresh temp node,
    /// leaving a forest. Returns the nodes whose value must be parked in the
    /// temporary before they are overwritten.
    fn break_cycles(&mut self) -> FxHashSet<MoveNodeId> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut saved = FxHashSet::default();
        let len = self.nodes.len();
        let mut color: IndexVec<MoveNodeId, Color> = index_vec![Color::White; len];
        for root in (0..len).map(MoveNodeId::from_usize) {
            if color[root] != Color::White {
                continue;
            }
            color[root] = Color::Gray;
            let mut stack: Vec<(MoveNodeId, usize)> = vec![(root, 0)];
            while let Some(&mut (node, ref mut edge)) = stack.last_mut() {
                if *edge == self.nodes[node].outgoing.len() {
                    color[node] = Color::Black;
                    stack.pop();
                    continue;
                }
                let child = self.nodes[node].outgoing[*edge];
                match color[child] {
                    Color::White => {
                        *edge += 1;
                        color[child] = Color::Gray;
                        stack.push((child, 0));
                    }
                    // An edge to an in-progress node closes the component's
                    // single cycle. After the removal the next outgoing edge
                    // slides into `edge`.
                    Color::Gray => {
                        let target = self.nodes[node].outgoing.remove(*edge);
                        let temp = self.nodes.push(MoveNode {
                            kind: MoveNodeKind::Temp(node),
                            incoming: None,
                            outgoing: smallvec![target],
                        });
                        self.nodes[target].incoming = Some(temp);
                        let first = saved.insert(node);
                        debug_assert!(first, "{node:?} closes two cycles");
                        trace!(?node, ?target, "rerouted move cycle through the temporary");
                    }
                    Color::Black => *edge += 1,
                }
            }
        }
        saved
    }

    fn emit(
        &self,
        node: MoveNodeId,
        saved: &FxHashSet<MoveNodeId>,
        moves: &mut Vec<ScheduledMove>,
    ) {
        let Some(source) = self.nodes[node].incoming else { return };
        let MoveNodeKind::Target(target) = self.nodes[node].kind else {
            unreachable!("move into a non-target node")
        };
        // A broken cycle still reads this location; park its value first.
        if saved.contains(&node) {
            moves.push(ScheduledMove {
                source: MoveSource::Location(target),
                target: MoveTarget::Temporary,
            });
        }
        let source = match self.nodes[source].kind {
            MoveNodeKind::Source(location) | MoveNodeKind::Target(location) => {
                MoveSource::Location(location)
            }
            MoveNodeKind::Temp(_) => MoveSource::Temporary,
        };
        moves.push(ScheduledMove { source, target: MoveTarget::Location(target) });
    }
}
