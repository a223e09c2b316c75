//! Bounded stores of unexplored subtrees, one sub-collection per state.
//!
//! Two disciplines share one interface. The sweep store reads nodes in arrival
//! order and defers those below a rising free-energy threshold to the next
//! sweep step. The priority store reads the best-scoring node first and, when
//! full, evicts the globally worst node to an overflow file or drops it.
//!
//! Every node that leaves a store other than through `pop` is reported to a
//! [`DropSink`], which is how the ledger learns to stop counting it as pending.

pub mod priority;
pub mod ring;
pub mod sweep;

use crate::core::io::records::RecordError;
use crate::core::io::ring_file::RingFileError;
use crate::core::math::bigexp::BigExp;
use crate::core::models::node::Node;
use crate::core::models::space::StateId;
use priority::PriorityFrontier;
use sweep::SweepFrontier;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontierError {
    #[error("Frontier file error: {0}")]
    File(#[from] RingFileError),

    #[error("Frontier record error: {0}")]
    Record(#[from] RecordError),

    #[error("Frontier of {state} is full ({capacity} nodes)")]
    Full { state: StateId, capacity: usize },

    #[error("Frontier does not hold {state}")]
    UnknownState { state: StateId },
}

/// Why a node left the frontier without being refined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Its bound fell below the prune threshold.
    Pruned,
    /// It was pushed out to make room.
    Evicted,
}

/// Receives nodes removed from a store to make room.
pub trait DropSink {
    fn on_drop(&mut self, node: &Node);
}

impl<F: FnMut(&Node)> DropSink for F {
    fn on_drop(&mut self, node: &Node) {
        self(node)
    }
}

/// Discards drop notifications; for stores that cannot evict.
pub struct NoDrops;

impl DropSink for NoDrops {
    fn on_drop(&mut self, _node: &Node) {}
}

#[derive(Debug)]
pub enum Frontier {
    Sweep(SweepFrontier),
    Priority(PriorityFrontier),
}

impl Frontier {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Frontier::Sweep(_) => "sweep",
            Frontier::Priority(_) => "priority",
        }
    }

    pub fn num_states(&self) -> usize {
        match self {
            Frontier::Sweep(f) => f.num_states(),
            Frontier::Priority(f) => f.num_states(),
        }
    }

    /// Takes the next node of `state`.
    pub fn pop(&mut self, state: StateId) -> Result<Option<Node>, FrontierError> {
        match self {
            Frontier::Sweep(f) => f.pop(state),
            Frontier::Priority(f) => f.pop(state),
        }
    }

    /// Adds a freshly created node.
    pub fn push(&mut self, node: Node, sink: &mut dyn DropSink) -> Result<(), FrontierError> {
        match self {
            Frontier::Sweep(f) => f.push(node),
            Frontier::Priority(f) => f.push(node, sink),
        }
    }

    /// Returns an unchanged node that should be read again later.
    pub fn requeue(&mut self, node: Node, sink: &mut dyn DropSink) -> Result<(), FrontierError> {
        match self {
            Frontier::Sweep(f) => f.requeue(node),
            Frontier::Priority(f) => f.push(node, sink),
        }
    }

    /// Puts back a node whose processing failed, so it is read first again.
    pub fn restore(&mut self, node: Node, sink: &mut dyn DropSink) -> Result<(), FrontierError> {
        match self {
            Frontier::Sweep(f) => f.restore(node),
            Frontier::Priority(f) => f.push(node, sink),
        }
    }

    pub fn capacity(&self, state: StateId) -> usize {
        match self {
            Frontier::Sweep(f) => f.capacity(),
            Frontier::Priority(f) => f.capacity_for(state),
        }
    }

    /// Nodes that can still be added for `state` without eviction.
    pub fn capacity_remaining(&self, state: StateId) -> usize {
        match self {
            Frontier::Sweep(f) => f.capacity_remaining(state),
            Frontier::Priority(f) => f.capacity_remaining(),
        }
    }

    pub fn len(&self, state: StateId) -> usize {
        match self {
            Frontier::Sweep(f) => f.len(state),
            Frontier::Priority(f) => f.len(state),
        }
    }

    pub fn is_empty(&self, state: StateId) -> bool {
        self.len(state) == 0
    }

    pub fn total_len(&self) -> usize {
        (0..self.num_states())
            .map(|s| self.len(StateId(s as u8)))
            .sum()
    }

    /// Every stored node of `state`; reads overflow files.
    pub fn nodes(&mut self, state: StateId) -> Result<Vec<Node>, FrontierError> {
        match self {
            Frontier::Sweep(f) => f.nodes(state),
            Frontier::Priority(f) => f.nodes(state),
        }
    }

    pub fn sum_bounds(&mut self, state: StateId) -> Result<BigExp, FrontierError> {
        Ok(self.nodes(state)?.iter().map(|n| n.z_upper).sum())
    }

    pub fn flush(&mut self) -> Result<(), FrontierError> {
        match self {
            Frontier::Sweep(f) => f.flush(),
            Frontier::Priority(f) => f.flush(),
        }
    }

    pub fn as_sweep_mut(&mut self) -> Option<&mut SweepFrontier> {
        match self {
            Frontier::Sweep(f) => Some(f),
            Frontier::Priority(_) => None,
        }
    }

    pub fn as_priority_mut(&mut self) -> Option<&mut PriorityFrontier> {
        match self {
            Frontier::Sweep(_) => None,
            Frontier::Priority(f) => Some(f),
        }
    }
}

/// Per-state frontier sizes at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontierSnapshot {
    pub nodes: Vec<usize>,
    pub capacity: Vec<usize>,
}

impl FrontierSnapshot {
    pub fn of(frontier: &Frontier) -> Self {
        let states = (0..frontier.num_states()).map(|s| StateId(s as u8));
        let (nodes, capacity) = states
            .map(|s| (frontier.len(s), frontier.capacity(s)))
            .unzip();
        Self { nodes, capacity }
    }

    pub fn total(&self) -> usize {
        self.nodes.iter().sum()
    }
}
