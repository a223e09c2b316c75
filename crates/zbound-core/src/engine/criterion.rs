use super::frontier::FrontierSnapshot;
use super::ledger::LedgerBook;
use super::processor::PhaseStats;
use crate::core::models::node::Node;
use crate::core::models::sequence::{SeqSpace, Sequence};
use crate::core::models::space::StateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Process,
    /// Put the node back unchanged without refining it.
    Requeue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfaction {
    KeepGoing,
    Terminate,
}

/// Everything a stopping criterion may inspect between phases.
#[derive(Debug, Clone)]
pub struct RefinementSnapshot {
    pub ledger: LedgerBook,
    pub frontier: FrontierSnapshot,
    pub phases: usize,
    /// Counters accumulated over all phases, per state.
    pub totals: Vec<PhaseStats>,
}

/// Decides when refinement may stop and which nodes are worth refining.
pub trait StoppingCriterion: Send + Sync {
    /// Called for every node read from the frontier; `seq` is its projection.
    fn filter_node(&self, _node: &Node, _seq: &Sequence) -> FilterDecision {
        FilterDecision::Process
    }

    fn is_satisfied(&self, snapshot: &RefinementSnapshot) -> Satisfaction;
}

impl<F> StoppingCriterion for F
where
    F: Fn(&RefinementSnapshot) -> Satisfaction + Send + Sync,
{
    fn is_satisfied(&self, snapshot: &RefinementSnapshot) -> Satisfaction {
        self(snapshot)
    }
}

/// Stops once every target sequence is resolved in every state, and skips
/// nodes that cannot reach any unresolved target.
#[derive(Debug, Clone)]
pub struct SequenceWidths {
    targets: Vec<Sequence>,
    tolerance: f64,
}

impl SequenceWidths {
    pub fn new(targets: Vec<Sequence>, tolerance: f64) -> Self {
        Self { targets, tolerance }
    }

    /// Every complete sequence of the space.
    pub fn all(seq_space: &SeqSpace, tolerance: f64) -> Self {
        Self::new(seq_space.complete_sequences(), tolerance)
    }

    pub fn targets(&self) -> &[Sequence] {
        &self.targets
    }
}

impl StoppingCriterion for SequenceWidths {
    fn filter_node(&self, _node: &Node, seq: &Sequence) -> FilterDecision {
        if self.targets.iter().any(|target| seq.generalizes(target)) {
            FilterDecision::Process
        } else {
            FilterDecision::Requeue
        }
    }

    fn is_satisfied(&self, snapshot: &RefinementSnapshot) -> Satisfaction {
        let resolved = (0..snapshot.ledger.num_states()).all(|s| {
            self.targets.iter().all(|target| {
                snapshot
                    .ledger
                    .bounds(StateId(s as u8), target)
                    .is_resolved(self.tolerance)
            })
        });
        if resolved {
            Satisfaction::Terminate
        } else {
            Satisfaction::KeepGoing
        }
    }
}

/// Stops once, in every state, the unresolved mass is at most `tolerance`
/// times the total mass.
#[derive(Debug, Clone, Copy)]
pub struct RelativeGap {
    pub tolerance: f64,
}

impl StoppingCriterion for RelativeGap {
    fn is_satisfied(&self, snapshot: &RefinementSnapshot) -> Satisfaction {
        let ledger = &snapshot.ledger;
        let closed = (0..ledger.num_states()).all(|s| {
            let state = StateId(s as u8);
            let open = (ledger.sum_pending(state) + ledger.sum_dropped(state)).clamp_non_negative();
            let total = ledger.sum_exact(state) + open;
            open <= total * self.tolerance
        });
        if closed {
            Satisfaction::Terminate
        } else {
            Satisfaction::KeepGoing
        }
    }
}
