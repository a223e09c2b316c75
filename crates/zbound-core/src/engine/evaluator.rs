use crate::core::models::conf::Conf;
use crate::core::models::sequence::Sequence;
use crate::core::models::space::{ConfSpace, MultiStateSpace, StateId};
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct EvaluationError(pub String);

/// Scores fully assigned conformations.
///
/// Implementations must be deterministic: the same conformation always yields
/// the same energy. The energy must never fall below the pairwise lower bound
/// of the state's energy matrix, otherwise the resolved partition function of
/// a leaf exceeds its bound and the ledger reports a soundness violation.
pub trait LeafEvaluator: Send + Sync {
    fn energy(&self, state: StateId, conf: &Conf) -> Result<f64, EvaluationError>;

    /// Number of leaves worth evaluating together.
    fn max_batch_size(&self) -> usize {
        1
    }

    fn energies(&self, state: StateId, confs: &[Conf]) -> Vec<Result<f64, EvaluationError>> {
        #[cfg(not(feature = "parallel"))]
        let iterator = confs.iter();

        #[cfg(feature = "parallel")]
        let iterator = confs.par_iter();

        iterator.map(|conf| self.energy(state, conf)).collect()
    }
}

impl<F> LeafEvaluator for F
where
    F: Fn(StateId, &Conf) -> Result<f64, EvaluationError> + Send + Sync,
{
    fn energy(&self, state: StateId, conf: &Conf) -> Result<f64, EvaluationError> {
        self(state, conf)
    }
}

/// Scores a leaf with the exact pairwise energy of its state's energy matrix.
#[derive(Debug, Clone)]
pub struct PairwiseEvaluator {
    space: Arc<MultiStateSpace>,
    batch_size: usize,
}

impl PairwiseEvaluator {
    pub fn new(space: Arc<MultiStateSpace>) -> Self {
        Self {
            space,
            batch_size: 16,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl LeafEvaluator for PairwiseEvaluator {
    fn energy(&self, state: StateId, conf: &Conf) -> Result<f64, EvaluationError> {
        let space = self
            .space
            .state(state)
            .ok_or_else(|| EvaluationError(format!("unknown {state}")))?;
        space
            .emat
            .conf_energy(conf)
            .ok_or_else(|| EvaluationError(format!("conformation {conf} is incomplete")))
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}

/// The legal choices of each position of one state.
pub trait ChoiceEnumerator {
    fn num_positions(&self) -> usize;
    fn legal_choices(&self, pos: usize) -> Vec<usize>;
}

impl ChoiceEnumerator for ConfSpace {
    fn num_positions(&self) -> usize {
        ConfSpace::num_positions(self)
    }

    fn legal_choices(&self, pos: usize) -> Vec<usize> {
        (0..self.positions[pos].rcs.len()).collect()
    }
}

/// Precomputed legal choices per position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rcs {
    choices: Vec<Vec<usize>>,
}

impl Rcs {
    pub fn from_enumerator(enumerator: &dyn ChoiceEnumerator) -> Self {
        Self {
            choices: (0..enumerator.num_positions())
                .map(|pos| enumerator.legal_choices(pos))
                .collect(),
        }
    }

    /// Choices restricted to the residue types of `seq`; wildcard positions keep all.
    pub fn for_sequence(conf_space: &ConfSpace, seq: &Sequence) -> Self {
        let choices = conf_space
            .positions
            .iter()
            .map(|position| {
                let wanted = position.seq_pos.and_then(|s| seq.label(s));
                position
                    .rcs
                    .iter()
                    .enumerate()
                    .filter(|(_, rc)| wanted.is_none_or(|label| rc.label == label))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        Self { choices }
    }

    #[inline]
    pub fn get(&self, pos: usize) -> &[usize] {
        &self.choices[pos]
    }

    #[inline]
    pub fn num_positions(&self) -> usize {
        self.choices.len()
    }

    pub fn max_choices(&self) -> usize {
        self.choices.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn has_empty_position(&self) -> bool {
        self.choices.iter().any(Vec::is_empty)
    }
}
