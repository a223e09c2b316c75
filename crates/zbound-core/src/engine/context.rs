use super::bounds::BoundCalculator;
use super::config::EstimatorConfig;
use super::criterion::StoppingCriterion;
use super::evaluator::LeafEvaluator;
use crate::core::models::space::StateId;

/// The read-only inputs of a refinement run, shared by every worker.
#[derive(Clone, Copy)]
pub struct RefinementContext<'a> {
    pub config: &'a EstimatorConfig,
    pub calcs: &'a [BoundCalculator],
    pub evaluator: &'a dyn LeafEvaluator,
    pub criterion: &'a dyn StoppingCriterion,
}

impl<'a> RefinementContext<'a> {
    pub fn new(
        config: &'a EstimatorConfig,
        calcs: &'a [BoundCalculator],
        evaluator: &'a dyn LeafEvaluator,
        criterion: &'a dyn StoppingCriterion,
    ) -> Self {
        Self {
            config,
            calcs,
            evaluator,
            criterion,
        }
    }

    #[inline]
    pub fn calc(&self, state: StateId) -> &'a BoundCalculator {
        &self.calcs[state.index()]
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.calcs.len()
    }

    pub fn batch_size(&self) -> usize {
        batch_size(self.config, self.evaluator)
    }
}

/// Leaves evaluated together: the configured size, else the evaluator's.
pub fn batch_size(config: &EstimatorConfig, evaluator: &dyn LeafEvaluator) -> usize {
    config
        .concurrency
        .minimization_batch_size
        .unwrap_or_else(|| evaluator.max_batch_size())
        .max(1)
}
