use crate::core::math::bigexp::BigExp;
use crate::core::models::node::Node;
use crate::core::models::space::StateId;
use parking_lot::Mutex;
use std::time::Duration;

const SMOOTHING: f64 = 0.1;

/// Running estimate of how much bound uncertainty a node removes per unit of
/// work, kept per state and tree depth.
///
/// Scores are natural logarithms: `ln(z_upper) + ln(reduction per ns)`. A node
/// with no observations at its depth borrows the nearest shallower estimate.
#[derive(Debug)]
pub struct NodePerformance {
    rates: Mutex<Vec<Vec<Option<f64>>>>,
}

impl NodePerformance {
    /// `depths[state]` is the number of positions of each state.
    pub fn new(depths: &[usize]) -> Self {
        Self {
            rates: Mutex::new(depths.iter().map(|&d| vec![None; d + 1]).collect()),
        }
    }

    pub fn ln_rate(&self, state: StateId, depth: usize) -> f64 {
        let rates = self.rates.lock();
        rates
            .get(state.index())
            .and_then(|by_depth| {
                by_depth
                    .iter()
                    .take(depth + 1)
                    .rev()
                    .find_map(|rate| *rate)
            })
            .unwrap_or(0.0)
    }

    pub fn score(&self, node: &Node) -> f64 {
        let ln_z = node.z_upper.ln();
        if ln_z == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        ln_z + self.ln_rate(node.state, node.depth())
    }

    /// Records that processing a node at `depth` removed `reduction` of bound
    /// mass in `elapsed` time.
    pub fn observe(&self, state: StateId, depth: usize, reduction: BigExp, elapsed: Duration) {
        if reduction.is_zero() || reduction.is_sign_negative() {
            return;
        }
        let nanos = elapsed.as_nanos().max(1) as f64;
        let sample = reduction.ln() - nanos.ln();
        let mut rates = self.rates.lock();
        let Some(slot) = rates
            .get_mut(state.index())
            .and_then(|by_depth| by_depth.get_mut(depth))
        else {
            return;
        };
        *slot = Some(match *slot {
            Some(rate) => rate + SMOOTHING * (sample - rate),
            None => sample,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::conf::Conf;

    #[test]
    fn unobserved_depths_fall_back_to_shallower_estimates() {
        let perf = NodePerformance::new(&[3]);
        assert_eq!(perf.ln_rate(StateId(0), 2), 0.0);

        perf.observe(StateId(0), 1, BigExp::from_f64(1000.0), Duration::from_nanos(10));
        let expected = (100.0f64).ln();
        assert!((perf.ln_rate(StateId(0), 1) - expected).abs() < 1e-12);
        assert!((perf.ln_rate(StateId(0), 3) - expected).abs() < 1e-12);
        assert_eq!(perf.ln_rate(StateId(0), 0), 0.0);
    }

    #[test]
    fn observations_are_smoothed() {
        let perf = NodePerformance::new(&[1]);
        perf.observe(StateId(0), 0, BigExp::from_f64(1.0), Duration::from_nanos(1));
        perf.observe(StateId(0), 0, BigExp::from_f64(1.0), Duration::from_nanos(100));
        let rate = perf.ln_rate(StateId(0), 0);
        assert!(rate < 0.0 && rate > (0.01f64).ln());
    }

    #[test]
    fn score_adds_log_bound_and_rate() {
        let perf = NodePerformance::new(&[2]);
        let node = Node::new(StateId(0), Conf::unassigned(2), BigExp::from_f64(8.0));
        assert!((perf.score(&node) - 8.0f64.ln()).abs() < 1e-12);

        let empty = Node::new(StateId(0), Conf::unassigned(2), BigExp::ZERO);
        assert_eq!(perf.score(&empty), f64::NEG_INFINITY);
    }

    #[test]
    fn non_positive_reductions_are_ignored() {
        let perf = NodePerformance::new(&[1]);
        perf.observe(StateId(0), 0, BigExp::ZERO, Duration::from_nanos(5));
        perf.observe(StateId(0), 0, BigExp::from_f64(-1.0), Duration::from_nanos(5));
        assert_eq!(perf.ln_rate(StateId(0), 0), 0.0);
    }
}
