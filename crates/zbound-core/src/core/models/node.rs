use super::conf::Conf;
use super::space::StateId;
use crate::core::math::bigexp::BigExp;

/// One unexplored subtree of a state's conformation tree.
///
/// `z_upper` bounds, for every sequence reachable from `conf`, the partition
/// function contribution of that sequence within the subtree. `score` orders
/// nodes in priority mode and is unused by the sweep discipline.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub state: StateId,
    pub conf: Conf,
    pub z_upper: BigExp,
    pub score: f64,
}

impl Node {
    pub fn new(state: StateId, conf: Conf, z_upper: BigExp) -> Self {
        Self {
            state,
            conf,
            z_upper,
            score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.conf.is_complete()
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.conf.num_defined()
    }
}
