use super::error::EngineError;
use super::evaluator::{LeafEvaluator, Rcs};
use crate::core::math::bigexp::BigExp;
use crate::core::math::boltzmann::BoltzmannCalculator;
use crate::core::models::conf::{Conf, ConfIndex};
use crate::core::models::node::Node;
use crate::core::models::sequence::Sequence;
use crate::core::models::space::{MultiStateSpace, StateId, StateSpace};
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;

/// Why a subtree met during in-place refinement was left for later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// Its bound lies past the current sweep threshold.
    Threshold,
    /// The stopping criterion does not want it refined now.
    Filter,
}

/// The outcome of [`BoundCalculator::refine_subtree`]. The bounds of the four
/// node lists together replace the bound of the refined node.
#[derive(Debug, Default)]
pub struct SubtreeRefinement {
    /// Complete conformations reached; their exact energies are still needed.
    pub leaves: Vec<Node>,
    pub deferred: Vec<Node>,
    pub held: Vec<Node>,
    pub pruned: Vec<Node>,
    /// Inner nodes expanded, the refined node included.
    pub expanded: u64,
}

/// Computes rigorous per-sequence upper bounds on subtree partition functions
/// for one state.
///
/// For a partial conformation the bound is `exp(-E_lb / RT) * C`, where `E_lb`
/// is an A*-style lower bound on the energy of every leaf below it and `C` is
/// the product, over undefined positions, of the largest number of choices
/// sharing one residue type (all choices, for immutable positions). `C` bounds
/// the number of leaves of any single sequence in the subtree, so the bound
/// holds for each reachable sequence separately rather than for their sum.
///
/// `E_lb` is the exact energy of the defined positions plus, for each undefined
/// position `u`, the best case over its choices of its singles, its pairs with
/// defined positions, and the best-case pairs with undefined positions before
/// `u`. Assigning a position can only raise `E_lb`, so children never exceed
/// their parent, and children sharing a sequence never exceed it in sum.
#[derive(Debug, Clone)]
pub struct BoundCalculator {
    space: Arc<MultiStateSpace>,
    state: StateId,
    rcs: Rcs,
    bcalc: BoltzmannCalculator,
    z_prune: BigExp,
    /// `min_pair[u][r][v]` for `v < u`: best pair energy of `(u, r)` with any choice at `v`.
    min_pair: Vec<Vec<Vec<f64>>>,
    counts: Vec<usize>,
    permutation: Vec<usize>,
}

impl BoundCalculator {
    pub fn new(
        space: Arc<MultiStateSpace>,
        state: StateId,
        rcs: Rcs,
        bcalc: BoltzmannCalculator,
        z_prune: BigExp,
    ) -> Result<Self, EngineError> {
        let state_space = space
            .state(state)
            .ok_or_else(|| EngineError::Initialization(format!("{state} does not exist")))?;
        let conf_space = &state_space.conf_space;
        if rcs.num_positions() != conf_space.num_positions() {
            return Err(EngineError::Initialization(format!(
                "{state}: choice table covers {} positions, state has {}",
                rcs.num_positions(),
                conf_space.num_positions()
            )));
        }
        if rcs.has_empty_position() {
            return Err(EngineError::Initialization(format!(
                "{state} has a position without legal choices"
            )));
        }

        let emat = &state_space.emat;
        let n = conf_space.num_positions();
        let min_pair = (0..n)
            .map(|u| {
                (0..emat.num_rcs(u))
                    .map(|r| {
                        (0..u)
                            .map(|v| {
                                rcs.get(v)
                                    .iter()
                                    .map(|&s| emat.pair(u, r, v, s))
                                    .fold(f64::INFINITY, f64::min)
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();

        let counts = (0..n)
            .map(|pos| {
                let position = &conf_space.positions[pos];
                if position.seq_pos.is_some() {
                    rcs.get(pos)
                        .iter()
                        .counts_by(|&rc| position.rcs[rc].label)
                        .into_values()
                        .max()
                        .unwrap_or(0)
                } else {
                    rcs.get(pos).len()
                }
            })
            .collect();

        // mutable positions first; resolving sequence identity early shrinks
        // the count multiplier fastest
        let permutation = (0..n)
            .sorted_by_key(|&pos| (!conf_space.is_mutable(pos), pos))
            .collect();

        Ok(Self {
            space,
            state,
            rcs,
            bcalc,
            z_prune,
            min_pair,
            counts,
            permutation,
        })
    }

    #[inline]
    pub fn state(&self) -> StateId {
        self.state
    }

    #[inline]
    pub fn state_space(&self) -> &StateSpace {
        &self.space.states[self.state.index()]
    }

    #[inline]
    pub fn rcs(&self) -> &Rcs {
        &self.rcs
    }

    #[inline]
    pub fn bcalc(&self) -> &BoltzmannCalculator {
        &self.bcalc
    }

    #[inline]
    pub fn z_prune(&self) -> BigExp {
        self.z_prune
    }

    #[inline]
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    #[inline]
    pub fn num_positions(&self) -> usize {
        self.counts.len()
    }

    pub fn project(&self, conf: &Conf) -> Sequence {
        self.state_space().conf_space.project(conf)
    }

    pub fn root(&self) -> Node {
        let conf = Conf::unassigned(self.num_positions());
        let z_upper = self.upper_bound(&ConfIndex::new(&conf));
        Node::new(self.state, conf, z_upper)
    }

    /// Exact energy of the defined positions, including the constant term.
    pub fn head_energy(&self, index: &ConfIndex) -> f64 {
        let emat = &self.state_space().emat;
        let defined = index.defined();
        let mut energy = emat.constant();
        for (i, &(pos1, rc1)) in defined.iter().enumerate() {
            energy += emat.one(pos1, rc1);
            for &(pos2, rc2) in &defined[..i] {
                energy += emat.pair(pos1, rc1, pos2, rc2);
            }
        }
        energy
    }

    /// Optimistic energy of the undefined positions given the defined ones.
    pub fn tail_energy(&self, index: &ConfIndex) -> f64 {
        let emat = &self.state_space().emat;
        let undefined = index.undefined();
        undefined
            .iter()
            .enumerate()
            .map(|(i, &u)| {
                self.rcs
                    .get(u)
                    .iter()
                    .map(|&r| {
                        let mut energy = emat.one(u, r);
                        for &(pos, rc) in index.defined() {
                            energy += emat.pair(u, r, pos, rc);
                        }
                        for &v in &undefined[..i] {
                            energy += self.min_pair[u][r][v];
                        }
                        energy
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .sum()
    }

    pub fn count_multiplier(&self, index: &ConfIndex) -> BigExp {
        index
            .undefined()
            .iter()
            .fold(BigExp::ONE, |acc, &pos| acc * self.counts[pos] as f64)
    }

    /// Upper bound on the partition function of any single sequence in the subtree.
    pub fn upper_bound(&self, index: &ConfIndex) -> BigExp {
        let energy = self.head_energy(index) + self.tail_energy(index);
        self.bcalc.calc(energy) * self.count_multiplier(index)
    }

    pub fn exact_leaf_z(
        &self,
        conf: &Conf,
        evaluator: &dyn LeafEvaluator,
    ) -> Result<BigExp, EngineError> {
        let energy = evaluator
            .energy(self.state, conf)
            .map_err(|e| EngineError::Evaluation {
                state: self.state,
                conf: conf.clone(),
                reason: e.0,
            })?;
        Ok(self.bcalc.calc(energy))
    }

    #[inline]
    pub fn below_prune_threshold(&self, z: BigExp) -> bool {
        z < self.z_prune
    }

    /// The next position to assign, following the mutable-first permutation.
    pub fn next_position(&self, index: &ConfIndex) -> Option<usize> {
        self.permutation
            .iter()
            .copied()
            .find(|&pos| index.choice_at(pos).is_none())
    }

    /// Partitions a node's subtree into one child per legal choice at the next position.
    pub fn expand(&self, node: &Node) -> Result<Vec<Node>, EngineError> {
        let mut index = ConfIndex::new(&node.conf);
        let Some(pos) = self.next_position(&index) else {
            return Ok(Vec::new());
        };
        let mut children = Vec::with_capacity(self.rcs.get(pos).len());
        for &rc in self.rcs.get(pos) {
            index.assign_in_place(pos, rc)?;
            let z_upper = self.upper_bound(&index);
            index.unassign_in_place(pos)?;
            children.push(Node::new(self.state, node.conf.assign(pos, rc)?, z_upper));
        }
        Ok(children)
    }

    /// Refines the subtree of `node` depth first without going through the
    /// frontier. Every descendant is offered to `defer` before it is expanded
    /// or resolved; the ones it holds back end up in the result unrefined.
    /// Pruning comes first and `node` itself is never offered.
    pub fn refine_subtree<F>(&self, node: &Node, mut defer: F) -> Result<SubtreeRefinement, EngineError>
    where
        F: FnMut(&Node) -> Option<Deferral>,
    {
        let mut index = ConfIndex::new(&node.conf);
        let mut out = SubtreeRefinement::default();
        self.refine_at(&mut index, node.z_upper, true, &mut defer, &mut out)?;
        Ok(out)
    }

    fn refine_at<F>(
        &self,
        index: &mut ConfIndex,
        z_upper: BigExp,
        top: bool,
        defer: &mut F,
        out: &mut SubtreeRefinement,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&Node) -> Option<Deferral>,
    {
        let node = Node::new(self.state, index.to_conf(), z_upper);
        if self.below_prune_threshold(z_upper) {
            out.pruned.push(node);
            return Ok(());
        }
        if !top {
            match defer(&node) {
                Some(Deferral::Threshold) => {
                    out.deferred.push(node);
                    return Ok(());
                }
                Some(Deferral::Filter) => {
                    out.held.push(node);
                    return Ok(());
                }
                None => {}
            }
        }
        let Some(pos) = self.next_position(index) else {
            out.leaves.push(node);
            return Ok(());
        };

        out.expanded += 1;
        for &rc in self.rcs.get(pos) {
            index.assign_in_place(pos, rc)?;
            let child_z = self.upper_bound(index);
            let result = self.refine_at(index, child_z, false, defer, out);
            index.unassign_in_place(pos)?;
            result?;
        }
        Ok(())
    }

    /// Every complete conformation below `conf`. Only for small spaces.
    pub fn leaves_below(&self, conf: &Conf) -> Result<Vec<Conf>, EngineError> {
        let mut index = ConfIndex::new(conf);
        let mut leaves = Vec::new();
        self.collect_leaves(&mut index, &mut leaves)?;
        Ok(leaves)
    }

    fn collect_leaves(&self, index: &mut ConfIndex, out: &mut Vec<Conf>) -> Result<(), EngineError> {
        let Some(pos) = self.next_position(index) else {
            out.push(index.to_conf());
            return Ok(());
        };
        for &rc in self.rcs.get(pos) {
            index.assign_in_place(pos, rc)?;
            self.collect_leaves(index, out)?;
            index.unassign_in_place(pos)?;
        }
        Ok(())
    }

    /// Exact partition function of every sequence, by full enumeration.
    pub fn brute_force_z_by_sequence(
        &self,
        evaluator: &dyn LeafEvaluator,
    ) -> Result<HashMap<Sequence, BigExp>, EngineError> {
        let root = Conf::unassigned(self.num_positions());
        let mut sums: HashMap<Sequence, BigExp> = HashMap::new();
        for leaf in self.leaves_below(&root)? {
            let z = self.exact_leaf_z(&leaf, evaluator)?;
            *sums.entry(self.project(&leaf)).or_default() += z;
        }
        Ok(sums)
    }

    /// Number of leaves of every sequence, by full enumeration.
    pub fn brute_force_leaf_counts(&self) -> Result<HashMap<Sequence, u64>, EngineError> {
        let root = Conf::unassigned(self.num_positions());
        Ok(self
            .leaves_below(&root)?
            .iter()
            .map(|leaf| self.project(leaf))
            .counts()
            .into_iter()
            .map(|(seq, n)| (seq, n as u64))
            .collect())
    }
}
