use super::FrontierError;
use super::ring::RingStore;
use crate::core::math::bigexp::BigExp;
use crate::core::math::boltzmann::BoltzmannCalculator;
use crate::core::models::node::Node;
use crate::core::models::space::StateId;
use tracing::debug;

const TAG_UNSET: u64 = u64::MAX;
const TAG_LIFTED: u64 = u64::MAX - 1;

/// Free energy above which nodes wait for a later sweep step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepThreshold {
    /// Not yet set; the first read sets it from the best node.
    Unset,
    At(f64),
    /// Past the prune threshold: every node is expanded.
    Lifted,
}

impl SweepThreshold {
    fn to_tag(self) -> u64 {
        match self {
            SweepThreshold::Unset => TAG_UNSET,
            SweepThreshold::Lifted => TAG_LIFTED,
            SweepThreshold::At(g) => g.to_bits(),
        }
    }

    fn from_tag(tag: u64) -> Self {
        match tag {
            TAG_UNSET => SweepThreshold::Unset,
            TAG_LIFTED => SweepThreshold::Lifted,
            bits => SweepThreshold::At(f64::from_bits(bits)),
        }
    }

    /// Whether a bound of `z_upper` may be refined under this threshold.
    pub fn admits(self, z_upper: BigExp, bcalc: &BoltzmannCalculator) -> bool {
        match self {
            SweepThreshold::Unset | SweepThreshold::Lifted => true,
            SweepThreshold::At(g) => bcalc.free_energy(z_upper) <= g,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Advanced(SweepThreshold),
    /// A step with the threshold already lifted refined nothing.
    Stalled,
    Exhausted,
}

/// Two rings per state: the one being read and the one collecting deferred
/// nodes. Both share the state's capacity.
///
/// Ring tags persist the sweep position: the first ring of each state records
/// which ring is current, the second records the threshold.
#[derive(Debug)]
pub struct SweepFrontier {
    store: RingStore,
    num_states: usize,
    capacity: usize,
    increment: f64,
    g_upper: f64,
    bcalc: BoltzmannCalculator,
    progressed: Vec<bool>,
}

impl SweepFrontier {
    pub fn new(
        mut store: RingStore,
        num_states: usize,
        increment: f64,
        g_upper: f64,
        bcalc: BoltzmannCalculator,
        resumed: bool,
    ) -> Result<Self, FrontierError> {
        if !resumed {
            for s in 0..num_states {
                store.set_tag(2 * s, 0)?;
                store.set_tag(2 * s + 1, TAG_UNSET)?;
            }
        }
        let capacity = store.capacity();
        Ok(Self {
            store,
            num_states,
            capacity,
            increment,
            g_upper,
            bcalc,
            progressed: vec![false; num_states],
        })
    }

    /// Number of rings the store must provide for `num_states` states.
    pub fn regions_for(num_states: usize) -> usize {
        2 * num_states
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn current(&self, state: StateId) -> usize {
        let s = state.index();
        2 * s + (self.store.tag(2 * s) as usize & 1)
    }

    fn next(&self, state: StateId) -> usize {
        let s = state.index();
        2 * s + (1 - (self.store.tag(2 * s) as usize & 1))
    }

    pub fn threshold(&self, state: StateId) -> SweepThreshold {
        SweepThreshold::from_tag(self.store.tag(2 * state.index() + 1))
    }

    fn set_threshold(&mut self, state: StateId, threshold: SweepThreshold) -> Result<(), FrontierError> {
        self.store.set_tag(2 * state.index() + 1, threshold.to_tag())
    }

    pub fn len(&self, state: StateId) -> usize {
        self.store.len(self.current(state)) + self.store.len(self.next(state))
    }

    pub fn capacity_remaining(&self, state: StateId) -> usize {
        self.capacity.saturating_sub(self.len(state))
    }

    /// Whether `node` lies at or above the current sweep threshold.
    pub fn accepts(&self, node: &Node) -> bool {
        self.threshold(node.state).admits(node.z_upper, &self.bcalc)
    }

    pub fn pop(&mut self, state: StateId) -> Result<Option<Node>, FrontierError> {
        let current = self.current(state);
        if self.store.is_empty(current) {
            return Ok(None);
        }
        if self.threshold(state) == SweepThreshold::Unset {
            let g = self.best_free_energy(current)?;
            self.set_threshold(state, SweepThreshold::At(g))?;
        }
        self.store.pop_front(current)
    }

    /// Adds a child for reading in the current step.
    pub fn push(&mut self, node: Node) -> Result<(), FrontierError> {
        let state = node.state;
        let region = self.current(state);
        self.push_to(region, node)?;
        self.note_progress(state);
        Ok(())
    }

    /// Defers a node to the next step.
    pub fn requeue(&mut self, node: Node) -> Result<(), FrontierError> {
        let region = self.next(node.state);
        self.push_to(region, node)
    }

    pub fn restore(&mut self, node: Node) -> Result<(), FrontierError> {
        let region = self.current(node.state);
        self.push_to(region, node)
    }

    /// Records that the current step removed bound mass without pushing children.
    pub fn note_progress(&mut self, state: StateId) {
        if let Some(flag) = self.progressed.get_mut(state.index()) {
            *flag = true;
        }
    }

    fn push_to(&mut self, region: usize, node: Node) -> Result<(), FrontierError> {
        let state = node.state;
        if state.index() >= self.num_states {
            return Err(FrontierError::UnknownState { state });
        }
        if self.len(state) >= self.capacity {
            return Err(FrontierError::Full {
                state,
                capacity: self.capacity,
            });
        }
        match self.store.push_back(region, node)? {
            None => Ok(()),
            Some(_) => Err(FrontierError::Full {
                state,
                capacity: self.capacity,
            }),
        }
    }

    /// Ends the sweep step of `state`: the deferred ring becomes current and
    /// the threshold rises. Only valid once the current ring is drained and no
    /// node of the state is in flight.
    pub fn end_step(&mut self, state: StateId) -> Result<StepOutcome, FrontierError> {
        if self.len(state) == 0 {
            return Ok(StepOutcome::Exhausted);
        }
        let s = state.index();
        let previous = self.threshold(state);
        let progressed = std::mem::replace(&mut self.progressed[s], false);

        let flipped = (self.store.tag(2 * s) & 1) ^ 1;
        self.store.set_tag(2 * s, flipped)?;

        if previous == SweepThreshold::Lifted && !progressed {
            return Ok(StepOutcome::Stalled);
        }

        let best = self.best_free_energy(self.current(state))?;
        let raised = match previous {
            SweepThreshold::Lifted => SweepThreshold::Lifted,
            SweepThreshold::Unset => SweepThreshold::At(best),
            SweepThreshold::At(g) => SweepThreshold::At((g + self.increment).max(best)),
        };
        let threshold = match raised {
            SweepThreshold::At(g) if g > self.g_upper => SweepThreshold::Lifted,
            other => other,
        };
        self.set_threshold(state, threshold)?;
        debug!(%state, ?threshold, nodes = self.len(state), "Sweep step finished.");
        Ok(StepOutcome::Advanced(threshold))
    }

    fn best_free_energy(&mut self, region: usize) -> Result<f64, FrontierError> {
        let best = self
            .store
            .nodes(region)?
            .iter()
            .map(|n| n.z_upper)
            .fold(BigExp::ZERO, BigExp::max);
        Ok(self.bcalc.free_energy(best))
    }

    pub fn nodes(&mut self, state: StateId) -> Result<Vec<Node>, FrontierError> {
        let mut nodes = self.store.nodes(self.current(state))?;
        nodes.extend(self.store.nodes(self.next(state))?);
        Ok(nodes)
    }

    pub fn flush(&mut self) -> Result<(), FrontierError> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::conf::Conf;

    const S0: StateId = StateId(0);

    fn frontier(capacity: usize, increment: f64, g_upper: f64) -> SweepFrontier {
        SweepFrontier::new(
            RingStore::memory(2, capacity),
            1,
            increment,
            g_upper,
            BoltzmannCalculator::default(),
            false,
        )
        .unwrap()
    }

    /// A node whose free energy is `g`.
    fn node_at(g: f64, choice: usize) -> Node {
        let bcalc = BoltzmannCalculator::default();
        Node::new(S0, Conf::from_choices(&[choice]).unwrap(), bcalc.calc(g))
    }

    #[test]
    fn reads_in_arrival_order() {
        let mut f = frontier(4, 1.0, 10.0);
        for i in 0..3 {
            f.push(node_at(-(i as f64), i)).unwrap();
        }
        let order: Vec<usize> = std::iter::from_fn(|| f.pop(S0).unwrap())
            .map(|n| n.conf.get(0).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn first_read_sets_threshold_from_best_node() {
        let mut f = frontier(4, 1.0, 10.0);
        f.push(node_at(-1.0, 0)).unwrap();
        f.push(node_at(-3.0, 1)).unwrap();
        assert_eq!(f.threshold(S0), SweepThreshold::Unset);

        let first = f.pop(S0).unwrap().unwrap();
        let SweepThreshold::At(g) = f.threshold(S0) else {
            panic!("threshold not set");
        };
        assert!((g + 3.0).abs() < 1e-9);
        assert!(!f.accepts(&first));
        assert!(f.accepts(&node_at(-3.0, 1)));
    }

    #[test]
    fn deferred_nodes_come_back_after_the_step_with_a_higher_threshold() {
        let mut f = frontier(4, 0.5, 10.0);
        f.push(node_at(-2.0, 0)).unwrap();
        f.push(node_at(0.0, 1)).unwrap();

        let best = f.pop(S0).unwrap().unwrap();
        assert!(f.accepts(&best));
        f.note_progress(S0);
        let worse = f.pop(S0).unwrap().unwrap();
        assert!(!f.accepts(&worse));
        f.requeue(worse).unwrap();
        assert_eq!(f.pop(S0).unwrap(), None);
        assert_eq!(f.len(S0), 1);

        // jumps straight to the best remaining node rather than stepping by 0.5
        let StepOutcome::Advanced(SweepThreshold::At(g)) = f.end_step(S0).unwrap() else {
            panic!("step did not advance");
        };
        assert!(g.abs() < 1e-9);
        let again = f.pop(S0).unwrap().unwrap();
        assert!(f.accepts(&again));
    }

    #[test]
    fn threshold_lifts_past_the_upper_limit() {
        let mut f = frontier(4, 5.0, 1.0);
        f.push(node_at(-1.0, 0)).unwrap();
        let n = f.pop(S0).unwrap().unwrap();
        f.requeue(n).unwrap();
        f.note_progress(S0);
        assert_eq!(
            f.end_step(S0).unwrap(),
            StepOutcome::Advanced(SweepThreshold::Lifted)
        );
        assert!(f.accepts(&node_at(100.0, 0)));

        // a lifted step that refines nothing has stalled
        let n = f.pop(S0).unwrap().unwrap();
        f.requeue(n).unwrap();
        assert_eq!(f.end_step(S0).unwrap(), StepOutcome::Stalled);
    }

    #[test]
    fn rings_share_one_capacity() {
        let mut f = frontier(2, 1.0, 10.0);
        f.push(node_at(0.0, 0)).unwrap();
        f.requeue(node_at(0.0, 1)).unwrap();
        assert_eq!(f.capacity_remaining(S0), 0);
        assert!(matches!(
            f.push(node_at(0.0, 2)),
            Err(FrontierError::Full { capacity: 2, .. })
        ));
    }

    #[test]
    fn threshold_admits_bounds_at_or_below_its_free_energy() {
        let bcalc = BoltzmannCalculator::default();
        let at = SweepThreshold::At(-1.0);
        assert!(at.admits(bcalc.calc(-2.0), &bcalc));
        assert!(!at.admits(bcalc.calc(0.5), &bcalc));
        assert!(SweepThreshold::Lifted.admits(bcalc.calc(100.0), &bcalc));
        assert!(SweepThreshold::Unset.admits(BigExp::ZERO, &bcalc));
    }

    #[test]
    fn nodes_of_unknown_states_are_refused() {
        let mut f = frontier(4, 1.0, 10.0);
        let stray = Node::new(StateId(2), Conf::from_choices(&[0]).unwrap(), BigExp::ONE);
        assert!(matches!(
            f.requeue(stray.clone()),
            Err(FrontierError::UnknownState { state: StateId(2) })
        ));
        assert!(matches!(f.push(stray), Err(FrontierError::UnknownState { .. })));
    }

    #[test]
    fn empty_state_is_exhausted() {
        let mut f = frontier(2, 1.0, 10.0);
        assert_eq!(f.end_step(S0).unwrap(), StepOutcome::Exhausted);
    }

    #[test]
    fn sweep_position_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frontier");
        let codec = crate::core::io::records::RecordCodec::new(vec![1]);
        let bytes = (codec.record_size() * 2 * 4) as u64;
        let open = |fresh| {
            let (store, resumed) = RingStore::disk(&path, codec.clone(), 2, bytes, fresh).unwrap();
            SweepFrontier::new(store, 1, 1.0, 10.0, BoltzmannCalculator::default(), resumed)
                .unwrap()
        };

        let mut f = open(true);
        f.push(node_at(-2.0, 0)).unwrap();
        f.push(node_at(1.0, 1)).unwrap();
        f.pop(S0).unwrap();
        let deferred = f.pop(S0).unwrap().unwrap();
        f.requeue(deferred.clone()).unwrap();
        f.note_progress(S0);
        f.end_step(S0).unwrap();
        let threshold = f.threshold(S0);
        f.flush().unwrap();
        drop(f);

        let mut f = open(false);
        assert_eq!(f.threshold(S0), threshold);
        assert_eq!(f.pop(S0).unwrap(), Some(deferred));
    }
}
