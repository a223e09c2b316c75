use super::estimate::{Conservation, RefineEnd, build_calcs, check_capacity, record_codec};
use crate::core::math::bigexp::BigExp;
use crate::core::models::node::Node;
use crate::core::models::space::{MultiStateSpace, StateId};
use crate::engine::batch::MinimizationQueue;
use crate::engine::bounds::BoundCalculator;
use crate::engine::config::{ConfigError, EstimatorConfig, FrontierMode, PhaseConfig};
use crate::engine::context::{batch_size, RefinementContext};
use crate::engine::coordinator::{CoordinationError, Directions, Mailboxes, PhaseBarrier};
use crate::engine::criterion::{RefinementSnapshot, Satisfaction, StoppingCriterion};
use crate::engine::error::EngineError;
use crate::engine::evaluator::LeafEvaluator;
use crate::engine::frontier::priority::PriorityFrontier;
use crate::engine::frontier::{Frontier, FrontierSnapshot};
use crate::engine::ledger::{LedgerBook, LedgerTransaction, SequenceLedger};
use crate::engine::perf::NodePerformance;
use crate::engine::processor::{
    IdlePolicy, InFlight, PhaseControl, PhaseStats, Processor, WorkerExit, Workspace,
};
use crate::engine::progress::{Progress, ProgressReporter};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, instrument, warn};

/// Nodes a member reads between two looks at its inbox.
const NODES_PER_ROUND: usize = 32;
/// Nodes handed to a starving member at once.
const NODES_PER_TRANSFER: usize = 4;
/// Director polls without progress, with every member starving, before the
/// focused state counts as stalled.
const STALL_POLLS: usize = 50;

#[derive(Debug, Clone)]
pub struct ClusterReport {
    pub ended: RefineEnd,
    /// How often the director consulted the stopping criterion.
    pub checks: usize,
    pub totals: Vec<PhaseStats>,
    pub ledger: LedgerBook,
    pub conservation: Vec<Conservation>,
}

struct Member {
    frontier: Mutex<Frontier>,
    queue: Mutex<MinimizationQueue>,
    in_flight: InFlight,
    hungry: AtomicBool,
}

/// State every member thread and the director share.
struct Cluster<'a> {
    config: &'a EstimatorConfig,
    calcs: Vec<BoundCalculator>,
    evaluator: &'a dyn LeafEvaluator,
    criterion: &'a dyn StoppingCriterion,
    reporter: &'a ProgressReporter<'a>,
    ledger: Mutex<SequenceLedger>,
    perf: NodePerformance,
    members: Vec<Member>,
    directions: Directions,
    mailboxes: Mailboxes,
    barrier: PhaseBarrier,
    /// Bumped whenever a node moves between members.
    transfers: AtomicU64,
    totals: Mutex<Vec<PhaseStats>>,
    /// Nodes pruned, expanded or resolved so far, over all members.
    progressed: AtomicU64,
}

/// Refines every state with `num_members` worker threads.
///
/// The calling thread directs: it credits the root nodes, picks the focused
/// state and consults the stopping criterion. Each member refines nodes of the
/// focused state from its own priority frontier; a member that runs dry asks
/// for work and receives its peers' best nodes through idempotent mailboxes.
/// Members and director meet at the `assemble`, `roots` and `teardown`
/// barriers.
#[instrument(skip_all, name = "cluster_run", fields(members = num_members))]
pub fn run(
    space: Arc<MultiStateSpace>,
    config: &EstimatorConfig,
    num_members: usize,
    evaluator: &dyn LeafEvaluator,
    criterion: &dyn StoppingCriterion,
    reporter: &ProgressReporter,
) -> Result<ClusterReport, EngineError> {
    // === Phase 0: Validation and assembly ===
    reporter.report(Progress::PhaseStart {
        name: "Assembling cluster",
    });
    if num_members == 0 {
        return Err(ConfigError::InvalidValue {
            parameter: "members",
            reason: "must be at least 1".to_string(),
        }
        .into());
    }
    if !matches!(config.mode, FrontierMode::Priority { .. }) {
        return Err(ConfigError::InvalidValue {
            parameter: "mode",
            reason: "cluster runs use the priority frontier".to_string(),
        }
        .into());
    }
    if config.storage.frontier_file.is_some() {
        return Err(ConfigError::InvalidValue {
            parameter: "frontier_file",
            reason: "cluster members keep their frontiers in memory".to_string(),
        }
        .into());
    }
    let cluster = Cluster::assemble(space, config, num_members, evaluator, criterion, reporter)?;
    reporter.report(Progress::PhaseFinish);

    // === Phase 1: Refinement ===
    reporter.report(Progress::PhaseStart { name: "Refinement" });
    let (directed, member_results) = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..num_members)
            .map(|m| {
                let cluster = &cluster;
                scope.spawn(move || cluster.member(m))
            })
            .collect();
        let directed = cluster.direct();
        let results: Vec<Result<(), EngineError>> = handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(EngineError::Internal("cluster member panicked".to_string()))
                })
            })
            .collect();
        (directed, results)
    });
    reporter.report(Progress::PhaseFinish);

    // === Phase 2: Results ===
    // a failing thread aborts the barrier, so report the error that caused it
    let mut errors: Vec<EngineError> = member_results.into_iter().filter_map(Result::err).collect();
    let (ended, checks) = match directed {
        Ok(outcome) => outcome,
        Err(e) => {
            errors.insert(0, e);
            (RefineEnd::Stopped, 0)
        }
    };
    if !errors.is_empty() {
        let cause = errors.iter().position(|e| {
            !matches!(
                e,
                EngineError::Coordination {
                    source: CoordinationError::Aborted { .. }
                }
            )
        });
        return Err(errors.swap_remove(cause.unwrap_or(0)));
    }
    let totals = cluster.totals.lock().clone();

    cluster.ledger.lock().sync()?;
    let conservation = cluster.conservation()?;
    let ledger = cluster.ledger.lock().snapshot();
    info!(ended = ?ended, checks, "Cluster run finished.");
    Ok(ClusterReport {
        ended,
        checks,
        totals,
        ledger,
        conservation,
    })
}

impl<'a> Cluster<'a> {
    fn assemble(
        space: Arc<MultiStateSpace>,
        config: &'a EstimatorConfig,
        num_members: usize,
        evaluator: &'a dyn LeafEvaluator,
        criterion: &'a dyn StoppingCriterion,
        reporter: &'a ProgressReporter<'a>,
    ) -> Result<Self, EngineError> {
        let num_states = space.states.len();
        let calcs = build_calcs(&space, config, None)?;
        let capacity =
            (config.storage.frontier_mem_bytes / record_codec(&space).record_size() as u64) as usize;
        let batch_size = batch_size(config, evaluator);

        let members = (0..num_members)
            .map(|_| {
                let frontier = Frontier::Priority(PriorityFrontier::new(num_states, capacity, None));
                check_capacity(&frontier, &calcs)?;
                Ok(Member {
                    frontier: Mutex::new(frontier),
                    queue: Mutex::new(MinimizationQueue::new(num_states, batch_size)),
                    in_flight: InFlight::new(num_states),
                    hungry: AtomicBool::new(false),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let ledger = match &config.storage.ledger_file {
            Some(path) => SequenceLedger::open(
                path,
                num_states,
                space.seq_space.len(),
                &config.soundness,
                true,
            )?,
            None => SequenceLedger::in_memory(num_states, &config.soundness),
        };
        let depths: Vec<usize> = calcs.iter().map(BoundCalculator::num_positions).collect();

        Ok(Self {
            config,
            calcs,
            evaluator,
            criterion,
            reporter,
            ledger: Mutex::new(ledger),
            perf: NodePerformance::new(&depths),
            members,
            directions: Directions::new(num_members),
            mailboxes: Mailboxes::new(num_members),
            barrier: PhaseBarrier::new(num_members + 1, config.concurrency.barrier_timeout),
            transfers: AtomicU64::new(0),
            totals: Mutex::new(vec![PhaseStats::default(); num_states]),
            progressed: AtomicU64::new(0),
        })
    }

    fn processor(&self, m: usize) -> Processor<'_> {
        let member = &self.members[m];
        let ctx = RefinementContext::new(self.config, &self.calcs, self.evaluator, self.criterion);
        let ws = Workspace {
            frontier: &member.frontier,
            ledger: &self.ledger,
            perf: &self.perf,
            queue: &member.queue,
            in_flight: &member.in_flight,
        };
        Processor::new(ctx, ws, &self.directions, m, None)
    }

    /// The director's side of the run. Returns how the run ended and how
    /// many times the criterion was consulted.
    fn direct(&self) -> Result<(RefineEnd, usize), EngineError> {
        let result = self.direct_inner();
        if result.is_err() {
            self.directions.stop();
            self.barrier.abort();
        }
        result
    }

    fn direct_inner(&self) -> Result<(RefineEnd, usize), EngineError> {
        self.barrier.wait("assemble")?;
        self.push_roots()?;
        self.barrier.wait("roots")?;

        let poll = self.config.concurrency.poll_interval;
        let mut finished: Vec<Option<WorkerExit>> = vec![None; self.calcs.len()];
        let mut checks = 0;
        let mut last_progress = 0;
        let mut idle_polls = 0;
        let ended = loop {
            checks += 1;
            let snapshot = self.snapshot(checks);
            if self.criterion.is_satisfied(&snapshot) == Satisfaction::Terminate {
                break RefineEnd::Criterion;
            }
            if !self.directions.is_running() {
                break RefineEnd::Stopped;
            }

            let progressed = self.progressed.load(Ordering::Acquire);
            let starving = self.members.iter().all(|m| m.hungry.load(Ordering::Acquire));
            if progressed == last_progress && starving {
                idle_polls += 1;
            } else {
                idle_polls = 0;
            }
            last_progress = progressed;

            if let Some(state) = self.directions.focused_state() {
                let exit = if self.is_exhausted(state) {
                    Some(WorkerExit::Exhausted)
                } else if idle_polls >= STALL_POLLS {
                    Some(WorkerExit::Stalled)
                } else {
                    None
                };
                if let Some(exit) = exit {
                    debug!(%state, exit = ?exit, "Cluster is done with state.");
                    finished[state.index()] = Some(exit);
                    self.directions.set_focused_state(None);
                    idle_polls = 0;
                }
            }
            if self.directions.focused_state().is_none() {
                match self.pick_focus(&finished) {
                    Some(state) => {
                        debug!(%state, "Focusing cluster.");
                        self.directions.set_focused_state(Some(state));
                    }
                    None if finished.iter().all(|f| *f == Some(WorkerExit::Exhausted)) => {
                        break RefineEnd::Exhausted;
                    }
                    None => break RefineEnd::Stalled,
                }
            }

            self.reassign(&finished);

            self.reporter.report(Progress::StatusUpdate {
                text: format!(
                    "check {checks}: {} nodes, {} in transfer, {progressed} refined",
                    snapshot.frontier.total(),
                    self.mailboxes.total_len()
                ),
            });
            std::thread::sleep(poll);
        };

        self.directions.stop();
        self.barrier.wait("teardown")?;
        Ok((ended, checks))
    }

    fn push_roots(&self) -> Result<(), EngineError> {
        let mut tx = LedgerTransaction::new();
        for (i, calc) in self.calcs.iter().enumerate() {
            let mut root = calc.root();
            root.score = self.perf.score(&root);
            tx.add_root(root.state, calc.project(&root.conf), root.z_upper);
            let member = &self.members[i % self.members.len()];
            let mut frontier = member.frontier.lock();
            let mut dropped = Vec::new();
            {
                let mut sink = |n: &Node| dropped.push(n.clone());
                frontier.push(root, &mut sink)?;
            }
            for node in &dropped {
                let owner = &self.calcs[node.state.index()];
                tx.drop_pending(node.state, owner.project(&node.conf), node.z_upper);
            }
        }
        self.ledger.lock().commit(tx)?;
        Ok(())
    }

    /// Points each starving member that holds no node of the focused state at
    /// another unfinished state it does hold. Assignments end once the state
    /// is finished or the member has nothing of it left.
    fn reassign(&self, finished: &[Option<WorkerExit>]) {
        let focus = self.directions.focused_state();
        for (m, member) in self.members.iter().enumerate() {
            let frontier = member.frontier.lock();
            if let Some(state) = self.directions.assignment(m) {
                let done = finished[state.index()].is_some()
                    || (frontier.is_empty(state) && member.in_flight.count(state) == 0);
                if done {
                    debug!(member = m, %state, "Releasing member from its assignment.");
                    self.directions.assign(m, None);
                }
                continue;
            }
            if !member.hungry.load(Ordering::Acquire) {
                continue;
            }
            if focus.is_some_and(|state| !frontier.is_empty(state)) {
                continue;
            }
            let other = self.calcs.iter().map(BoundCalculator::state).find(|&state| {
                Some(state) != focus && finished[state.index()].is_none() && !frontier.is_empty(state)
            });
            if let Some(state) = other {
                debug!(member = m, %state, "Assigning starving member to a state it holds.");
                self.directions.assign(m, Some(state));
                member.hungry.store(false, Ordering::Release);
            }
        }
    }

    fn pick_focus(&self, finished: &[Option<WorkerExit>]) -> Option<StateId> {
        let ledger = self.ledger.lock();
        let mut best: Option<(StateId, BigExp)> = None;
        for calc in &self.calcs {
            let state = calc.state();
            if finished[state.index()].is_some() {
                continue;
            }
            let pending = ledger.book().sum_pending(state);
            if best.as_ref().is_none_or(|(_, b)| pending > *b) {
                best = Some((state, pending));
            }
        }
        best.map(|(state, _)| state)
    }

    /// Whether no member holds, refines or is being sent a node of `state`.
    ///
    /// Within a member, the frontier and the in-flight count change together
    /// under its frontier lock, so only transfers can hide a node from a
    /// member-by-member scan; the scan is repeated until no transfer
    /// overlapped it.
    fn is_exhausted(&self, state: StateId) -> bool {
        loop {
            let before = self.transfers.load(Ordering::Acquire);
            let empty = self.members.iter().all(|member| {
                let frontier = member.frontier.lock();
                frontier.is_empty(state) && member.in_flight.count(state) == 0
            }) && self.mailboxes.total_len() == 0;
            if self.transfers.load(Ordering::Acquire) == before {
                return empty;
            }
        }
    }

    fn snapshot(&self, checks: usize) -> RefinementSnapshot {
        let mut frontier = FrontierSnapshot::default();
        for member in &self.members {
            let own = FrontierSnapshot::of(&member.frontier.lock());
            if frontier.nodes.is_empty() {
                frontier = own;
            } else {
                for (total, n) in frontier.nodes.iter_mut().zip(&own.nodes) {
                    *total += n;
                }
                for (total, c) in frontier.capacity.iter_mut().zip(&own.capacity) {
                    *total += c;
                }
            }
        }
        RefinementSnapshot {
            ledger: self.ledger.lock().snapshot(),
            frontier,
            phases: checks,
            totals: self.totals.lock().clone(),
        }
    }

    /// One member thread.
    fn member(&self, m: usize) -> Result<(), EngineError> {
        let result = self.member_inner(m);
        if let Err(e) = &result {
            error!(member = m, error = %e, "Cluster member failed; stopping the run.");
            self.directions.stop();
            self.barrier.abort();
        }
        result
    }

    fn member_inner(&self, m: usize) -> Result<(), EngineError> {
        self.barrier.wait("assemble")?;
        self.barrier.wait("roots")?;

        let processor = self.processor(m);
        let member = &self.members[m];
        let poll = self.config.concurrency.poll_interval;
        let round = PhaseConfig {
            max_nodes: Some(NODES_PER_ROUND),
            max_duration: poll * 10,
        };

        while self.directions.is_running() {
            self.receive(m)?;
            let mut report = processor.run_worker(&PhaseControl::new(&round), IdlePolicy::Exit)?;
            let idle = matches!(report.exit, WorkerExit::Exhausted | WorkerExit::Stalled);
            if idle {
                processor.flush_all(&mut report.stats)?;
            }
            self.record(&report.stats);
            if idle {
                member.hungry.store(true, Ordering::Release);
                member.in_flight.wait(poll);
            }
            self.share(m)?;
        }

        self.receive(m)?;
        let mut stats = vec![PhaseStats::default(); self.calcs.len()];
        processor.flush_all(&mut stats)?;
        self.record(&stats);
        self.barrier.wait("teardown")?;
        Ok(())
    }

    fn record(&self, stats: &[PhaseStats]) {
        let mut totals = self.totals.lock();
        let mut progressed = 0;
        for (total, s) in totals.iter_mut().zip(stats) {
            total.merge(s);
            progressed += s.progress();
        }
        self.progressed.fetch_add(progressed, Ordering::AcqRel);
    }

    /// Moves the nodes waiting in `m`'s inbox into its frontier.
    fn receive(&self, m: usize) -> Result<(), EngineError> {
        let member = &self.members[m];
        let mut frontier = member.frontier.lock();
        if self.mailboxes.len(m) == 0 {
            return Ok(());
        }
        // counted before the nodes leave the mailbox: a scan that finds them
        // in neither place also sees the count change
        self.transfers.fetch_add(1, Ordering::AcqRel);
        let nodes = self.mailboxes.take_all(m);
        member.hungry.store(false, Ordering::Release);
        let mut dropped = Vec::new();
        {
            let mut sink = |n: &Node| dropped.push(n.clone());
            for node in nodes {
                frontier.push(node, &mut sink)?;
            }
        }
        if !dropped.is_empty() {
            warn!(member = m, nodes = dropped.len(), "Received nodes evicted on arrival.");
            let mut tx = LedgerTransaction::new();
            for node in &dropped {
                let calc = &self.calcs[node.state.index()];
                tx.drop_pending(node.state, calc.project(&node.conf), node.z_upper);
            }
            self.ledger.lock().apply(tx)?;
        }
        Ok(())
    }

    /// Hands `m`'s best nodes of the focused state to members waiting for work.
    fn share(&self, m: usize) -> Result<(), EngineError> {
        let Some(state) = self.directions.state_for(m) else {
            return Ok(());
        };
        for (peer, other) in self.members.iter().enumerate() {
            if peer == m || !other.hungry.load(Ordering::Acquire) {
                continue;
            }
            let mut frontier = self.members[m].frontier.lock();
            let mut sent = 0;
            while sent < NODES_PER_TRANSFER && frontier.len(state) > 1 {
                let Some(node) = frontier.pop(state)? else {
                    break;
                };
                if sent == 0 {
                    self.transfers.fetch_add(1, Ordering::AcqRel);
                }
                let id = self.mailboxes.next_transfer_id();
                self.mailboxes.deliver(peer, id, node);
                sent += 1;
            }
            if sent > 0 {
                other.hungry.store(false, Ordering::Release);
                debug!(from = m, to = peer, nodes = sent, "Shared nodes.");
            }
        }
        Ok(())
    }

    /// Only meaningful once every member has left its loop.
    fn conservation(&self) -> Result<Vec<Conservation>, EngineError> {
        let mut stored: Vec<BigExp> = vec![BigExp::ZERO; self.calcs.len()];
        for m in 0..self.members.len() {
            for node in self.mailboxes.take_all(m) {
                stored[node.state.index()] += node.z_upper;
            }
        }
        for member in &self.members {
            let mut frontier = member.frontier.lock();
            for calc in &self.calcs {
                stored[calc.state().index()] += frontier.sum_bounds(calc.state())?;
            }
        }
        let ledger = self.ledger.lock();
        let book = ledger.book();
        self.calcs
            .iter()
            .map(|calc| {
                let state = calc.state();
                Ok(Conservation {
                    state,
                    roots: book.totals(state).roots,
                    ledger_pending: book.sum_pending(state),
                    stored_pending: stored[state.index()],
                    residual: book.conservation_residual(state),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::sequence::Sequence;
    use crate::engine::config::EstimatorConfigBuilder;
    use crate::engine::evaluator::PairwiseEvaluator;
    use crate::engine::frontier::NoDrops;
    use crate::test_utils;
    use crate::workflows::estimate::EstimatorBuilder;
    use std::time::Duration;

    fn keep_going(_: &RefinementSnapshot) -> Satisfaction {
        Satisfaction::KeepGoing
    }

    fn config() -> EstimatorConfig {
        EstimatorConfigBuilder::new()
            .mode(FrontierMode::Priority {
                score_staleness: 1.0,
            })
            .frontier_mem_bytes(1 << 20)
            .fatal_violations(true)
            .max_in_flight(2)
            .poll_interval(Duration::from_millis(2))
            .barrier_timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    fn assert_close(actual: BigExp, expected: BigExp) {
        let slack = expected.abs().max(BigExp::ONE) * 1e-9;
        assert!((actual - expected).abs() <= slack, "{actual} != {expected}");
    }

    #[test]
    fn cluster_agrees_with_a_single_process_run() {
        let space = Arc::new(test_utils::random_space(5, 2, 4));
        let evaluator = PairwiseEvaluator::new(space.clone()).with_batch_size(2);
        let config = config();

        let single = {
            let mut estimator = EstimatorBuilder::new(space.clone(), config.clone(), &evaluator)
                .init(false)
                .unwrap();
            estimator.refine(&keep_going).unwrap();
            estimator.ledger()
        };

        let reporter = ProgressReporter::new();
        let report = run(space.clone(), &config, 3, &evaluator, &keep_going, &reporter).unwrap();
        assert_eq!(report.ended, RefineEnd::Exhausted);
        for c in &report.conservation {
            assert!(c.holds(1e-9), "{c:?}");
        }

        let seqs: Vec<Sequence> = single.complete_sequences();
        assert!(!seqs.is_empty());
        for state in space.state_ids() {
            for seq in &seqs {
                let expected = single.bounds(state, seq);
                let actual = report.ledger.bounds(state, seq);
                assert_close(actual.lower, expected.lower);
                assert_close(actual.upper, expected.upper);
            }
        }
        let resolved: u64 = report.totals.iter().map(|t| t.resolved).sum();
        let single_leaves: usize = space
            .states
            .iter()
            .map(|s| s.conf_space.rc_counts().iter().product::<usize>())
            .sum();
        assert!(resolved as usize <= single_leaves);
    }

    #[test]
    fn criterion_ends_a_cluster_run_immediately() {
        let space = Arc::new(test_utils::three_by_two_space());
        let evaluator = PairwiseEvaluator::new(space.clone());
        let stop = |_: &RefinementSnapshot| Satisfaction::Terminate;
        let reporter = ProgressReporter::new();
        let report = run(space, &config(), 2, &evaluator, &stop, &reporter).unwrap();
        assert_eq!(report.ended, RefineEnd::Criterion);
        assert_eq!(report.checks, 1);
        assert!(report.ledger.totals(StateId(0)).roots > BigExp::ZERO);
        for c in &report.conservation {
            assert!(c.holds(1e-9), "{c:?}");
        }
    }

    #[test]
    fn sweep_mode_is_rejected_for_clusters() {
        let space = Arc::new(test_utils::three_by_two_space());
        let evaluator = PairwiseEvaluator::new(space.clone());
        let config = EstimatorConfigBuilder::new()
            .mode(FrontierMode::Sweep { increment: 1.0 })
            .frontier_mem_bytes(1 << 20)
            .build()
            .unwrap();
        let reporter = ProgressReporter::new();
        let result = run(space, &config, 2, &evaluator, &keep_going, &reporter);
        assert!(matches!(
            result,
            Err(EngineError::Config {
                source: ConfigError::InvalidValue { parameter: "mode", .. }
            })
        ));
    }

    #[test]
    fn a_node_in_transit_never_looks_exhausted() {
        let space = Arc::new(test_utils::three_by_two_space());
        let evaluator = PairwiseEvaluator::new(space.clone());
        let config = config();
        let reporter = ProgressReporter::new();
        let cluster =
            Cluster::assemble(space, &config, 2, &evaluator, &keep_going, &reporter).unwrap();
        let state = StateId(0);
        let root = cluster.calcs[0].root();
        cluster.members[0].frontier.lock().push(root, &mut NoDrops).unwrap();

        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for hop in 0..2000 {
                    let (from, to) = if hop % 2 == 0 { (0, 1) } else { (1, 0) };
                    {
                        // the sending half of a share
                        let mut frontier = cluster.members[from].frontier.lock();
                        let node = frontier.pop(state).unwrap().unwrap();
                        cluster.transfers.fetch_add(1, Ordering::AcqRel);
                        cluster.mailboxes.send(to, node);
                    }
                    cluster.receive(to).unwrap();
                }
                done.store(true, Ordering::Release);
            });
            while !done.load(Ordering::Acquire) {
                assert!(!cluster.is_exhausted(state));
            }
        });
        assert!(!cluster.is_exhausted(state));
        assert_eq!(cluster.members[0].frontier.lock().len(state), 1);
    }

    #[test]
    fn receiving_an_empty_inbox_moves_nothing() {
        let space = Arc::new(test_utils::three_by_two_space());
        let evaluator = PairwiseEvaluator::new(space.clone());
        let config = config();
        let reporter = ProgressReporter::new();
        let cluster =
            Cluster::assemble(space, &config, 2, &evaluator, &keep_going, &reporter).unwrap();
        cluster.receive(1).unwrap();
        assert_eq!(cluster.transfers.load(Ordering::Acquire), 0);

        cluster.mailboxes.send(1, cluster.calcs[0].root());
        cluster.members[1].hungry.store(true, Ordering::Release);
        cluster.receive(1).unwrap();
        assert_eq!(cluster.transfers.load(Ordering::Acquire), 1);
        assert_eq!(cluster.mailboxes.total_len(), 0);
        assert_eq!(cluster.members[1].frontier.lock().len(StateId(0)), 1);
        assert!(!cluster.members[1].hungry.load(Ordering::Acquire));
    }

    #[test]
    fn starving_members_are_assigned_a_state_they_hold() {
        let space = Arc::new(test_utils::random_space(3, 2, 2));
        let evaluator = PairwiseEvaluator::new(space.clone());
        let config = config();
        let reporter = ProgressReporter::new();
        let cluster =
            Cluster::assemble(space, &config, 2, &evaluator, &keep_going, &reporter).unwrap();
        let (s0, s1) = (StateId(0), StateId(1));
        cluster.members[0]
            .frontier
            .lock()
            .push(cluster.calcs[0].root(), &mut NoDrops)
            .unwrap();
        cluster.members[1]
            .frontier
            .lock()
            .push(cluster.calcs[1].root(), &mut NoDrops)
            .unwrap();
        cluster.directions.set_focused_state(Some(s0));
        for member in &cluster.members {
            member.hungry.store(true, Ordering::Release);
        }
        let mut finished = vec![None; 2];

        // member 0 holds focused work, member 1 only the other state
        cluster.reassign(&finished);
        assert_eq!(cluster.directions.assignment(0), None);
        assert_eq!(cluster.directions.assignment(1), Some(s1));
        assert_eq!(cluster.directions.state_for(1), Some(s1));
        assert!(!cluster.members[1].hungry.load(Ordering::Acquire));

        finished[1] = Some(WorkerExit::Stalled);
        cluster.reassign(&finished);
        assert_eq!(cluster.directions.assignment(1), None);
        assert_eq!(cluster.directions.state_for(1), Some(s0));

        finished[1] = None;
        cluster.members[1].hungry.store(true, Ordering::Release);
        cluster.reassign(&finished);
        assert_eq!(cluster.directions.assignment(1), Some(s1));
        cluster.members[1].frontier.lock().pop(s1).unwrap();
        cluster.reassign(&finished);
        assert_eq!(cluster.directions.assignment(1), None);
    }
}
