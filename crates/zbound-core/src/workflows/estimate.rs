use crate::core::io::records::RecordCodec;
use crate::core::io::ring_file::RingLayout;
use crate::core::math::bigexp::BigExp;
use crate::core::models::node::Node;
use crate::core::models::sequence::Sequence;
use crate::core::models::space::{MultiStateSpace, StateId};
use crate::engine::batch::MinimizationQueue;
use crate::engine::bounds::BoundCalculator;
use crate::engine::config::{ConfigError, EstimatorConfig, FrontierMode};
use crate::engine::context::{batch_size, RefinementContext};
use crate::engine::coordinator::Directions;
use crate::engine::criterion::{RefinementSnapshot, Satisfaction, StoppingCriterion};
use crate::engine::error::EngineError;
use crate::engine::evaluator::{LeafEvaluator, Rcs};
use crate::engine::frontier::priority::PriorityFrontier;
use crate::engine::frontier::ring::RingStore;
use crate::engine::frontier::sweep::SweepFrontier;
use crate::engine::frontier::{DropReason, Frontier, FrontierSnapshot};
use crate::engine::ledger::{LedgerBook, LedgerTransaction, SequenceLedger, ZBounds};
use crate::engine::perf::NodePerformance;
use crate::engine::processor::{
    DropObserver, InFlight, PhaseControl, PhaseStats, Processor, WorkerExit, Workspace,
};
use crate::engine::progress::{Progress, ProgressReporter};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How an estimator came to hold its frontier and ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    Fresh,
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineEnd {
    /// The stopping criterion was satisfied.
    Criterion,
    /// Every state's frontier is empty.
    Exhausted,
    /// Nodes remain, but none of them can be refined.
    Stalled,
    /// The stop flag was raised.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RefineReport {
    pub phases: usize,
    pub ended: RefineEnd,
    /// Counters over every phase run so far, per state.
    pub totals: Vec<PhaseStats>,
}

/// Accounting of one state's bound mass at a quiescent point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conservation {
    pub state: StateId,
    pub roots: BigExp,
    /// Pending mass according to the ledger.
    pub ledger_pending: BigExp,
    /// Bounds of the nodes actually held in the frontier.
    pub stored_pending: BigExp,
    /// `roots - (exact + pending + dropped + tightened)`.
    pub residual: BigExp,
}

impl Conservation {
    pub fn holds(&self, tolerance: f64) -> bool {
        let slack = self.roots * tolerance;
        (self.ledger_pending - self.stored_pending).abs() <= slack && self.residual.abs() <= slack
    }
}

/// Sets up an [`Estimator`] for a space, a configuration and a leaf evaluator.
pub struct EstimatorBuilder<'a> {
    space: Arc<MultiStateSpace>,
    config: EstimatorConfig,
    evaluator: &'a dyn LeafEvaluator,
    reporter: ProgressReporter<'a>,
    observer: Option<Box<DropObserver>>,
    restrict_to: Option<Sequence>,
}

impl<'a> EstimatorBuilder<'a> {
    pub fn new(
        space: Arc<MultiStateSpace>,
        config: EstimatorConfig,
        evaluator: &'a dyn LeafEvaluator,
    ) -> Self {
        Self {
            space,
            config,
            evaluator,
            reporter: ProgressReporter::new(),
            observer: None,
            restrict_to: None,
        }
    }

    pub fn reporter(mut self, reporter: ProgressReporter<'a>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Called for every node pruned or evicted from the frontier.
    pub fn drop_observer(mut self, observer: Box<DropObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Limits every state to the conformations of `seq`; wildcard positions
    /// stay open.
    pub fn restrict_to(mut self, seq: Sequence) -> Self {
        self.restrict_to = Some(seq);
        self
    }

    /// Starts from the root nodes. Refuses to replace persisted files unless
    /// `overwrite` is set.
    #[instrument(skip_all, name = "estimator_init")]
    pub fn init(self, overwrite: bool) -> Result<Estimator<'a>, EngineError> {
        if !overwrite {
            if let Some(path) = self.persisted_paths().into_iter().find(|p| p.exists()) {
                return Err(EngineError::Initialization(format!(
                    "'{}' already exists; refusing to overwrite it",
                    path.display()
                )));
            }
        }
        let mut estimator = self.assemble(true)?;
        estimator.push_roots()?;
        Ok(estimator)
    }

    /// Reopens the persisted frontier and ledger of an earlier run.
    #[instrument(skip_all, name = "estimator_resume")]
    pub fn resume(self) -> Result<Estimator<'a>, EngineError> {
        let storage = &self.config.storage;
        let (Some(frontier_file), Some(ledger_file)) = (&storage.frontier_file, &storage.ledger_file)
        else {
            return Err(EngineError::Initialization(
                "resuming requires both a frontier file and a ledger file".to_string(),
            ));
        };
        for path in [frontier_file, ledger_file] {
            if !path.exists() {
                return Err(EngineError::Initialization(format!(
                    "cannot resume: '{}' does not exist",
                    path.display()
                )));
            }
        }
        self.assemble(false)
    }

    /// Resumes when every persisted file exists, otherwise starts fresh.
    pub fn open(self, overwrite: bool) -> Result<(Estimator<'a>, Start), EngineError> {
        let paths = self.persisted_paths();
        let resumable = !overwrite
            && self.config.storage.frontier_file.is_some()
            && self.config.storage.ledger_file.is_some()
            && paths.iter().all(|p| p.exists());
        if resumable {
            Ok((self.resume()?, Start::Resumed))
        } else {
            Ok((self.init(overwrite)?, Start::Fresh))
        }
    }

    fn persisted_paths(&self) -> Vec<&Path> {
        let storage = &self.config.storage;
        [&storage.frontier_file, &storage.ledger_file]
            .into_iter()
            .flatten()
            .map(|p| p.as_path())
            .collect()
    }

    fn assemble(self, fresh: bool) -> Result<Estimator<'a>, EngineError> {
        let num_states = self.space.states.len();
        if num_states == 0 {
            return Err(EngineError::Initialization(
                "the conformation space has no states".to_string(),
            ));
        }
        let calcs = build_calcs(&self.space, &self.config, self.restrict_to.as_ref())?;
        let (frontier, resumed) = build_frontier(&self.config, &self.space, fresh)?;
        check_capacity(&frontier, &calcs)?;

        let ledger = match &self.config.storage.ledger_file {
            Some(path) => SequenceLedger::open(
                path,
                num_states,
                self.space.seq_space.len(),
                &self.config.soundness,
                fresh,
            )?,
            None => SequenceLedger::in_memory(num_states, &self.config.soundness),
        };

        let depths: Vec<usize> = calcs.iter().map(BoundCalculator::num_positions).collect();
        let batch_size = batch_size(&self.config, self.evaluator);

        info!(
            states = num_states,
            mode = frontier.mode_name(),
            resumed,
            "Estimator assembled."
        );

        Ok(Estimator {
            space: self.space,
            config: self.config,
            calcs,
            evaluator: self.evaluator,
            reporter: self.reporter,
            observer: self.observer,
            frontier: Mutex::new(frontier),
            ledger: Mutex::new(ledger),
            perf: NodePerformance::new(&depths),
            queue: Mutex::new(MinimizationQueue::new(num_states, batch_size)),
            in_flight: InFlight::new(num_states),
            directions: Arc::new(Directions::new(1)),
            phases: 0,
            totals: vec![PhaseStats::default(); num_states],
            finished: vec![None; num_states],
        })
    }
}

/// One bound calculator per state, optionally restricted to one sequence.
pub(crate) fn build_calcs(
    space: &Arc<MultiStateSpace>,
    config: &EstimatorConfig,
    restrict_to: Option<&Sequence>,
) -> Result<Vec<BoundCalculator>, EngineError> {
    let bcalc = config.bcalc();
    let z_prune = config.prune.z_prune(&bcalc);
    space
        .states
        .iter()
        .map(|state| {
            let rcs = match restrict_to {
                Some(seq) => Rcs::for_sequence(&state.conf_space, seq),
                None => Rcs::from_enumerator(&state.conf_space),
            };
            BoundCalculator::new(space.clone(), state.id, rcs, bcalc, z_prune)
        })
        .collect()
}

/// Every state's frontier must hold at least the children of one expansion.
pub(crate) fn check_capacity(
    frontier: &Frontier,
    calcs: &[BoundCalculator],
) -> Result<(), ConfigError> {
    for calc in calcs {
        let capacity = frontier.capacity(calc.state());
        let required = calc.rcs().max_choices();
        if capacity < required {
            return Err(ConfigError::CapacityTooSmall {
                state: calc.state(),
                capacity,
                required,
            });
        }
    }
    Ok(())
}

/// Fixed-size node records wide enough for every state of `space`.
pub(crate) fn record_codec(space: &MultiStateSpace) -> RecordCodec {
    RecordCodec::new(
        space
            .states
            .iter()
            .map(|s| s.conf_space.num_positions())
            .collect(),
    )
}

/// Builds the frontier the configuration asks for. Returns whether a
/// persisted frontier was reopened.
pub(crate) fn build_frontier(
    config: &EstimatorConfig,
    space: &MultiStateSpace,
    fresh: bool,
) -> Result<(Frontier, bool), EngineError> {
    let num_states = space.states.len();
    let codec = record_codec(space);
    let record_size = codec.record_size();
    let storage = &config.storage;

    match config.mode {
        FrontierMode::Sweep { increment } => {
            let regions = SweepFrontier::regions_for(num_states);
            let (store, resumed) = match &storage.frontier_file {
                Some(path) => {
                    RingStore::disk(path, codec, regions, storage.frontier_file_bytes, fresh)?
                }
                None => {
                    let layout = RingLayout::fitting(storage.frontier_mem_bytes, record_size, regions);
                    (RingStore::memory(regions, layout.capacity), false)
                }
            };
            let bcalc = config.bcalc();
            let g_upper = config.prune.g_threshold_upper(&bcalc);
            let sweep = SweepFrontier::new(store, num_states, increment, g_upper, bcalc, resumed)?;
            Ok((Frontier::Sweep(sweep), resumed))
        }
        FrontierMode::Priority { .. } => {
            let capacity = (storage.frontier_mem_bytes / record_size as u64) as usize;
            let (overflow, resumed) = match &storage.frontier_file {
                Some(path) => {
                    let (store, resumed) = RingStore::disk(
                        path,
                        codec,
                        num_states,
                        storage.frontier_file_bytes,
                        fresh,
                    )?;
                    (Some(store), resumed)
                }
                None => (None, false),
            };
            let priority = PriorityFrontier::new(num_states, capacity, overflow);
            Ok((Frontier::Priority(priority), resumed))
        }
    }
}

/// A single-process refinement run over every state of a space.
///
/// Each phase focuses on the unfinished state with the most pending mass and
/// runs workers on it until the phase budget is spent or the state runs dry.
/// The stopping criterion is consulted between phases.
pub struct Estimator<'a> {
    space: Arc<MultiStateSpace>,
    config: EstimatorConfig,
    calcs: Vec<BoundCalculator>,
    evaluator: &'a dyn LeafEvaluator,
    reporter: ProgressReporter<'a>,
    observer: Option<Box<DropObserver>>,
    frontier: Mutex<Frontier>,
    ledger: Mutex<SequenceLedger>,
    perf: NodePerformance,
    queue: Mutex<MinimizationQueue>,
    in_flight: InFlight,
    directions: Arc<Directions>,
    phases: usize,
    totals: Vec<PhaseStats>,
    finished: Vec<Option<WorkerExit>>,
}

impl<'a> Estimator<'a> {
    pub fn space(&self) -> &MultiStateSpace {
        &self.space
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn calc(&self, state: StateId) -> Option<&BoundCalculator> {
        self.calcs.get(state.index())
    }

    /// Shared flag that stops a running [`Estimator::refine`] between nodes.
    pub fn stop_handle(&self) -> Arc<Directions> {
        self.directions.clone()
    }

    pub fn bounds(&self, state: StateId, seq: &Sequence) -> ZBounds {
        self.ledger.lock().book().bounds(state, seq)
    }

    pub fn ledger(&self) -> LedgerBook {
        self.ledger.lock().snapshot()
    }

    /// Soundness violations seen so far, fatal or not.
    pub fn violations(&self) -> usize {
        self.ledger.lock().violations()
    }

    pub fn frontier_len(&self, state: StateId) -> usize {
        self.frontier.lock().len(state)
    }

    pub fn frontier_nodes(&self, state: StateId) -> Result<Vec<Node>, EngineError> {
        Ok(self.frontier.lock().nodes(state)?)
    }

    pub fn snapshot(&self) -> RefinementSnapshot {
        let frontier = FrontierSnapshot::of(&self.frontier.lock());
        RefinementSnapshot {
            ledger: self.ledger.lock().snapshot(),
            frontier,
            phases: self.phases,
            totals: self.totals.clone(),
        }
    }

    fn push_roots(&mut self) -> Result<(), EngineError> {
        let mut tx = LedgerTransaction::new();
        let mut evicted = Vec::new();
        {
            let mut frontier = self.frontier.lock();
            let mut sink = |n: &Node| evicted.push(n.clone());
            for calc in &self.calcs {
                let mut root = calc.root();
                root.score = self.perf.score(&root);
                debug!(state = %root.state, z_upper = %root.z_upper, "Pushing root node.");
                tx.add_root(root.state, calc.project(&root.conf), root.z_upper);
                frontier.push(root, &mut sink)?;
            }
            frontier.flush()?;
        }
        self.record_drops(&mut tx, &evicted);
        let mut ledger = self.ledger.lock();
        ledger.commit(tx)?;
        ledger.sync()?;
        drop(ledger);
        self.notify_evicted(&evicted);
        Ok(())
    }

    /// Refines until the criterion is satisfied, every state is exhausted or
    /// stalled, or the stop flag is raised.
    #[instrument(skip_all, name = "refine")]
    pub fn refine(&mut self, criterion: &dyn StoppingCriterion) -> Result<RefineReport, EngineError> {
        self.reporter.report(Progress::PhaseStart { name: "Refinement" });
        let outcome = self.refine_phases(criterion);
        let persisted = self.persist();
        self.reporter.report(Progress::PhaseFinish);

        let report = outcome?;
        persisted?;
        info!(
            phases = report.phases,
            ended = ?report.ended,
            "Refinement finished."
        );
        Ok(report)
    }

    fn refine_phases(&mut self, criterion: &dyn StoppingCriterion) -> Result<RefineReport, EngineError> {
        let first_phase = self.phases;
        let ended = loop {
            if criterion.is_satisfied(&self.snapshot()) == Satisfaction::Terminate {
                break RefineEnd::Criterion;
            }
            if !self.directions.is_running() {
                break RefineEnd::Stopped;
            }
            let Some(state) = self.pick_focus() else {
                let all_exhausted = self
                    .finished
                    .iter()
                    .all(|f| *f == Some(WorkerExit::Exhausted));
                break if all_exhausted {
                    RefineEnd::Exhausted
                } else {
                    RefineEnd::Stalled
                };
            };
            self.run_phase(state, criterion)?;
        };
        Ok(RefineReport {
            phases: self.phases - first_phase,
            ended,
            totals: self.totals.clone(),
        })
    }

    /// The unfinished state with the most pending mass.
    fn pick_focus(&self) -> Option<StateId> {
        let ledger = self.ledger.lock();
        let mut best: Option<(StateId, BigExp)> = None;
        for calc in &self.calcs {
            let state = calc.state();
            if self.finished[state.index()].is_some() {
                continue;
            }
            let pending = ledger.book().sum_pending(state);
            if best.as_ref().is_none_or(|(_, b)| pending > *b) {
                best = Some((state, pending));
            }
        }
        best.map(|(state, _)| state)
    }

    fn run_phase(&mut self, state: StateId, criterion: &dyn StoppingCriterion) -> Result<(), EngineError> {
        self.directions.set_focused_state(Some(state));
        let phase = self.phases + 1;
        debug!(phase, %state, "Starting phase.");

        let report = {
            let ctx = RefinementContext::new(&self.config, &self.calcs, self.evaluator, criterion);
            let ws = Workspace {
                frontier: &self.frontier,
                ledger: &self.ledger,
                perf: &self.perf,
                queue: &self.queue,
                in_flight: &self.in_flight,
            };
            let processor = Processor::new(ctx, ws, &self.directions, 0, self.observer.as_deref());
            processor.run_phase(&PhaseControl::new(&self.config.phase))?
        };

        self.phases = phase;
        for (s, stats) in report.stats.iter().enumerate() {
            self.totals[s].merge(stats);
            if stats.read > 0 {
                info!(phase, state = s, "{}", stats);
            }
        }
        match report.exit {
            WorkerExit::Exhausted | WorkerExit::Stalled => {
                debug!(phase, %state, exit = ?report.exit, "State finished.");
                self.finished[state.index()] = Some(report.exit);
            }
            WorkerExit::LimitReached | WorkerExit::Stopped => {}
        }

        let ledger = self.ledger.lock();
        let book = ledger.book();
        let open = book.sum_pending(state) + book.sum_dropped(state);
        self.reporter.report(Progress::StatusUpdate {
            text: format!(
                "phase {phase}, {state}: exact {}, open {}, {} nodes",
                book.sum_exact(state),
                open.clamp_non_negative(),
                self.frontier.lock().len(state)
            ),
        });
        Ok(())
    }

    /// Puts a node that was evicted earlier back into the frontier; its mass
    /// moves from dropped to pending.
    pub fn readmit(&mut self, mut node: Node) -> Result<(), EngineError> {
        let state = node.state;
        let calc = self
            .calcs
            .get(state.index())
            .ok_or_else(|| EngineError::Initialization(format!("unknown {state}")))?;
        node.score = self.perf.score(&node);

        let mut tx = LedgerTransaction::new();
        tx.restore(state, calc.project(&node.conf), node.z_upper);
        let mut evicted = Vec::new();
        {
            let mut frontier = self.frontier.lock();
            {
                let mut sink = |n: &Node| evicted.push(n.clone());
                frontier.push(node, &mut sink)?;
            }
            self.record_drops(&mut tx, &evicted);
            self.ledger.lock().commit(tx)?;
        }
        self.finished[state.index()] = None;
        self.notify_evicted(&evicted);
        Ok(())
    }

    /// Compares ledger accounts with the stored nodes. Only meaningful while
    /// no refinement is running.
    pub fn conservation(&self) -> Result<Vec<Conservation>, EngineError> {
        let mut frontier = self.frontier.lock();
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
                    stored_pending: frontier.sum_bounds(state)?,
                    residual: book.conservation_residual(state),
                })
            })
            .collect()
    }

    /// Flushes persisted stores. A priority frontier with an overflow file
    /// moves its in-memory nodes to the file first.
    fn persist(&mut self) -> Result<(), EngineError> {
        let mut evicted = Vec::new();
        let mut frontier = self.frontier.lock();
        if self.config.storage.frontier_file.is_some() {
            if let Some(priority) = frontier.as_priority_mut() {
                let mut sink = |n: &Node| evicted.push(n.clone());
                let moved = priority.spill(&mut sink)?;
                debug!(moved, "Moved in-memory frontier nodes to the overflow file.");
            }
        }
        frontier.flush()?;
        let mut ledger = self.ledger.lock();
        if !evicted.is_empty() {
            warn!(
                nodes = evicted.len(),
                "Overflow file is full; dropping frontier nodes."
            );
            let mut tx = LedgerTransaction::new();
            self.record_drops(&mut tx, &evicted);
            ledger.apply(tx)?;
        }
        ledger.sync()?;
        drop(ledger);
        drop(frontier);
        self.notify_evicted(&evicted);
        Ok(())
    }

    fn record_drops(&self, tx: &mut LedgerTransaction, evicted: &[Node]) {
        for node in evicted {
            if let Some(calc) = self.calcs.get(node.state.index()) {
                tx.drop_pending(node.state, calc.project(&node.conf), node.z_upper);
            }
        }
    }

    fn notify_evicted(&self, evicted: &[Node]) {
        if let Some(observer) = &self.observer {
            for node in evicted {
                observer(node, DropReason::Evicted);
            }
        }
    }
}
