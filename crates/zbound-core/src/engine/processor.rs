use super::batch::MinimizationQueue;
use super::bounds::{Deferral, SubtreeRefinement};
use super::config::{FrontierMode, PhaseConfig};
use super::context::RefinementContext;
use super::coordinator::Directions;
use super::criterion::FilterDecision;
use super::error::EngineError;
use super::frontier::sweep::{StepOutcome, SweepThreshold};
use super::frontier::{DropReason, Frontier, NoDrops};
use super::ledger::{LedgerTransaction, SequenceLedger};
use super::perf::NodePerformance;
use crate::core::math::bigexp::BigExp;
use crate::core::models::conf::Conf;
use crate::core::models::node::Node;
use crate::core::models::space::StateId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Notified of every node removed from the frontier without refinement.
pub type DropObserver = dyn Fn(&Node, DropReason) + Send + Sync;

/// Counters of one phase for one state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseStats {
    pub read: u64,
    pub pruned: u64,
    pub expanded: u64,
    pub resolved: u64,
    pub requeued_threshold: u64,
    pub requeued_filter: u64,
    pub requeued_space: u64,
    pub rescored: u64,
    pub added: u64,
    pub evicted: u64,
    pub failed: u64,
}

impl PhaseStats {
    pub fn merge(&mut self, other: &PhaseStats) {
        self.read += other.read;
        self.pruned += other.pruned;
        self.expanded += other.expanded;
        self.resolved += other.resolved;
        self.requeued_threshold += other.requeued_threshold;
        self.requeued_filter += other.requeued_filter;
        self.requeued_space += other.requeued_space;
        self.rescored += other.rescored;
        self.added += other.added;
        self.evicted += other.evicted;
        self.failed += other.failed;
    }

    /// Nodes whose bound mass was refined or discarded.
    pub fn progress(&self) -> u64 {
        self.pruned + self.expanded + self.resolved
    }
}

impl fmt::Display for PhaseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read {}, pruned {}, expanded {}, resolved {}, requeued {}/{}/{} (threshold/filter/space), \
             rescored {}, added {}, evicted {}",
            self.read,
            self.pruned,
            self.expanded,
            self.resolved,
            self.requeued_threshold,
            self.requeued_filter,
            self.requeued_space,
            self.rescored,
            self.added,
            self.evicted
        )
    }
}

/// Nodes taken from the frontier and not yet committed back, per state.
#[derive(Debug)]
pub struct InFlight {
    counts: Mutex<Vec<usize>>,
    changed: Condvar,
}

impl InFlight {
    pub fn new(num_states: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0; num_states]),
            changed: Condvar::new(),
        }
    }

    pub fn acquire(&self, state: StateId) {
        if let Some(count) = self.counts.lock().get_mut(state.index()) {
            *count += 1;
        }
    }

    pub fn release(&self, state: StateId, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(count) = self.counts.lock().get_mut(state.index()) {
            *count = count.saturating_sub(n);
        }
        self.changed.notify_all();
    }

    pub fn count(&self, state: StateId) -> usize {
        self.counts.lock().get(state.index()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().iter().sum()
    }

    /// Blocks until a release or until `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        let mut counts = self.counts.lock();
        self.changed.wait_for(&mut counts, timeout);
    }
}

/// Node budget and deadline of one phase, shared by its workers.
#[derive(Debug)]
pub struct PhaseControl {
    max_nodes: Option<usize>,
    deadline: Option<Instant>,
    read: AtomicUsize,
    aborted: AtomicBool,
}

impl PhaseControl {
    pub fn new(phase: &PhaseConfig) -> Self {
        Self {
            max_nodes: phase.max_nodes,
            deadline: Some(Instant::now() + phase.max_duration),
            read: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_nodes: None,
            deadline: None,
            read: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn limit_reached(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
            || self
                .max_nodes
                .is_some_and(|max| self.read.load(Ordering::Relaxed) >= max)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn count_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nodes_read(&self) -> usize {
        self.read.load(Ordering::Relaxed)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    LimitReached,
    /// The focused state has no nodes left and none in flight.
    Exhausted,
    /// The focused state has nodes, but none can currently be refined.
    Stalled,
}

/// What a worker does when its state has nothing to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    Exit,
    Poll,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub exit: WorkerExit,
    pub stats: Vec<PhaseStats>,
}

enum Take {
    Node(Node),
    Wait,
    Exhausted,
    Stalled,
}

enum Push {
    /// Read in the current sweep step.
    Child(Node),
    /// Left for the next sweep step.
    Deferred(Node),
    Restore(Node),
}

/// One atomic update of the frontier and the ledger.
struct Commit {
    state: StateId,
    tx: LedgerTransaction,
    pushes: Vec<Push>,
    /// Nodes taken from the frontier for this update; they go back unchanged
    /// when the update is refused.
    originals: Vec<Node>,
    /// In sweep mode, refuse the update when its pushes do not fit.
    needs_room: bool,
    released: usize,
    progressed: bool,
}

impl Commit {
    fn new(state: StateId, tx: LedgerTransaction, pushes: Vec<Push>) -> Self {
        Self {
            state,
            tx,
            pushes,
            originals: Vec::new(),
            needs_room: false,
            released: 1,
            progressed: false,
        }
    }
}

enum CommitOutcome {
    Committed,
    NoRoom,
}

/// Mutable state one member refines: its frontier, leaf queue and in-flight
/// counts, plus the ledger and performance model it shares with others.
pub struct Workspace<'a> {
    pub frontier: &'a Mutex<Frontier>,
    pub ledger: &'a Mutex<SequenceLedger>,
    pub perf: &'a NodePerformance,
    pub queue: &'a Mutex<MinimizationQueue>,
    pub in_flight: &'a InFlight,
}

/// Reads nodes from the frontier and refines them.
///
/// Locks are always taken frontier first, then ledger. Bounds and leaf
/// energies are computed with no lock held; only commits lock, and a commit
/// applies its ledger transaction before releasing the frontier, so no other
/// worker sees a node's children before their mass is credited.
pub struct Processor<'a> {
    ctx: RefinementContext<'a>,
    ws: Workspace<'a>,
    directions: &'a Directions,
    member: usize,
    observer: Option<&'a DropObserver>,
}

impl<'a> Processor<'a> {
    pub fn new(
        ctx: RefinementContext<'a>,
        ws: Workspace<'a>,
        directions: &'a Directions,
        member: usize,
        observer: Option<&'a DropObserver>,
    ) -> Self {
        Self {
            ctx,
            ws,
            directions,
            member,
            observer,
        }
    }

    /// Runs workers until the phase budget is spent or the focused state
    /// runs dry, then flushes every queued leaf.
    pub fn run_phase(&self, control: &PhaseControl) -> Result<WorkerReport, EngineError> {
        let reports = self.spawn_workers(control);

        let mut stats = vec![PhaseStats::default(); self.ctx.num_states()];
        let mut exits = Vec::with_capacity(reports.len());
        let mut first_error = None;
        for report in reports {
            match report {
                Ok(report) => {
                    for (total, s) in stats.iter_mut().zip(&report.stats) {
                        total.merge(s);
                    }
                    exits.push(report.exit);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let flushed = self.flush_all(&mut stats);
        self.ws.frontier.lock().flush()?;
        self.ws.ledger.lock().sync()?;
        if let Some(e) = first_error {
            return Err(e);
        }
        flushed?;

        let exit = [
            WorkerExit::Stalled,
            WorkerExit::Exhausted,
            WorkerExit::LimitReached,
        ]
        .into_iter()
        .find(|e| exits.contains(e))
        .unwrap_or(WorkerExit::Stopped);
        Ok(WorkerReport { exit, stats })
    }

    #[cfg(feature = "parallel")]
    fn spawn_workers(&self, control: &PhaseControl) -> Vec<Result<WorkerReport, EngineError>> {
        let workers = rayon::current_num_threads()
            .min(self.ctx.config.concurrency.max_in_flight)
            .max(1);
        let results = Mutex::new(Vec::with_capacity(workers));
        rayon::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    let result = self.run_worker(control, IdlePolicy::Exit);
                    if result.is_err() {
                        control.abort();
                    }
                    results.lock().push(result);
                });
            }
        });
        results.into_inner()
    }

    #[cfg(not(feature = "parallel"))]
    fn spawn_workers(&self, control: &PhaseControl) -> Vec<Result<WorkerReport, EngineError>> {
        vec![self.run_worker(control, IdlePolicy::Exit)]
    }

    /// The loop of one worker thread.
    pub fn run_worker(
        &self,
        control: &PhaseControl,
        idle: IdlePolicy,
    ) -> Result<WorkerReport, EngineError> {
        let poll = self.ctx.config.concurrency.poll_interval;
        let mut stats = vec![PhaseStats::default(); self.ctx.num_states()];
        let exit = loop {
            if !self.directions.is_running() {
                break WorkerExit::Stopped;
            }
            if control.limit_reached() {
                break WorkerExit::LimitReached;
            }
            let Some(state) = self.directions.state_for(self.member) else {
                match idle {
                    IdlePolicy::Exit => break WorkerExit::Exhausted,
                    IdlePolicy::Poll => {
                        self.ws.in_flight.wait(poll);
                        continue;
                    }
                }
            };

            match self.take_node(state, control, &mut stats)? {
                Take::Node(node) => self.process(node, &mut stats)?,
                Take::Wait => {
                    let batch = self.ws.queue.lock().take_any(Some(state));
                    match batch {
                        Some(batch) => self.flush_batch(batch, &mut stats)?,
                        None => self.ws.in_flight.wait(poll),
                    }
                }
                Take::Exhausted => match idle {
                    IdlePolicy::Exit => break WorkerExit::Exhausted,
                    IdlePolicy::Poll => self.ws.in_flight.wait(poll),
                },
                Take::Stalled => match idle {
                    IdlePolicy::Exit => break WorkerExit::Stalled,
                    IdlePolicy::Poll => self.ws.in_flight.wait(poll),
                },
            }
        };
        Ok(WorkerReport { exit, stats })
    }

    /// Evaluates every queued leaf. A failing batch does not stop the
    /// others; the first error is returned once the queue is empty.
    pub fn flush_all(&self, stats: &mut [PhaseStats]) -> Result<(), EngineError> {
        let mut first_error = None;
        loop {
            let batch = self.ws.queue.lock().take_any(None);
            let Some(batch) = batch else {
                break;
            };
            if let Err(e) = self.flush_batch(batch, stats) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pops the next node worth refining. Nodes below the sweep threshold,
    /// rejected by the criterion's filter or with stale scores are put back
    /// on the way.
    fn take_node(
        &self,
        state: StateId,
        control: &PhaseControl,
        stats: &mut [PhaseStats],
    ) -> Result<Take, EngineError> {
        let calc = self.ctx.calc(state);
        let stats = &mut stats[state.index()];
        let max_in_flight = self.ctx.config.concurrency.max_in_flight;
        let mut frontier = self.ws.frontier.lock();
        let mut filtered = 0usize;
        loop {
            if self.ws.in_flight.total() >= max_in_flight {
                return Ok(Take::Wait);
            }
            let Some(mut node) = frontier.pop(state)? else {
                if self.ws.in_flight.count(state) > 0 {
                    return Ok(Take::Wait);
                }
                let Some(sweep) = frontier.as_sweep_mut() else {
                    return Ok(Take::Exhausted);
                };
                match sweep.end_step(state)? {
                    StepOutcome::Advanced(_) => continue,
                    StepOutcome::Stalled => return Ok(Take::Stalled),
                    StepOutcome::Exhausted => return Ok(Take::Exhausted),
                }
            };
            stats.read += 1;
            control.count_read();

            if let Frontier::Sweep(sweep) = &mut *frontier {
                if !sweep.accepts(&node) {
                    sweep.requeue(node)?;
                    stats.requeued_threshold += 1;
                    continue;
                }
            }

            let seq = calc.project(&node.conf);
            if self.ctx.criterion.filter_node(&node, &seq) == FilterDecision::Requeue {
                stats.requeued_filter += 1;
                filtered += 1;
                if matches!(*frontier, Frontier::Priority(_)) {
                    node.score = f64::MIN;
                }
                let remaining = frontier.len(state);
                self.requeue_locked(&mut frontier, node, stats)?;
                if filtered > remaining {
                    return Ok(Take::Stalled);
                }
                continue;
            }

            if let FrontierMode::Priority { score_staleness } = self.ctx.config.mode {
                if node.is_leaf() {
                    let predicted = self.ws.perf.score(&node);
                    if node.score - predicted > score_staleness {
                        node.score = predicted;
                        stats.rescored += 1;
                        self.requeue_locked(&mut frontier, node, stats)?;
                        continue;
                    }
                }
            }

            self.ws.in_flight.acquire(state);
            return Ok(Take::Node(node));
        }
    }

    /// Puts a node back while the frontier lock is held; any eviction it
    /// causes is recorded in the ledger straight away.
    fn requeue_locked(
        &self,
        frontier: &mut Frontier,
        node: Node,
        stats: &mut PhaseStats,
    ) -> Result<(), EngineError> {
        let mut evicted = Vec::new();
        {
            let mut sink = |n: &Node| evicted.push(n.clone());
            frontier.requeue(node, &mut sink)?;
        }
        if !evicted.is_empty() {
            let mut tx = LedgerTransaction::new();
            self.record_evictions(&mut tx, &evicted);
            self.ws.ledger.lock().apply(tx)?;
            stats.evicted += evicted.len() as u64;
            for node in &evicted {
                self.notify(node, DropReason::Evicted);
            }
        }
        Ok(())
    }

    fn process(&self, node: Node, stats: &mut [PhaseStats]) -> Result<(), EngineError> {
        let state = node.state;
        let calc = self.ctx.calc(state);
        let seq = calc.project(&node.conf);

        if calc.below_prune_threshold(node.z_upper) {
            let mut tx = LedgerTransaction::new();
            tx.drop_pending(state, seq, node.z_upper);
            self.commit(
                Commit {
                    originals: vec![node.clone()],
                    progressed: true,
                    ..Commit::new(state, tx, Vec::new())
                },
                stats,
            )?;
            stats[state.index()].pruned += 1;
            self.notify(&node, DropReason::Pruned);
            return Ok(());
        }

        if let FrontierMode::Sweep { .. } = self.ctx.config.mode {
            return self.refine_in_place(node, stats);
        }

        if node.is_leaf() {
            let full = self.ws.queue.lock().push(node);
            if let Some(batch) = full {
                self.flush_batch(batch, stats)?;
            }
            return Ok(());
        }

        self.expand(node, stats)
    }

    fn expand(&self, node: Node, stats: &mut [PhaseStats]) -> Result<(), EngineError> {
        let state = node.state;
        let calc = self.ctx.calc(state);
        let started = Instant::now();

        let children = match calc.expand(&node) {
            Ok(children) => children,
            Err(e) => {
                error!(%state, conf = %node.conf, error = %e, "Failed to expand node; returning it to the frontier.");
                stats[state.index()].failed += 1;
                self.restore(node, stats)?;
                return Err(e);
            }
        };

        let mut tx = LedgerTransaction::new();
        tx.sub_pending(state, calc.project(&node.conf), node.z_upper);
        let mut kept = Vec::with_capacity(children.len());
        let mut pruned = Vec::new();
        let mut child_sum = BigExp::ZERO;
        let mut kept_sum = BigExp::ZERO;
        for mut child in children {
            let child_seq = calc.project(&child.conf);
            child_sum += child.z_upper;
            if calc.below_prune_threshold(child.z_upper) {
                tx.add_dropped(state, child_seq, child.z_upper);
                pruned.push(child);
            } else {
                child.score = self.ws.perf.score(&child);
                tx.add_pending(state, child_seq, child.z_upper);
                kept_sum += child.z_upper;
                kept.push(child);
            }
        }
        tx.tighten(state, node.z_upper - child_sum);

        let added = kept.len() as u64;
        let depth = node.depth();
        let parent_z = node.z_upper;
        let pushes = kept.into_iter().map(Push::Child).collect();
        let commit = Commit {
            originals: vec![node],
            needs_room: true,
            progressed: true,
            ..Commit::new(state, tx, pushes)
        };
        match self.commit(commit, stats)? {
            CommitOutcome::Committed => {
                let s = &mut stats[state.index()];
                s.expanded += 1;
                s.added += added;
                s.pruned += pruned.len() as u64;
                for child in &pruned {
                    self.notify(child, DropReason::Pruned);
                }
                self.ws
                    .perf
                    .observe(state, depth, parent_z - kept_sum, started.elapsed());
            }
            CommitOutcome::NoRoom => {
                stats[state.index()].requeued_space += 1;
            }
        }
        Ok(())
    }

    /// Refines the whole subtree of a sweep node in one transaction. Inner
    /// nodes the threshold admits are expanded on the spot and leaves are
    /// resolved straight away; only the subtrees past the threshold, or held
    /// back by the criterion, go back to the frontier for the next step.
    fn refine_in_place(&self, node: Node, stats: &mut [PhaseStats]) -> Result<(), EngineError> {
        let state = node.state;
        let calc = self.ctx.calc(state);
        let started = Instant::now();
        // stable while this node is in flight: steps only end with none left
        let threshold = match &*self.ws.frontier.lock() {
            Frontier::Sweep(sweep) => sweep.threshold(state),
            Frontier::Priority(_) => SweepThreshold::Lifted,
        };

        let refined = calc.refine_subtree(&node, |candidate| {
            let seq = calc.project(&candidate.conf);
            if self.ctx.criterion.filter_node(candidate, &seq) == FilterDecision::Requeue {
                Some(Deferral::Filter)
            } else if !candidate.is_leaf() && !threshold.admits(candidate.z_upper, calc.bcalc()) {
                Some(Deferral::Threshold)
            } else {
                None
            }
        });
        let refined = match refined {
            Ok(refined) => refined,
            Err(e) => {
                error!(%state, conf = %node.conf, error = %e, "Failed to refine node; returning it to the frontier.");
                stats[state.index()].failed += 1;
                self.restore(node, stats)?;
                return Err(e);
            }
        };

        let SubtreeRefinement {
            leaves,
            deferred,
            held,
            pruned,
            expanded,
        } = refined;
        let waiting = deferred.len() + held.len();
        if !self.has_room(&self.ws.frontier.lock(), state, waiting) {
            debug!(%state, conf = %node.conf, waiting, "No room for the refined subtree; deferring node.");
            self.commit(
                Commit::new(state, LedgerTransaction::new(), vec![Push::Deferred(node)]),
                stats,
            )?;
            stats[state.index()].requeued_space += 1;
            return Ok(());
        }

        let confs: Vec<Conf> = leaves.iter().map(|n| n.conf.clone()).collect();
        let mut energies = Vec::with_capacity(confs.len());
        for chunk in confs.chunks(self.ctx.batch_size()) {
            energies.extend(self.ctx.evaluator.energies(state, chunk));
        }

        let mut tx = LedgerTransaction::new();
        tx.sub_pending(state, calc.project(&node.conf), node.z_upper);
        let mut replaced = BigExp::ZERO;
        let mut first_error = None;
        let mut failed = 0u64;
        for (leaf, energy) in leaves.iter().zip(energies) {
            match energy {
                Ok(energy) => {
                    let z = calc.bcalc().calc(energy);
                    trace!(%state, conf = %leaf.conf, energy, "Resolved leaf.");
                    tx.add_exact(state, calc.project(&leaf.conf), z);
                    replaced += z;
                }
                Err(e) => {
                    error!(%state, conf = %leaf.conf, error = %e, "Leaf evaluation failed; returning its subtree to the frontier.");
                    failed += 1;
                    first_error.get_or_insert(EngineError::Evaluation {
                        state,
                        conf: leaf.conf.clone(),
                        reason: e.0,
                    });
                }
            }
        }
        if let Some(e) = first_error {
            stats[state.index()].failed += failed;
            self.restore(node, stats)?;
            return Err(e);
        }

        for n in &pruned {
            tx.add_dropped(state, calc.project(&n.conf), n.z_upper);
            replaced += n.z_upper;
        }
        let mut pending = BigExp::ZERO;
        let mut pushes = Vec::with_capacity(waiting);
        for n in deferred.iter().chain(&held) {
            tx.add_pending(state, calc.project(&n.conf), n.z_upper);
            pending += n.z_upper;
            pushes.push(Push::Deferred(n.clone()));
        }
        tx.tighten(state, node.z_upper - replaced - pending);

        let depth = node.depth();
        let parent_z = node.z_upper;
        let commit = Commit {
            originals: vec![node],
            needs_room: true,
            progressed: true,
            ..Commit::new(state, tx, pushes)
        };
        match self.commit(commit, stats)? {
            CommitOutcome::Committed => {
                let s = &mut stats[state.index()];
                s.expanded += expanded;
                s.resolved += leaves.len() as u64;
                s.pruned += pruned.len() as u64;
                s.added += waiting as u64;
                s.requeued_filter += held.len() as u64;
                for n in &pruned {
                    self.notify(n, DropReason::Pruned);
                }
                self.ws
                    .perf
                    .observe(state, depth, parent_z - pending, started.elapsed());
            }
            CommitOutcome::NoRoom => {
                stats[state.index()].requeued_space += 1;
            }
        }
        Ok(())
    }

    /// Evaluates a batch of leaves of one state and resolves them in one
    /// transaction. Leaves whose evaluation fails go back to the frontier,
    /// and so does the whole batch if the ledger rejects the result.
    fn flush_batch(
        &self,
        (state, nodes): (StateId, Vec<Node>),
        stats: &mut [PhaseStats],
    ) -> Result<(), EngineError> {
        if nodes.is_empty() {
            return Ok(());
        }
        let calc = self.ctx.calc(state);
        let started = Instant::now();
        let confs: Vec<Conf> = nodes.iter().map(|n| n.conf.clone()).collect();
        let energies = self.ctx.evaluator.energies(state, &confs);

        let count = nodes.len();
        let mut tx = LedgerTransaction::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        let mut reduction = BigExp::ZERO;
        for (node, energy) in nodes.iter().zip(energies) {
            match energy {
                Ok(energy) => {
                    let z = calc.bcalc().calc(energy);
                    let seq = calc.project(&node.conf);
                    trace!(%state, conf = %node.conf, energy, "Resolved leaf.");
                    tx.sub_pending(state, seq.clone(), node.z_upper);
                    tx.add_exact(state, seq, z);
                    tx.tighten(state, node.z_upper - z);
                    reduction += node.z_upper;
                }
                Err(e) => {
                    error!(%state, conf = %node.conf, error = %e, "Leaf evaluation failed; returning it to the frontier.");
                    first_error.get_or_insert(EngineError::Evaluation {
                        state,
                        conf: node.conf.clone(),
                        reason: e.0,
                    });
                    failed.push(node.clone());
                }
            }
        }

        let resolved = count - failed.len();
        let num_failed = failed.len() as u64;
        let pushes = failed.into_iter().map(Push::Restore).collect();
        self.commit(
            Commit {
                originals: nodes,
                released: count,
                progressed: resolved > 0,
                ..Commit::new(state, tx, pushes)
            },
            stats,
        )?;

        let s = &mut stats[state.index()];
        s.resolved += resolved as u64;
        s.failed += num_failed;
        if resolved > 0 {
            self.ws.perf.observe(
                state,
                calc.num_positions(),
                reduction,
                started.elapsed() / resolved as u32,
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Puts a node whose processing failed back where it is read first.
    fn restore(&self, node: Node, stats: &mut [PhaseStats]) -> Result<(), EngineError> {
        let state = node.state;
        self.commit(
            Commit::new(state, LedgerTransaction::new(), vec![Push::Restore(node)]),
            stats,
        )?;
        Ok(())
    }

    /// Whether `pushes` new nodes of `state` fit next to the slots reserved
    /// for the other nodes in flight.
    fn has_room(&self, frontier: &Frontier, state: StateId, pushes: usize) -> bool {
        match frontier {
            Frontier::Sweep(sweep) => {
                let others = self.ws.in_flight.count(state).saturating_sub(1);
                pushes + others <= sweep.capacity_remaining(state)
            }
            Frontier::Priority(_) => true,
        }
    }

    /// Applies a commit atomically and releases its in-flight nodes.
    fn commit(&self, commit: Commit, stats: &mut [PhaseStats]) -> Result<CommitOutcome, EngineError> {
        let state = commit.state;
        let released = commit.released;
        let mut evicted = Vec::new();
        let outcome = {
            let mut frontier = self.ws.frontier.lock();
            let outcome = self.commit_locked(&mut frontier, commit, &mut evicted);
            self.ws.in_flight.release(state, released);
            outcome
        };
        stats[state.index()].evicted += evicted.len() as u64;
        for node in &evicted {
            self.notify(node, DropReason::Evicted);
        }
        outcome
    }

    /// A commit that needs room and finds none defers its originals to the
    /// next sweep step. One the ledger rejects restores its originals and
    /// fails; nothing else of it is applied.
    fn commit_locked(
        &self,
        frontier: &mut Frontier,
        commit: Commit,
        evicted: &mut Vec<Node>,
    ) -> Result<CommitOutcome, EngineError> {
        let Commit {
            state,
            mut tx,
            pushes,
            originals,
            needs_room,
            progressed,
            ..
        } = commit;

        if needs_room && !self.has_room(frontier, state, pushes.len()) {
            debug!(%state, pushes = pushes.len(), "No room for children; deferring node.");
            for node in originals {
                frontier.requeue(node, &mut NoDrops)?;
            }
            return Ok(CommitOutcome::NoRoom);
        }

        let mut ledger = self.ws.ledger.lock();
        if let Err(e) = ledger.check(&tx) {
            if !originals.is_empty() {
                debug!(%state, nodes = originals.len(), "Ledger refused the update; restoring its nodes.");
                {
                    let mut sink = |n: &Node| evicted.push(n.clone());
                    for node in originals {
                        frontier.restore(node, &mut sink)?;
                    }
                }
                let mut drops = LedgerTransaction::new();
                self.record_evictions(&mut drops, evicted);
                ledger.apply(drops)?;
            }
            return Err(e.into());
        }

        {
            let mut sink = |n: &Node| evicted.push(n.clone());
            for push in pushes {
                match push {
                    Push::Child(node) => frontier.push(node, &mut sink)?,
                    Push::Deferred(node) => frontier.requeue(node, &mut sink)?,
                    Push::Restore(node) => frontier.restore(node, &mut sink)?,
                }
            }
        }
        self.record_evictions(&mut tx, evicted);
        ledger.apply(tx)?;

        if progressed {
            if let Some(sweep) = frontier.as_sweep_mut() {
                sweep.note_progress(state);
            }
        }
        Ok(CommitOutcome::Committed)
    }

    fn record_evictions(&self, tx: &mut LedgerTransaction, evicted: &[Node]) {
        for node in evicted {
            let seq = self.ctx.calc(node.state).project(&node.conf);
            tx.drop_pending(node.state, seq, node.z_upper);
        }
    }

    fn notify(&self, node: &Node, reason: DropReason) {
        if let Some(observer) = self.observer {
            observer(node, reason);
        }
    }
}
