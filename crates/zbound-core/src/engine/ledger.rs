use super::config::SoundnessConfig;
use crate::core::io::ledger_file::{LedgerFile, LedgerFileError, LedgerRecord};
use crate::core::math::bigexp::BigExp;
use crate::core::models::sequence::Sequence;
use crate::core::models::space::StateId;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(
        "Bound of {seq} in {state} widened: {added} added against {removed} removed"
    )]
    BoundViolation {
        state: StateId,
        seq: Sequence,
        added: BigExp,
        removed: BigExp,
    },

    #[error("Ledger persistence failed: {0}")]
    File(#[from] LedgerFileError),
}

/// Accumulated mass of one `(state, sequence)` entry.
///
/// `exact` is the partition function of resolved leaves, `pending` the bounds
/// of nodes in the frontier or in flight and `dropped` the bounds of nodes that
/// were pruned or evicted. Dropped mass stays in the upper bound.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerEntry {
    pub exact: BigExp,
    pub pending: BigExp,
    pub dropped: BigExp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StateTotals {
    /// Root bounds ever credited.
    pub roots: BigExp,
    /// Bound reduction recorded by expansions and resolutions.
    pub tightened: BigExp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZBounds {
    pub lower: BigExp,
    pub upper: BigExp,
}

impl ZBounds {
    pub fn width(&self) -> BigExp {
        (self.upper - self.lower).clamp_non_negative()
    }

    pub fn is_resolved(&self, tolerance: f64) -> bool {
        self.width() <= self.upper * tolerance
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOp {
    AddPending {
        state: StateId,
        seq: Sequence,
        z: BigExp,
        root: bool,
    },
    SubPending {
        state: StateId,
        seq: Sequence,
        z: BigExp,
    },
    AddExact {
        state: StateId,
        seq: Sequence,
        z: BigExp,
    },
    /// A child pruned before it ever reached the frontier.
    AddDropped {
        state: StateId,
        seq: Sequence,
        z: BigExp,
    },
    /// Moves a pending bound to dropped.
    Drop {
        state: StateId,
        seq: Sequence,
        z: BigExp,
    },
    /// Moves a dropped bound back to pending.
    Restore {
        state: StateId,
        seq: Sequence,
        z: BigExp,
    },
    Tighten {
        state: StateId,
        z: BigExp,
    },
}

impl LedgerOp {
    fn state(&self) -> StateId {
        match self {
            LedgerOp::AddPending { state, .. }
            | LedgerOp::SubPending { state, .. }
            | LedgerOp::AddExact { state, .. }
            | LedgerOp::AddDropped { state, .. }
            | LedgerOp::Drop { state, .. }
            | LedgerOp::Restore { state, .. }
            | LedgerOp::Tighten { state, .. } => *state,
        }
    }
}

/// Ledger changes that commit together with one frontier mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerTransaction {
    ops: Vec<LedgerOp>,
}

impl LedgerTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, state: StateId, seq: Sequence, z: BigExp) {
        self.ops.push(LedgerOp::AddPending {
            state,
            seq,
            z,
            root: true,
        });
    }

    pub fn add_pending(&mut self, state: StateId, seq: Sequence, z: BigExp) {
        self.ops.push(LedgerOp::AddPending {
            state,
            seq,
            z,
            root: false,
        });
    }

    pub fn sub_pending(&mut self, state: StateId, seq: Sequence, z: BigExp) {
        self.ops.push(LedgerOp::SubPending { state, seq, z });
    }

    pub fn add_exact(&mut self, state: StateId, seq: Sequence, z: BigExp) {
        self.ops.push(LedgerOp::AddExact { state, seq, z });
    }

    pub fn add_dropped(&mut self, state: StateId, seq: Sequence, z: BigExp) {
        self.ops.push(LedgerOp::AddDropped { state, seq, z });
    }

    pub fn drop_pending(&mut self, state: StateId, seq: Sequence, z: BigExp) {
        self.ops.push(LedgerOp::Drop { state, seq, z });
    }

    pub fn restore(&mut self, state: StateId, seq: Sequence, z: BigExp) {
        self.ops.push(LedgerOp::Restore { state, seq, z });
    }

    pub fn tighten(&mut self, state: StateId, z: BigExp) {
        self.ops.push(LedgerOp::Tighten { state, z });
    }

    pub fn ops(&self) -> &[LedgerOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn extend(&mut self, other: LedgerTransaction) {
        self.ops.extend(other.ops);
    }

    /// Sequences whose upper bound this transaction raises, with the raised and
    /// removed mass over generalizing sequences.
    fn upper_changes(&self) -> Vec<(StateId, Sequence, BigExp, BigExp)> {
        let mut checked: HashSet<(StateId, &Sequence)> = HashSet::new();
        let mut changes = Vec::new();
        for op in &self.ops {
            let (state, target) = match op {
                LedgerOp::AddPending {
                    state,
                    seq,
                    root: false,
                    ..
                }
                | LedgerOp::AddExact { state, seq, .. }
                | LedgerOp::AddDropped { state, seq, .. } => (*state, seq),
                _ => continue,
            };
            if !checked.insert((state, target)) {
                continue;
            }
            let mut added = BigExp::ZERO;
            let mut removed = BigExp::ZERO;
            for other in &self.ops {
                match other {
                    LedgerOp::AddPending {
                        state: s,
                        seq,
                        z,
                        root: false,
                    }
                    | LedgerOp::AddExact { state: s, seq, z }
                    | LedgerOp::AddDropped { state: s, seq, z }
                        if *s == state && seq.generalizes(target) =>
                    {
                        added += *z;
                    }
                    LedgerOp::SubPending { state: s, seq, z }
                        if *s == state && seq.generalizes(target) =>
                    {
                        removed += *z;
                    }
                    _ => {}
                }
            }
            changes.push((state, target.clone(), added, removed));
        }
        changes
    }
}

#[derive(Debug, Clone, Default)]
struct StateBook {
    entries: HashMap<Sequence, LedgerEntry>,
    totals: StateTotals,
}

/// The per-state, per-sequence accounting of partition function mass.
#[derive(Debug, Clone)]
pub struct LedgerBook {
    states: Vec<StateBook>,
}

impl LedgerBook {
    pub fn new(num_states: usize) -> Self {
        Self {
            states: vec![StateBook::default(); num_states],
        }
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn entry(&self, state: StateId, seq: &Sequence) -> Option<&LedgerEntry> {
        self.states.get(state.index())?.entries.get(seq)
    }

    pub fn entries(&self, state: StateId) -> impl Iterator<Item = (&Sequence, &LedgerEntry)> {
        self.states
            .get(state.index())
            .into_iter()
            .flat_map(|book| book.entries.iter())
    }

    pub fn totals(&self, state: StateId) -> StateTotals {
        self.states
            .get(state.index())
            .map(|book| book.totals)
            .unwrap_or_default()
    }

    /// Bounds on the partition function of `seq` in `state`.
    ///
    /// Exact mass is only ever credited to leaf projections. Those are complete
    /// on the positions the state covers and open elsewhere, so the leaves of
    /// `seq` are exactly the entries that generalize it. The upper bound adds
    /// every unresolved subtree that can still reach `seq`.
    pub fn bounds(&self, state: StateId, seq: &Sequence) -> ZBounds {
        let mut lower = BigExp::ZERO;
        let mut open = BigExp::ZERO;
        for (p, entry) in self.entries(state).filter(|(p, _)| p.generalizes(seq)) {
            lower += entry.exact;
            open += entry.pending + entry.dropped;
        }
        ZBounds {
            lower,
            upper: lower + open.clamp_non_negative(),
        }
    }

    pub fn sum_exact(&self, state: StateId) -> BigExp {
        self.entries(state).map(|(_, e)| e.exact).sum()
    }

    pub fn sum_pending(&self, state: StateId) -> BigExp {
        self.entries(state).map(|(_, e)| e.pending).sum()
    }

    pub fn sum_dropped(&self, state: StateId) -> BigExp {
        self.entries(state).map(|(_, e)| e.dropped).sum()
    }

    /// `roots - (exact + pending + dropped + tightened)`, zero up to rounding.
    pub fn conservation_residual(&self, state: StateId) -> BigExp {
        let totals = self.totals(state);
        totals.roots
            - (self.sum_exact(state)
                + self.sum_pending(state)
                + self.sum_dropped(state)
                + totals.tightened)
    }

    /// Complete sequences with an entry in any state, sorted.
    pub fn complete_sequences(&self) -> Vec<Sequence> {
        let mut seqs: Vec<Sequence> = self
            .states
            .iter()
            .flat_map(|book| book.entries.keys())
            .filter(|seq| seq.is_complete())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        seqs.sort();
        seqs
    }

    /// Applies every operation and returns the keys whose records changed.
    fn apply(&mut self, tx: &LedgerTransaction) -> Vec<(StateId, Option<Sequence>)> {
        let mut touched = Vec::new();
        for op in &tx.ops {
            let state = op.state();
            let Some(book) = self.states.get_mut(state.index()) else {
                continue;
            };
            match op {
                LedgerOp::Tighten { z, .. } => {
                    book.totals.tightened += *z;
                    touched.push((state, None));
                }
                LedgerOp::AddPending { seq, z, root, .. } => {
                    book.entries.entry(seq.clone()).or_default().pending += *z;
                    if *root {
                        book.totals.roots += *z;
                        touched.push((state, None));
                    }
                    touched.push((state, Some(seq.clone())));
                }
                LedgerOp::SubPending { seq, z, .. } => {
                    book.entries.entry(seq.clone()).or_default().pending -= *z;
                    touched.push((state, Some(seq.clone())));
                }
                LedgerOp::AddExact { seq, z, .. } => {
                    book.entries.entry(seq.clone()).or_default().exact += *z;
                    touched.push((state, Some(seq.clone())));
                }
                LedgerOp::AddDropped { seq, z, .. } => {
                    book.entries.entry(seq.clone()).or_default().dropped += *z;
                    touched.push((state, Some(seq.clone())));
                }
                LedgerOp::Drop { seq, z, .. } => {
                    let entry = book.entries.entry(seq.clone()).or_default();
                    entry.pending -= *z;
                    entry.dropped += *z;
                    touched.push((state, Some(seq.clone())));
                }
                LedgerOp::Restore { seq, z, .. } => {
                    let entry = book.entries.entry(seq.clone()).or_default();
                    entry.dropped -= *z;
                    entry.pending += *z;
                    touched.push((state, Some(seq.clone())));
                }
            }
        }
        touched.sort();
        touched.dedup();
        touched
    }

    fn record(&self, key: &(StateId, Option<Sequence>)) -> Option<LedgerRecord> {
        match key {
            (state, None) => {
                let totals = self.totals(*state);
                Some(LedgerRecord::Totals {
                    state: *state,
                    roots: totals.roots,
                    tightened: totals.tightened,
                })
            }
            (state, Some(seq)) => self.entry(*state, seq).map(|entry| LedgerRecord::Entry {
                state: *state,
                seq: seq.clone(),
                exact: entry.exact,
                pending: entry.pending,
                dropped: entry.dropped,
            }),
        }
    }

    fn load(&mut self, records: Vec<LedgerRecord>) {
        for record in records {
            match record {
                LedgerRecord::Entry {
                    state,
                    seq,
                    exact,
                    pending,
                    dropped,
                } => {
                    if let Some(book) = self.states.get_mut(state.index()) {
                        book.entries.insert(
                            seq,
                            LedgerEntry {
                                exact,
                                pending,
                                dropped,
                            },
                        );
                    }
                }
                LedgerRecord::Totals {
                    state,
                    roots,
                    tightened,
                } => {
                    if let Some(book) = self.states.get_mut(state.index()) {
                        book.totals = StateTotals { roots, tightened };
                    }
                }
            }
        }
    }
}

/// The ledger with its soundness checks and optional persistence.
#[derive(Debug)]
pub struct SequenceLedger {
    book: LedgerBook,
    file: Option<LedgerFile>,
    tolerance: f64,
    fatal_violations: bool,
    violations: usize,
}

impl SequenceLedger {
    pub fn in_memory(num_states: usize, soundness: &SoundnessConfig) -> Self {
        Self {
            book: LedgerBook::new(num_states),
            file: None,
            tolerance: soundness.tolerance,
            fatal_violations: soundness.fatal_violations,
            violations: 0,
        }
    }

    /// Opens the persisted ledger at `path`, replaying its contents unless `fresh`.
    pub fn open(
        path: &Path,
        num_states: usize,
        seq_width: usize,
        soundness: &SoundnessConfig,
        fresh: bool,
    ) -> Result<Self, LedgerError> {
        let mut ledger = Self::in_memory(num_states, soundness);
        if fresh {
            ledger.file = Some(LedgerFile::create(path, seq_width)?);
        } else {
            let (file, records) = LedgerFile::open(path, seq_width)?;
            debug!(path = %path.display(), records = records.len(), "Replayed ledger file.");
            ledger.book.load(records);
            ledger.file = Some(file);
        }
        Ok(ledger)
    }

    #[inline]
    pub fn book(&self) -> &LedgerBook {
        &self.book
    }

    pub fn snapshot(&self) -> LedgerBook {
        self.book.clone()
    }

    #[inline]
    pub fn violations(&self) -> usize {
        self.violations
    }

    /// Verifies that no upper bound widens. Violations are always logged and
    /// become errors only when configured as fatal.
    pub fn check(&mut self, tx: &LedgerTransaction) -> Result<(), LedgerError> {
        for (state, seq, added, removed) in tx.upper_changes() {
            if added - removed > removed * self.tolerance {
                self.violations += 1;
                error!(
                    %state,
                    %seq,
                    %added,
                    %removed,
                    "Ledger bound widened beyond tolerance."
                );
                if self.fatal_violations {
                    return Err(LedgerError::BoundViolation {
                        state,
                        seq,
                        added,
                        removed,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn apply(&mut self, tx: LedgerTransaction) -> Result<(), LedgerError> {
        let touched = self.book.apply(&tx);
        if let Some(file) = self.file.as_mut() {
            let records: Vec<LedgerRecord> =
                touched.iter().filter_map(|key| self.book.record(key)).collect();
            file.append(&records)?;
        }
        Ok(())
    }

    pub fn commit(&mut self, tx: LedgerTransaction) -> Result<(), LedgerError> {
        self.check(&tx)?;
        self.apply(tx)
    }

    pub fn sync(&mut self) -> Result<(), LedgerError> {
        if let Some(file) = self.file.as_mut() {
            file.sync()?;
        }
        Ok(())
    }
}
