//! Tabular export of per-sequence bounds.

use super::ledger::LedgerBook;
use crate::core::math::boltzmann::BoltzmannCalculator;
use crate::core::models::sequence::Sequence;
use crate::core::models::space::MultiStateSpace;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("CSV error for '{path}': {source}")]
    Csv { path: String, source: csv::Error },
}

/// Bounds of one state's partition function for one sequence.
///
/// Bounds are given as base-10 logarithms, and as free energy bounds in
/// kcal/mol (the lower free energy comes from the upper partition function).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsRow {
    pub state: String,
    pub sequence: String,
    pub log10_z_lower: f64,
    pub log10_z_upper: f64,
    pub free_energy_lower: f64,
    pub free_energy_upper: f64,
    pub resolved: bool,
}

/// One row per state and sequence, ordered by state then by sequence.
pub fn bounds_table(
    space: &MultiStateSpace,
    book: &LedgerBook,
    sequences: &[Sequence],
    bcalc: &BoltzmannCalculator,
    tolerance: f64,
) -> Vec<BoundsRow> {
    space
        .states
        .iter()
        .cartesian_product(sequences.iter().sorted())
        .map(|(state, seq)| {
            let bounds = book.bounds(state.id, seq);
            BoundsRow {
                state: state.name.clone(),
                sequence: space.seq_space.format(seq),
                log10_z_lower: bounds.lower.log10(),
                log10_z_upper: bounds.upper.log10(),
                free_energy_lower: bcalc.free_energy(bounds.upper),
                free_energy_upper: bcalc.free_energy(bounds.lower),
                resolved: bounds.is_resolved(tolerance),
            }
        })
        .collect()
}

pub fn write_csv<W: Write>(writer: W, rows: &[BoundsRow]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_csv_file(path: &Path, rows: &[BoundsRow]) -> Result<(), ReportError> {
    let to_error = |source: csv::Error| ReportError::Csv {
        path: path.to_string_lossy().to_string(),
        source,
    };
    let file = std::fs::File::create(path).map_err(|e| to_error(e.into()))?;
    write_csv(file, rows).map_err(to_error)
}

pub fn read_csv_file(path: &Path) -> Result<Vec<BoundsRow>, ReportError> {
    let to_error = |source: csv::Error| ReportError::Csv {
        path: path.to_string_lossy().to_string(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(to_error)?;
    reader
        .deserialize::<BoundsRow>()
        .map(|row| row.map_err(to_error))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::bigexp::BigExp;
    use crate::core::models::space::StateId;
    use crate::engine::config::SoundnessConfig;
    use crate::engine::ledger::{LedgerTransaction, SequenceLedger};
    use crate::test_utils;
    use tempfile::tempdir;

    fn book_with_one_resolved_sequence() -> (MultiStateSpace, LedgerBook, Vec<Sequence>) {
        let space = test_utils::three_by_two_space();
        let sequences = space.seq_space.complete_sequences();
        let soundness = SoundnessConfig {
            tolerance: 1e-9,
            fatal_violations: true,
        };
        let mut ledger = SequenceLedger::in_memory(space.states.len(), &soundness);
        let mut tx = LedgerTransaction::new();
        let target = sequences[0].clone();
        tx.add_exact(StateId(0), target, BigExp::from_f64(100.0));
        tx.add_pending(
            StateId(0),
            Sequence::wildcard(space.seq_space.len()),
            BigExp::from_f64(5.0),
        );
        ledger.apply(tx).unwrap();
        (space, ledger.snapshot(), sequences)
    }

    #[test]
    fn rows_cover_every_state_and_sequence() {
        let (space, book, sequences) = book_with_one_resolved_sequence();
        let bcalc = BoltzmannCalculator::new(298.15);
        let rows = bounds_table(&space, &book, &sequences, &bcalc, 0.1);
        assert_eq!(rows.len(), space.states.len() * sequences.len());

        let first = &rows[0];
        assert_eq!(first.sequence, space.seq_space.format(&sequences[0]));
        assert!((first.log10_z_lower - 2.0).abs() < 1e-12);
        assert!((first.log10_z_upper - 105f64.log10()).abs() < 1e-12);
        assert!(first.free_energy_lower <= first.free_energy_upper);
        assert!(first.resolved);

        let unresolved = &rows[1];
        assert_eq!(unresolved.log10_z_lower, f64::NEG_INFINITY);
        assert!(!unresolved.resolved);
    }

    #[test]
    fn csv_file_reads_back_the_written_rows() {
        let (space, book, sequences) = book_with_one_resolved_sequence();
        let bcalc = BoltzmannCalculator::new(298.15);
        let rows = bounds_table(&space, &book, &sequences, &bcalc, 0.1);

        let dir = tempdir().unwrap();
        let path = dir.path().join("bounds.csv");
        write_csv_file(&path, &rows).unwrap();
        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("state,sequence,log10_z_lower"));

        let read = read_csv_file(&path).unwrap();
        assert_eq!(read.len(), rows.len());
        assert_eq!(read[0], rows[0]);
        assert_eq!(read[1].state, rows[1].state);
        assert!(!read[1].resolved);
    }
}
