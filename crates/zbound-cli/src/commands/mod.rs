pub mod cluster;
pub mod estimate;

use crate::cli::RunArgs;
use crate::error::{CliError, Result};
use crate::utils::parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use zbound::core::models::sequence::Sequence;
use zbound::core::models::space::MultiStateSpace;
use zbound::engine::config::EstimatorConfig;
use zbound::engine::criterion::SequenceWidths;
use zbound::engine::ledger::LedgerBook;
use zbound::engine::processor::PhaseStats;
use zbound::engine::report::{self, BoundsRow};

pub(crate) fn load_space(path: &Path) -> Result<Arc<MultiStateSpace>> {
    info!("Loading conformation space from {:?}", path);
    let space = MultiStateSpace::load(path).map_err(|e| CliError::FileParsing {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    info!(
        states = space.states.len(),
        sequence_positions = space.seq_space.len(),
        "Conformation space loaded."
    );
    Ok(Arc::new(space))
}

/// The sequences named by `--sequence`, or every sequence of the space.
pub(crate) fn target_sequences(space: &MultiStateSpace, args: &RunArgs) -> Result<Vec<Sequence>> {
    if args.sequences.is_empty() {
        return Ok(space.seq_space.complete_sequences());
    }
    args.sequences
        .iter()
        .map(|text| {
            parser::parse_sequence(&space.seq_space, text)
                .map_err(|e| CliError::Argument(e.to_string()))
        })
        .collect()
}

pub(crate) fn criterion(targets: &[Sequence], args: &RunArgs) -> Result<SequenceWidths> {
    if !(args.tolerance >= 0.0) {
        return Err(CliError::Argument(format!(
            "Tolerance must not be negative, got {}",
            args.tolerance
        )));
    }
    Ok(SequenceWidths::new(targets.to_vec(), args.tolerance))
}

/// Prints the bound table and per-state counters, and writes the CSV export
/// when one was asked for.
pub(crate) fn report_bounds(
    space: &MultiStateSpace,
    config: &EstimatorConfig,
    book: &LedgerBook,
    targets: &[Sequence],
    totals: &[PhaseStats],
    args: &RunArgs,
) -> Result<Vec<BoundsRow>> {
    let rows = report::bounds_table(space, book, targets, &config.bcalc(), args.tolerance);

    for (state, stats) in space.states.iter().zip(totals) {
        info!(state = %state.name, "{}", stats);
    }

    println!(
        "{:<16} {:<24} {:>12} {:>12} {:>10}",
        "state", "sequence", "log10 Z-", "log10 Z+", "resolved"
    );
    for row in &rows {
        println!(
            "{:<16} {:<24} {:>12.4} {:>12.4} {:>10}",
            row.state,
            row.sequence,
            row.log10_z_lower,
            row.log10_z_upper,
            if row.resolved { "yes" } else { "no" }
        );
    }

    if let Some(path) = &args.csv {
        report::write_csv_file(path, &rows)?;
        println!("Bounds written to: {}", path.display());
    }
    Ok(rows)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::{Path, PathBuf};

    pub const SPACE: &str = r#"
[[sequence-positions]]
name = "A1"
residue-types = ["ALA", "GLY"]

[[sequence-positions]]
name = "B2"
residue-types = ["SER", "THR"]

[[states]]
name = "complex"

[[states.positions]]
name = "A1"
sequence-position = "A1"
rcs = [
    { name = "ala", residue-type = "ALA", energy = -1.0 },
    { name = "gly-1", residue-type = "GLY", energy = 0.5 },
    { name = "gly-2", residue-type = "GLY" },
]

[[states.positions]]
name = "B2"
sequence-position = "B2"
rcs = [
    { name = "ser", residue-type = "SER" },
    { name = "thr", residue-type = "THR", energy = 1.0 },
]

[[states.pairs]]
positions = ["A1", "B2"]
energies = [[0.1, 0.2], [0.4, 0.5], [0.0, 0.3]]

[[states]]
name = "unbound"

[[states.positions]]
name = "A1"
sequence-position = "A1"
rcs = [
    { name = "ala", residue-type = "ALA" },
    { name = "gly", residue-type = "GLY", energy = -0.5 },
]
"#;

    pub fn write_space(dir: &Path) -> PathBuf {
        let path = dir.join("space.toml");
        fs::write(&path, SPACE).unwrap();
        path
    }
}
