//! Loading of multi-state conformation spaces from TOML.
//!
//! A space file declares the shared sequence positions first and then one
//! table per state with its positions, residue conformations and energies:
//!
//! ```toml
//! [[sequence-positions]]
//! name = "A23"
//! residue-types = ["ALA", "GLY"]
//!
//! [[states]]
//! name = "complex"
//! constant = -12.5
//!
//! [[states.positions]]
//! name = "A23"
//! sequence-position = "A23"
//! rcs = [
//!     { name = "ALA", residue-type = "ALA", energy = -1.0 },
//!     { name = "GLY", residue-type = "GLY", energy = 0.5 },
//! ]
//!
//! [[states.pairs]]
//! positions = ["A23", "B10"]
//! energies = [[0.0, 1.0], [2.0, 0.5]]
//! ```

use crate::core::models::energy::EnergyMatrix;
use crate::core::models::sequence::{SeqPosition, SeqSpace};
use crate::core::models::space::{ConfSpace, MultiStateSpace, Position, Rc, StateId, StateSpace};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Represents errors that can occur while loading a conformation space file.
#[derive(Debug, Error)]
pub enum SpaceLoadError {
    /// The file could not be read from disk.
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the expected layout.
    #[error("TOML parsing error in '{path}': {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    /// A state position refers to a sequence position that was never declared.
    #[error("State '{state}', position '{position}': unknown sequence position '{name}'")]
    UnknownSequencePosition {
        state: String,
        position: String,
        name: String,
    },

    /// A residue conformation names a residue type its sequence position does not allow.
    #[error("State '{state}', position '{position}': residue type '{residue_type}' is not allowed")]
    UnknownResidueType {
        state: String,
        position: String,
        residue_type: String,
    },

    /// A residue conformation at a mutable position carries no residue type.
    #[error("State '{state}', position '{position}': conformation '{rc}' needs a residue type")]
    MissingResidueType {
        state: String,
        position: String,
        rc: String,
    },

    /// A pair table refers to a position the state does not define.
    #[error("State '{state}': pair refers to unknown position '{position}'")]
    UnknownPosition { state: String, position: String },

    /// A pair table does not have one row per choice of the first position and
    /// one column per choice of the second.
    #[error("State '{state}': pair ({first}, {second}) energies must be a {rows}x{cols} table")]
    PairShape {
        state: String,
        first: String,
        second: String,
        rows: usize,
        cols: usize,
    },

    /// A position with no choices makes the whole state empty.
    #[error("State '{state}', position '{position}' has no residue conformations")]
    EmptyPosition { state: String, position: String },

    /// Names of states, positions or sequence positions must be unique.
    #[error("Duplicate name '{0}'")]
    DuplicateName(String),

    /// State ids are stored in a single byte.
    #[error("Too many states: {0} (at most 256 are supported)")]
    TooManyStates(usize),
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawSpaceFile {
    #[serde(default)]
    sequence_positions: Vec<RawSeqPosition>,
    states: Vec<RawState>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawSeqPosition {
    name: String,
    residue_types: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawState {
    name: String,
    #[serde(default)]
    constant: f64,
    positions: Vec<RawPosition>,
    #[serde(default)]
    pairs: Vec<RawPair>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawPosition {
    name: String,
    sequence_position: Option<String>,
    rcs: Vec<RawRc>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawRc {
    name: String,
    residue_type: Option<String>,
    #[serde(default)]
    energy: f64,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawPair {
    positions: [String; 2],
    energies: Vec<Vec<f64>>,
}

impl MultiStateSpace {
    /// Loads and validates a conformation space file.
    pub fn load(path: &Path) -> Result<Self, SpaceLoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| SpaceLoadError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content, &path.to_string_lossy())
    }

    /// Parses a conformation space from TOML text; `origin` only labels errors.
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, SpaceLoadError> {
        let raw: RawSpaceFile = toml::from_str(content).map_err(|e| SpaceLoadError::Toml {
            path: origin.to_string(),
            source: e,
        })?;
        build_space(raw)
    }
}

fn build_space(raw: RawSpaceFile) -> Result<MultiStateSpace, SpaceLoadError> {
    if raw.states.len() > 256 {
        return Err(SpaceLoadError::TooManyStates(raw.states.len()));
    }

    let mut seq_positions = Vec::with_capacity(raw.sequence_positions.len());
    for p in raw.sequence_positions {
        if seq_positions.iter().any(|s: &SeqPosition| s.name == p.name) {
            return Err(SpaceLoadError::DuplicateName(p.name));
        }
        seq_positions.push(SeqPosition {
            name: p.name,
            labels: p.residue_types,
        });
    }
    let seq_space = SeqSpace::new(seq_positions);

    let mut states: Vec<StateSpace> = Vec::with_capacity(raw.states.len());
    for (index, raw_state) in raw.states.into_iter().enumerate() {
        if states.iter().any(|s| s.name == raw_state.name) {
            return Err(SpaceLoadError::DuplicateName(raw_state.name));
        }
        let state = build_state(StateId(index as u8), raw_state, &seq_space)?;
        debug!(
            state = %state.name,
            positions = state.conf_space.num_positions(),
            "Loaded state conformation space."
        );
        states.push(state);
    }

    Ok(MultiStateSpace { seq_space, states })
}

fn build_state(
    id: StateId,
    raw: RawState,
    seq_space: &SeqSpace,
) -> Result<StateSpace, SpaceLoadError> {
    let mut positions = Vec::with_capacity(raw.positions.len());
    let mut one_body = Vec::with_capacity(raw.positions.len());

    for raw_pos in &raw.positions {
        if positions.iter().any(|p: &Position| p.name == raw_pos.name) {
            return Err(SpaceLoadError::DuplicateName(raw_pos.name.clone()));
        }
        if raw_pos.rcs.is_empty() {
            return Err(SpaceLoadError::EmptyPosition {
                state: raw.name.clone(),
                position: raw_pos.name.clone(),
            });
        }

        let seq_pos = match &raw_pos.sequence_position {
            Some(name) => Some(seq_space.position_index(name).ok_or_else(|| {
                SpaceLoadError::UnknownSequencePosition {
                    state: raw.name.clone(),
                    position: raw_pos.name.clone(),
                    name: name.clone(),
                }
            })?),
            None => None,
        };

        let mut rcs = Vec::with_capacity(raw_pos.rcs.len());
        for raw_rc in &raw_pos.rcs {
            let label = match seq_pos {
                Some(seq_pos) => {
                    let residue_type = raw_rc.residue_type.as_ref().ok_or_else(|| {
                        SpaceLoadError::MissingResidueType {
                            state: raw.name.clone(),
                            position: raw_pos.name.clone(),
                            rc: raw_rc.name.clone(),
                        }
                    })?;
                    seq_space.label_index(seq_pos, residue_type).ok_or_else(|| {
                        SpaceLoadError::UnknownResidueType {
                            state: raw.name.clone(),
                            position: raw_pos.name.clone(),
                            residue_type: residue_type.clone(),
                        }
                    })?
                }
                None => 0,
            };
            rcs.push(Rc {
                name: raw_rc.name.clone(),
                label,
            });
        }

        one_body.push(raw_pos.rcs.iter().map(|rc| rc.energy).collect::<Vec<_>>());
        positions.push(Position {
            name: raw_pos.name.clone(),
            seq_pos,
            rcs,
        });
    }

    let conf_space = ConfSpace::new(positions, seq_space.len());
    let mut emat = EnergyMatrix::zeroed(&conf_space.rc_counts());
    emat.set_constant(raw.constant);
    for (pos, energies) in one_body.iter().enumerate() {
        for (rc, &energy) in energies.iter().enumerate() {
            emat.set_one(pos, rc, energy);
        }
    }

    let index_of: HashMap<&str, usize> = conf_space
        .positions
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    for pair in &raw.pairs {
        let lookup = |name: &String| {
            index_of
                .get(name.as_str())
                .copied()
                .ok_or_else(|| SpaceLoadError::UnknownPosition {
                    state: raw.name.clone(),
                    position: name.clone(),
                })
        };
        let first = lookup(&pair.positions[0])?;
        let second = lookup(&pair.positions[1])?;
        let rows = conf_space.positions[first].rcs.len();
        let cols = conf_space.positions[second].rcs.len();
        let well_formed = first != second
            && pair.energies.len() == rows
            && pair.energies.iter().all(|row| row.len() == cols);
        if !well_formed {
            return Err(SpaceLoadError::PairShape {
                state: raw.name.clone(),
                first: pair.positions[0].clone(),
                second: pair.positions[1].clone(),
                rows,
                cols,
            });
        }
        for (rc1, row) in pair.energies.iter().enumerate() {
            for (rc2, &energy) in row.iter().enumerate() {
                emat.set_pair(first, rc1, second, rc2, energy);
            }
        }
    }

    Ok(StateSpace {
        id,
        name: raw.name,
        conf_space,
        emat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::conf::Conf;
    use std::io::Write;

    const SPACE: &str = r#"
[[sequence-positions]]
name = "A1"
residue-types = ["ALA", "GLY"]

[[states]]
name = "complex"
constant = 1.5

[[states.positions]]
name = "A1"
sequence-position = "A1"
rcs = [
    { name = "ala", residue-type = "ALA", energy = -1.0 },
    { name = "gly-1", residue-type = "GLY", energy = 0.5 },
    { name = "gly-2", residue-type = "GLY" },
]

[[states.positions]]
name = "B7"
rcs = [{ name = "r0", energy = 2.0 }, { name = "r1" }]

[[states.pairs]]
positions = ["B7", "A1"]
energies = [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]

[[states]]
name = "target"

[[states.positions]]
name = "B7"
rcs = [{ name = "r0" }]
"#;

    #[test]
    fn load_builds_states_positions_and_energies() {
        let space = MultiStateSpace::from_toml_str(SPACE, "inline").unwrap();
        assert_eq!(space.seq_space.len(), 1);
        assert_eq!(space.states.len(), 2);

        let complex = space.state_by_name("complex").unwrap();
        assert_eq!(complex.id, StateId(0));
        assert_eq!(complex.conf_space.positions[0].seq_pos, Some(0));
        assert_eq!(complex.conf_space.positions[0].rcs[2].label, 1);
        assert_eq!(complex.conf_space.positions[1].seq_pos, None);
        assert_eq!(complex.emat.constant(), 1.5);
        assert_eq!(complex.emat.one(0, 0), -1.0);
        assert_eq!(complex.emat.one(1, 0), 2.0);
        assert_eq!(complex.emat.pair(0, 2, 1, 1), 0.6);

        let conf = Conf::from_choices(&[1, 0]).unwrap();
        assert_eq!(complex.emat.conf_energy(&conf), Some(1.5 + 0.5 + 2.0 + 0.2));
        assert_eq!(space.state_by_name("target").unwrap().id, StateId(1));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SPACE.as_bytes()).unwrap();
        let space = MultiStateSpace::load(file.path()).unwrap();
        assert_eq!(space.max_positions(), 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = MultiStateSpace::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(SpaceLoadError::Io { .. })));
    }

    #[test]
    fn unknown_residue_type_is_rejected() {
        let bad = SPACE.replace("residue-type = \"ALA\"", "residue-type = \"TRP\"");
        let result = MultiStateSpace::from_toml_str(&bad, "inline");
        assert!(matches!(
            result,
            Err(SpaceLoadError::UnknownResidueType { residue_type, .. }) if residue_type == "TRP"
        ));
    }

    #[test]
    fn misshapen_pair_table_is_rejected() {
        let bad = SPACE.replace("[0.4, 0.5, 0.6]", "[0.4, 0.5]");
        let result = MultiStateSpace::from_toml_str(&bad, "inline");
        assert!(matches!(result, Err(SpaceLoadError::PairShape { rows: 2, cols: 3, .. })));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let bad = SPACE.replace("constant = 1.5", "constant = 1.5\ncolour = \"red\"");
        let result = MultiStateSpace::from_toml_str(&bad, "inline");
        assert!(matches!(result, Err(SpaceLoadError::Toml { .. })));
    }
}
