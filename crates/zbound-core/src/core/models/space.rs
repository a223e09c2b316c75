use super::conf::Conf;
use super::energy::EnergyMatrix;
use super::sequence::{SeqSpace, Sequence};
use std::fmt;

/// Identifies one state (sub-problem) of a multi-state design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u8);

impl StateId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state {}", self.0)
    }
}

/// One discrete choice at a position: a residue type in a specific conformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rc {
    pub name: String,
    /// Index into the residue types of the sequence position; ignored for
    /// positions outside the sequence space.
    pub label: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub name: String,
    /// The sequence position this position determines, if it is mutable.
    pub seq_pos: Option<usize>,
    pub rcs: Vec<Rc>,
}

/// The positions and choices of one state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfSpace {
    pub positions: Vec<Position>,
    num_seq_positions: usize,
}

impl ConfSpace {
    pub fn new(positions: Vec<Position>, num_seq_positions: usize) -> Self {
        Self {
            positions,
            num_seq_positions,
        }
    }

    #[inline]
    pub fn num_positions(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn num_seq_positions(&self) -> usize {
        self.num_seq_positions
    }

    pub fn rc_counts(&self) -> Vec<usize> {
        self.positions.iter().map(|p| p.rcs.len()).collect()
    }

    #[inline]
    pub fn is_mutable(&self, pos: usize) -> bool {
        self.positions[pos].seq_pos.is_some()
    }

    /// Projects a conformation onto the sequence space; unassigned mutable
    /// positions become wildcards.
    pub fn project(&self, conf: &Conf) -> Sequence {
        let mut seq = Sequence::wildcard(self.num_seq_positions);
        for (pos, position) in self.positions.iter().enumerate() {
            if let (Some(seq_pos), Some(rc)) = (position.seq_pos, conf.get(pos)) {
                seq.set(seq_pos, position.rcs[rc].label);
            }
        }
        seq
    }
}

/// A state: its conformation space and the energy bounds over it.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpace {
    pub id: StateId,
    pub name: String,
    pub conf_space: ConfSpace,
    pub emat: EnergyMatrix,
}

/// All states of a design problem over one shared sequence space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiStateSpace {
    pub seq_space: SeqSpace,
    pub states: Vec<StateSpace>,
}

impl MultiStateSpace {
    pub fn state(&self, id: StateId) -> Option<&StateSpace> {
        self.states.get(id.index())
    }

    pub fn state_by_name(&self, name: &str) -> Option<&StateSpace> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn state_ids(&self) -> impl Iterator<Item = StateId> + '_ {
        self.states.iter().map(|s| s.id)
    }

    /// Widest conformation across states; fixed-size records use this width.
    pub fn max_positions(&self) -> usize {
        self.states
            .iter()
            .map(|s| s.conf_space.num_positions())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::sequence::WILDCARD;

    fn conf_space() -> ConfSpace {
        let rc = |name: &str, label| Rc {
            name: name.to_string(),
            label,
        };
        ConfSpace::new(
            vec![
                Position {
                    name: "p0".to_string(),
                    seq_pos: Some(1),
                    rcs: vec![rc("a", 0), rc("b", 1)],
                },
                Position {
                    name: "frame".to_string(),
                    seq_pos: None,
                    rcs: vec![rc("x", 0), rc("y", 0)],
                },
                Position {
                    name: "p2".to_string(),
                    seq_pos: Some(0),
                    rcs: vec![rc("c", 0), rc("d", 1), rc("e", 1)],
                },
            ],
            2,
        )
    }

    #[test]
    fn project_maps_mutable_positions_to_sequence_positions() {
        let space = conf_space();
        let conf = Conf::from_choices(&[1, 0, 2]).unwrap();
        assert_eq!(space.project(&conf).labels(), &[1, 1]);
    }

    #[test]
    fn project_leaves_unassigned_mutable_positions_as_wildcards() {
        let space = conf_space();
        let conf = Conf::unassigned(3).assign(1, 1).unwrap();
        assert_eq!(space.project(&conf).labels(), &[WILDCARD, WILDCARD]);
    }

    #[test]
    fn projection_is_independent_of_assignment_order() {
        let space = conf_space();
        let root = Conf::unassigned(3);
        let first = root.assign(0, 1).unwrap().assign(2, 0).unwrap();
        let second = root.assign(2, 0).unwrap().assign(0, 1).unwrap();
        assert_eq!(space.project(&first), space.project(&second));
    }

    #[test]
    fn mutability_follows_sequence_position() {
        let space = conf_space();
        assert!(space.is_mutable(0));
        assert!(!space.is_mutable(1));
        assert_eq!(space.rc_counts(), vec![2, 2, 3]);
    }
}
