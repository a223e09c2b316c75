use crate::core::models::energy::EnergyMatrix;
use crate::core::models::sequence::{SeqPosition, SeqSpace};
use crate::core::models::space::{ConfSpace, MultiStateSpace, Position, Rc, StateId, StateSpace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i}")).collect()
}

/// Three mutable positions with two residue types each, one conformation per
/// residue type, and energy equal to the sum of the choice indices.
pub fn three_by_two_space() -> MultiStateSpace {
    graded_space(3, 2)
}

/// Mutable positions with one conformation per residue type, where choice `i`
/// costs `i` at every position.
pub fn graded_space(num_positions: usize, num_types: usize) -> MultiStateSpace {
    let seq_space = SeqSpace::new(
        (0..num_positions)
            .map(|i| SeqPosition {
                name: format!("P{i}"),
                labels: names("T", num_types),
            })
            .collect(),
    );
    let positions: Vec<Position> = (0..num_positions)
        .map(|i| Position {
            name: format!("P{i}"),
            seq_pos: Some(i),
            rcs: (0..num_types)
                .map(|rc| Rc {
                    name: format!("rc{rc}"),
                    label: rc as u16,
                })
                .collect(),
        })
        .collect();
    let conf_space = ConfSpace::new(positions, num_positions);
    let mut emat = EnergyMatrix::zeroed(&conf_space.rc_counts());
    for pos in 0..num_positions {
        for rc in 1..num_types {
            emat.set_one(pos, rc, rc as f64);
        }
    }
    MultiStateSpace {
        seq_space,
        states: vec![StateSpace {
            id: StateId(0),
            name: "design".to_string(),
            conf_space,
            emat,
        }],
    }
}

/// Two sequence positions; the state has one position with two conformations of
/// the same residue type and one immutable position.
pub fn labelled_space() -> MultiStateSpace {
    let seq_space = SeqSpace::new(vec![
        SeqPosition {
            name: "S0".to_string(),
            labels: vec!["ALA".to_string(), "GLY".to_string()],
        },
        SeqPosition {
            name: "S1".to_string(),
            labels: vec!["VAL".to_string(), "LEU".to_string()],
        },
    ]);
    let rc = |name: &str, label: u16| Rc {
        name: name.to_string(),
        label,
    };
    let positions = vec![
        Position {
            name: "S0".to_string(),
            seq_pos: Some(0),
            rcs: vec![rc("ala", 0), rc("gly-a", 1), rc("gly-b", 1)],
        },
        Position {
            name: "S1".to_string(),
            seq_pos: Some(1),
            rcs: vec![rc("val", 0), rc("leu", 1)],
        },
        Position {
            name: "F".to_string(),
            seq_pos: None,
            rcs: vec![rc("x", 0), rc("y", 0), rc("z", 0)],
        },
    ];
    let conf_space = ConfSpace::new(positions, 2);
    let mut emat = EnergyMatrix::zeroed(&conf_space.rc_counts());
    emat.set_one(0, 0, -0.5);
    emat.set_one(0, 2, 0.75);
    emat.set_one(2, 1, -1.25);
    emat.set_pair(0, 1, 1, 0, 0.4);
    emat.set_pair(0, 2, 2, 2, -0.3);
    emat.set_pair(1, 1, 2, 0, 0.9);
    MultiStateSpace {
        seq_space,
        states: vec![StateSpace {
            id: StateId(0),
            name: "labelled".to_string(),
            conf_space,
            emat,
        }],
    }
}

/// A random multi-state space small enough for brute-force enumeration.
pub fn random_space(seed: u64, num_states: usize, num_positions: usize) -> MultiStateSpace {
    let mut rng = StdRng::seed_from_u64(seed);
    let num_seq = (num_positions + 1) / 2;
    let seq_space = SeqSpace::new(
        (0..num_seq)
            .map(|i| SeqPosition {
                name: format!("S{i}"),
                labels: names("T", rng.gen_range(1..=2)),
            })
            .collect(),
    );

    let states = (0..num_states)
        .map(|s| {
            let positions: Vec<Position> = (0..num_positions)
                .map(|pos| {
                    let seq_pos = (pos < num_seq).then_some(pos);
                    let num_rcs = rng.gen_range(1..=3);
                    let rcs = (0..num_rcs)
                        .map(|rc| Rc {
                            name: format!("rc{rc}"),
                            label: match seq_pos {
                                Some(sp) => (rc % seq_space.positions[sp].labels.len()) as u16,
                                None => 0,
                            },
                        })
                        .collect();
                    Position {
                        name: format!("P{pos}"),
                        seq_pos,
                        rcs,
                    }
                })
                .collect();
            let conf_space = ConfSpace::new(positions, num_seq);
            let counts = conf_space.rc_counts();
            let mut emat = EnergyMatrix::zeroed(&counts);
            emat.set_constant(rng.gen_range(-1.0..1.0));
            for pos1 in 0..num_positions {
                for rc1 in 0..counts[pos1] {
                    emat.set_one(pos1, rc1, rng.gen_range(-2.0..2.0));
                    for pos2 in 0..pos1 {
                        for rc2 in 0..counts[pos2] {
                            emat.set_pair(pos1, rc1, pos2, rc2, rng.gen_range(-1.0..1.0));
                        }
                    }
                }
            }
            StateSpace {
                id: StateId(s as u8),
                name: format!("state{s}"),
                conf_space,
                emat,
            }
        })
        .collect();

    MultiStateSpace { seq_space, states }
}
