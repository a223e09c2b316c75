use super::conf::Conf;

/// Pairwise-decomposed lower bounds on the energy of a conformation.
///
/// Pair energies are stored once per unordered position pair, indexed with the
/// larger position first; the accessors accept either order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnergyMatrix {
    constant: f64,
    one_body: Vec<Vec<f64>>,
    pairs: Vec<Vec<Vec<Vec<f64>>>>,
}

impl EnergyMatrix {
    /// An all-zero matrix for positions with the given numbers of choices.
    pub fn zeroed(rc_counts: &[usize]) -> Self {
        let one_body = rc_counts.iter().map(|&n| vec![0.0; n]).collect();
        let pairs = rc_counts
            .iter()
            .enumerate()
            .map(|(i, &ni)| {
                (0..ni)
                    .map(|_| rc_counts[..i].iter().map(|&nj| vec![0.0; nj]).collect())
                    .collect()
            })
            .collect();
        Self {
            constant: 0.0,
            one_body,
            pairs,
        }
    }

    #[inline]
    pub fn num_positions(&self) -> usize {
        self.one_body.len()
    }

    pub fn num_rcs(&self, pos: usize) -> usize {
        self.one_body.get(pos).map_or(0, Vec::len)
    }

    #[inline]
    pub fn constant(&self) -> f64 {
        self.constant
    }

    pub fn set_constant(&mut self, energy: f64) {
        self.constant = energy;
    }

    #[inline]
    pub fn one(&self, pos: usize, rc: usize) -> f64 {
        self.one_body[pos][rc]
    }

    pub fn set_one(&mut self, pos: usize, rc: usize, energy: f64) {
        self.one_body[pos][rc] = energy;
    }

    #[inline]
    pub fn pair(&self, pos1: usize, rc1: usize, pos2: usize, rc2: usize) -> f64 {
        if pos1 > pos2 {
            self.pairs[pos1][rc1][pos2][rc2]
        } else {
            self.pairs[pos2][rc2][pos1][rc1]
        }
    }

    pub fn set_pair(&mut self, pos1: usize, rc1: usize, pos2: usize, rc2: usize, energy: f64) {
        if pos1 > pos2 {
            self.pairs[pos1][rc1][pos2][rc2] = energy;
        } else {
            self.pairs[pos2][rc2][pos1][rc1] = energy;
        }
    }

    /// Total energy of a complete conformation, or `None` if any position is unassigned.
    pub fn conf_energy(&self, conf: &Conf) -> Option<f64> {
        let choices: Vec<usize> = (0..conf.len())
            .map(|pos| conf.get(pos))
            .collect::<Option<_>>()?;
        let mut energy = self.constant;
        for (pos1, &rc1) in choices.iter().enumerate() {
            energy += self.one(pos1, rc1);
            for (pos2, &rc2) in choices[..pos1].iter().enumerate() {
                energy += self.pair(pos1, rc1, pos2, rc2);
            }
        }
        Some(energy)
    }
}
