use super::bigexp::BigExp;

/// Gas constant in kcal/(mol K).
pub const GAS_CONSTANT: f64 = 1.9891e-3;

/// Room temperature in kelvin.
pub const DEFAULT_TEMPERATURE: f64 = 298.15;

/// Converts between energies (kcal/mol) and Boltzmann weights at a fixed temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoltzmannCalculator {
    rt: f64,
}

impl BoltzmannCalculator {
    pub fn new(temperature: f64) -> Self {
        Self {
            rt: GAS_CONSTANT * temperature,
        }
    }

    #[inline]
    pub fn rt(&self) -> f64 {
        self.rt
    }

    /// Boltzmann weight `exp(-energy / RT)`.
    #[inline]
    pub fn calc(&self, energy: f64) -> BigExp {
        BigExp::from_ln(-energy / self.rt)
    }

    /// Free energy `-RT ln z`. A zero weight maps to positive infinity.
    #[inline]
    pub fn free_energy(&self, z: BigExp) -> f64 {
        -self.rt * z.ln()
    }
}

impl Default for BoltzmannCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPERATURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_energy_has_unit_weight() {
        let bcalc = BoltzmannCalculator::default();
        assert!(bcalc.calc(0.0).approx_eq(&BigExp::ONE, 1e-15));
    }

    #[test]
    fn free_energy_inverts_calc() {
        let bcalc = BoltzmannCalculator::new(300.0);
        for energy in [-250.0, -1.5, 0.0, 3.25, 900.0] {
            let g = bcalc.free_energy(bcalc.calc(energy));
            assert!((g - energy).abs() < 1e-9, "{g} != {energy}");
        }
    }

    #[test]
    fn lower_energy_means_larger_weight() {
        let bcalc = BoltzmannCalculator::default();
        assert!(bcalc.calc(-1.0) > bcalc.calc(1.0));
    }

    #[test]
    fn zero_weight_has_infinite_free_energy() {
        let bcalc = BoltzmannCalculator::default();
        assert_eq!(bcalc.free_energy(BigExp::ZERO), f64::INFINITY);
    }
}
