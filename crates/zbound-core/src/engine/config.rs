use crate::core::math::bigexp::BigExp;
use crate::core::math::boltzmann::{BoltzmannCalculator, DEFAULT_TEMPERATURE};
use crate::core::models::space::StateId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue {
        parameter: &'static str,
        reason: String,
    },

    #[error(
        "Frontier capacity of {capacity} nodes for {state} cannot hold one expansion of {required} children"
    )]
    CapacityTooSmall {
        state: StateId,
        capacity: usize,
        required: usize,
    },
}

/// How the frontier orders and admits nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrontierMode {
    /// Nodes are read in arrival order; a node whose free energy lies above the
    /// current sweep threshold waits for a later step. The threshold rises by
    /// `increment` (kcal/mol) per step.
    Sweep { increment: f64 },
    /// Nodes are read in order of predicted refinement value. A leaf whose stored
    /// score exceeds the current prediction by more than `score_staleness`
    /// (natural-log units) is re-scored before it is minimized.
    Priority { score_staleness: f64 },
}

impl FrontierMode {
    pub fn name(&self) -> &'static str {
        match self {
            FrontierMode::Sweep { .. } => "sweep",
            FrontierMode::Priority { .. } => "priority",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub frontier_mem_bytes: u64,
    pub frontier_file: Option<PathBuf>,
    pub frontier_file_bytes: u64,
    pub ledger_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PruneConfig {
    /// Free energy (kcal/mol) below which a whole sequence is considered negligible.
    pub negligible_free_energy: f64,
    /// Upper bound on the number of leaves that could share the negligible mass.
    pub max_num_minimizations: f64,
}

impl PruneConfig {
    /// Bound below which a subtree is dropped without refinement.
    pub fn z_prune(&self, bcalc: &BoltzmannCalculator) -> BigExp {
        bcalc.calc(self.negligible_free_energy) * (1.0 / self.max_num_minimizations)
    }

    /// Free energy at which the sweep threshold is lifted entirely.
    pub fn g_threshold_upper(&self, bcalc: &BoltzmannCalculator) -> f64 {
        bcalc.free_energy(self.z_prune(bcalc))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseConfig {
    /// Nodes read per phase before the stopping criterion is consulted again.
    pub max_nodes: Option<usize>,
    pub max_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    pub max_in_flight: usize,
    /// Leaves minimized together; defaults to the evaluator's batch size.
    pub minimization_batch_size: Option<usize>,
    pub poll_interval: Duration,
    pub barrier_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoundnessConfig {
    /// Relative slack allowed when checking that bounds only tighten.
    pub tolerance: f64,
    /// Whether a bound that widens beyond `tolerance` aborts the run.
    pub fatal_violations: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    pub temperature: f64,
    pub mode: FrontierMode,
    pub storage: StorageConfig,
    pub prune: PruneConfig,
    pub phase: PhaseConfig,
    pub concurrency: ConcurrencyConfig,
    pub soundness: SoundnessConfig,
}

impl EstimatorConfig {
    pub fn bcalc(&self) -> BoltzmannCalculator {
        BoltzmannCalculator::new(self.temperature)
    }
}

#[derive(Default)]
pub struct EstimatorConfigBuilder {
    temperature: Option<f64>,
    mode: Option<FrontierMode>,
    frontier_mem_bytes: Option<u64>,
    frontier_file: Option<(PathBuf, u64)>,
    ledger_file: Option<PathBuf>,
    negligible_free_energy: Option<f64>,
    max_num_minimizations: Option<f64>,
    phase_max_nodes: Option<usize>,
    phase_max_duration: Option<Duration>,
    max_in_flight: Option<usize>,
    minimization_batch_size: Option<usize>,
    poll_interval: Option<Duration>,
    barrier_timeout: Option<Duration>,
    bound_tolerance: Option<f64>,
    fatal_violations: Option<bool>,
}

impl EstimatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temperature(mut self, kelvin: f64) -> Self {
        self.temperature = Some(kelvin);
        self
    }
    pub fn mode(mut self, mode: FrontierMode) -> Self {
        self.mode = Some(mode);
        self
    }
    pub fn frontier_mem_bytes(mut self, bytes: u64) -> Self {
        self.frontier_mem_bytes = Some(bytes);
        self
    }
    pub fn frontier_file(mut self, path: PathBuf, bytes: u64) -> Self {
        self.frontier_file = Some((path, bytes));
        self
    }
    pub fn ledger_file(mut self, path: PathBuf) -> Self {
        self.ledger_file = Some(path);
        self
    }
    pub fn negligible_free_energy(mut self, g: f64) -> Self {
        self.negligible_free_energy = Some(g);
        self
    }
    pub fn max_num_minimizations(mut self, n: f64) -> Self {
        self.max_num_minimizations = Some(n);
        self
    }
    pub fn phase_max_nodes(mut self, n: usize) -> Self {
        self.phase_max_nodes = Some(n);
        self
    }
    pub fn phase_max_duration(mut self, duration: Duration) -> Self {
        self.phase_max_duration = Some(duration);
        self
    }
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = Some(n);
        self
    }
    pub fn minimization_batch_size(mut self, n: usize) -> Self {
        self.minimization_batch_size = Some(n);
        self
    }
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
    pub fn barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = Some(timeout);
        self
    }
    pub fn bound_tolerance(mut self, tolerance: f64) -> Self {
        self.bound_tolerance = Some(tolerance);
        self
    }
    pub fn fatal_violations(mut self, fatal: bool) -> Self {
        self.fatal_violations = Some(fatal);
        self
    }

    pub fn build(self) -> Result<EstimatorConfig, ConfigError> {
        let mode = self.mode.ok_or(ConfigError::MissingParameter("mode"))?;
        match mode {
            FrontierMode::Sweep { increment } if !(increment > 0.0) => {
                return Err(invalid("mode.increment", "must be positive"));
            }
            FrontierMode::Priority { score_staleness } if !(score_staleness >= 0.0) => {
                return Err(invalid("mode.score_staleness", "must not be negative"));
            }
            _ => {}
        }

        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !(temperature > 0.0) {
            return Err(invalid("temperature", "must be positive"));
        }

        let frontier_mem_bytes = self
            .frontier_mem_bytes
            .ok_or(ConfigError::MissingParameter("frontier_mem_bytes"))?;
        if frontier_mem_bytes == 0 {
            return Err(invalid("frontier_mem_bytes", "must be positive"));
        }
        let (frontier_file, frontier_file_bytes) = match self.frontier_file {
            Some((_, 0)) => return Err(invalid("frontier_file_bytes", "must be positive")),
            Some((path, bytes)) => (Some(path), bytes),
            None => (None, 0),
        };

        let max_num_minimizations = self.max_num_minimizations.unwrap_or(1e9);
        if !(max_num_minimizations >= 1.0) {
            return Err(invalid("max_num_minimizations", "must be at least 1"));
        }

        if self.phase_max_nodes == Some(0) {
            return Err(invalid("phase_max_nodes", "must be at least 1"));
        }
        let max_in_flight = self.max_in_flight.unwrap_or(64);
        if max_in_flight == 0 {
            return Err(invalid("max_in_flight", "must be at least 1"));
        }
        if self.minimization_batch_size == Some(0) {
            return Err(invalid("minimization_batch_size", "must be at least 1"));
        }
        let tolerance = self.bound_tolerance.unwrap_or(1e-6);
        if !(tolerance >= 0.0) {
            return Err(invalid("bound_tolerance", "must not be negative"));
        }

        Ok(EstimatorConfig {
            temperature,
            mode,
            storage: StorageConfig {
                frontier_mem_bytes,
                frontier_file,
                frontier_file_bytes,
                ledger_file: self.ledger_file,
            },
            prune: PruneConfig {
                negligible_free_energy: self.negligible_free_energy.unwrap_or(-1.0),
                max_num_minimizations,
            },
            phase: PhaseConfig {
                max_nodes: self.phase_max_nodes,
                max_duration: self.phase_max_duration.unwrap_or(Duration::from_secs(1)),
            },
            concurrency: ConcurrencyConfig {
                max_in_flight,
                minimization_batch_size: self.minimization_batch_size,
                poll_interval: self.poll_interval.unwrap_or(Duration::from_millis(100)),
                barrier_timeout: self.barrier_timeout.unwrap_or(Duration::from_secs(60)),
            },
            soundness: SoundnessConfig {
                tolerance,
                fatal_violations: self.fatal_violations.unwrap_or(cfg!(debug_assertions)),
            },
        })
    }
}

fn invalid(parameter: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        parameter,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> EstimatorConfigBuilder {
        EstimatorConfigBuilder::new()
            .mode(FrontierMode::Sweep { increment: 1.0 })
            .frontier_mem_bytes(1 << 20)
    }

    #[test]
    fn build_fills_defaults() {
        let config = minimal().build().unwrap();
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.prune.negligible_free_energy, -1.0);
        assert_eq!(config.prune.max_num_minimizations, 1e9);
        assert_eq!(config.phase.max_nodes, None);
        assert_eq!(config.concurrency.poll_interval, Duration::from_millis(100));
        assert_eq!(config.soundness.fatal_violations, cfg!(debug_assertions));
        assert!(config.storage.frontier_file.is_none());
    }

    #[test]
    fn build_fails_without_mode_or_memory() {
        let result = EstimatorConfigBuilder::new().frontier_mem_bytes(10).build();
        assert_eq!(result, Err(ConfigError::MissingParameter("mode")));

        let result = EstimatorConfigBuilder::new()
            .mode(FrontierMode::Priority {
                score_staleness: 2.3,
            })
            .build();
        assert_eq!(
            result,
            Err(ConfigError::MissingParameter("frontier_mem_bytes"))
        );
    }

    #[test]
    fn build_rejects_nonsensical_values() {
        assert!(matches!(
            minimal().mode(FrontierMode::Sweep { increment: 0.0 }).build(),
            Err(ConfigError::InvalidValue { parameter: "mode.increment", .. })
        ));
        assert!(matches!(
            minimal().phase_max_nodes(0).build(),
            Err(ConfigError::InvalidValue { parameter: "phase_max_nodes", .. })
        ));
        assert!(matches!(
            minimal().frontier_file(PathBuf::from("f"), 0).build(),
            Err(ConfigError::InvalidValue { parameter: "frontier_file_bytes", .. })
        ));
    }

    #[test]
    fn prune_threshold_divides_negligible_weight_by_minimization_budget() {
        let config = minimal()
            .negligible_free_energy(0.0)
            .max_num_minimizations(1000.0)
            .build()
            .unwrap();
        let bcalc = config.bcalc();
        let z_prune = config.prune.z_prune(&bcalc);
        assert!(z_prune.approx_eq(&BigExp::from_f64(1e-3), 1e-12));

        let g_upper = config.prune.g_threshold_upper(&bcalc);
        assert!((g_upper - bcalc.rt() * 1000f64.ln()).abs() < 1e-9);
    }
}
