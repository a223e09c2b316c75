use crate::cli::{ModeArg, RunArgs};
use crate::error::{CliError, Result};
use crate::utils::parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use zbound::engine::config::{EstimatorConfig, EstimatorConfigBuilder, FrontierMode};

const DEFAULT_FRONTIER_MEMORY: u64 = 256 * 1024 * 1024;
const DEFAULT_SWEEP_INCREMENT: f64 = 1.0;
const DEFAULT_SCORE_STALENESS: f64 = 1.0;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialFrontierConfig {
    mode: Option<String>,
    increment: Option<f64>,
    score_staleness: Option<f64>,
    memory_bytes: Option<u64>,
    file: Option<PathBuf>,
    file_bytes: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialLedgerConfig {
    file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialPruningConfig {
    negligible_free_energy: Option<f64>,
    max_num_minimizations: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialPhaseConfig {
    max_nodes: Option<usize>,
    max_seconds: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialConcurrencyConfig {
    max_in_flight: Option<usize>,
    batch_size: Option<usize>,
    poll_millis: Option<u64>,
    barrier_timeout_seconds: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialSoundnessConfig {
    tolerance: Option<f64>,
    fatal_violations: Option<bool>,
}

/// A run configuration file where every value is optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PartialRunConfig {
    temperature: Option<f64>,
    frontier: Option<PartialFrontierConfig>,
    ledger: Option<PartialLedgerConfig>,
    pruning: Option<PartialPruningConfig>,
    phase: Option<PartialPhaseConfig>,
    concurrency: Option<PartialConcurrencyConfig>,
    soundness: Option<PartialSoundnessConfig>,
}

impl PartialRunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// Loads the file named by `--config`, or starts from an empty configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn merge_with_cli(mut self, args: &RunArgs) -> Result<EstimatorConfig> {
        self.apply_set_values(&args.set_values)?;

        let frontier = self.frontier.take().unwrap_or_default();
        let ledger = self.ledger.take().unwrap_or_default();
        let pruning = self.pruning.take().unwrap_or_default();
        let phase = self.phase.take().unwrap_or_default();
        let concurrency = self.concurrency.take().unwrap_or_default();
        let soundness = self.soundness.take().unwrap_or_default();

        let mode = Self::merge_mode(args.mode, &frontier)?;
        let mut builder = EstimatorConfigBuilder::new().mode(mode).frontier_mem_bytes(
            args.frontier_memory
                .or(frontier.memory_bytes)
                .unwrap_or(DEFAULT_FRONTIER_MEMORY),
        );

        if let Some(temperature) = self.temperature {
            builder = builder.temperature(temperature);
        }
        match (frontier.file, frontier.file_bytes) {
            (Some(path), Some(bytes)) => builder = builder.frontier_file(path, bytes),
            (Some(_), None) => {
                return Err(CliError::Config(
                    "`frontier.file-bytes` is required when `frontier.file` is set.".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(CliError::Config(
                    "`frontier.file-bytes` is set but `frontier.file` is not.".to_string(),
                ));
            }
            (None, None) => {}
        }
        if let Some(path) = ledger.file {
            builder = builder.ledger_file(path);
        }
        if let Some(g) = pruning.negligible_free_energy {
            builder = builder.negligible_free_energy(g);
        }
        if let Some(n) = pruning.max_num_minimizations {
            builder = builder.max_num_minimizations(n);
        }
        if let Some(n) = phase.max_nodes {
            builder = builder.phase_max_nodes(n);
        }
        if let Some(seconds) = phase.max_seconds {
            builder = builder.phase_max_duration(Self::seconds("phase.max-seconds", seconds)?);
        }
        if let Some(n) = concurrency.max_in_flight {
            builder = builder.max_in_flight(n);
        }
        if let Some(n) = concurrency.batch_size {
            builder = builder.minimization_batch_size(n);
        }
        if let Some(ms) = concurrency.poll_millis {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(seconds) = concurrency.barrier_timeout_seconds {
            builder = builder.barrier_timeout(Self::seconds(
                "concurrency.barrier-timeout-seconds",
                seconds,
            )?);
        }
        if let Some(tolerance) = soundness.tolerance {
            builder = builder.bound_tolerance(tolerance);
        }
        if let Some(fatal) = soundness.fatal_violations {
            builder = builder.fatal_violations(fatal);
        }

        builder.build().map_err(|e| CliError::Config(e.to_string()))
    }

    fn merge_mode(cli: Option<ModeArg>, file: &PartialFrontierConfig) -> Result<FrontierMode> {
        let name = match cli {
            Some(ModeArg::Sweep) => "sweep",
            Some(ModeArg::Priority) => "priority",
            None => file.mode.as_deref().unwrap_or("priority"),
        };
        match name {
            "sweep" => Ok(FrontierMode::Sweep {
                increment: file.increment.unwrap_or(DEFAULT_SWEEP_INCREMENT),
            }),
            "priority" => Ok(FrontierMode::Priority {
                score_staleness: file.score_staleness.unwrap_or(DEFAULT_SCORE_STALENESS),
            }),
            other => Err(CliError::Config(format!(
                "Unknown frontier mode '{}'. Expected 'sweep' or 'priority'.",
                other
            ))),
        }
    }

    fn seconds(key: &str, value: f64) -> Result<Duration> {
        Duration::try_from_secs_f64(value)
            .map_err(|_| CliError::Config(format!("Invalid duration for {}: {}", key, value)))
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let (key, value) =
                parser::parse_key_value(kv_pair).map_err(|e| CliError::Config(e.to_string()))?;

            match key {
                "temperature" => self.temperature = Some(parse(key, value)?),
                "frontier.mode" => self.frontier().mode = Some(value.to_string()),
                "frontier.increment" => self.frontier().increment = Some(parse(key, value)?),
                "frontier.score-staleness" => {
                    self.frontier().score_staleness = Some(parse(key, value)?)
                }
                "frontier.memory-bytes" => self.frontier().memory_bytes = Some(parse(key, value)?),
                "frontier.file" => self.frontier().file = Some(PathBuf::from(value)),
                "frontier.file-bytes" => self.frontier().file_bytes = Some(parse(key, value)?),
                "ledger.file" => {
                    self.ledger.get_or_insert_with(Default::default).file =
                        Some(PathBuf::from(value))
                }
                "pruning.negligible-free-energy" => {
                    self.pruning
                        .get_or_insert_with(Default::default)
                        .negligible_free_energy = Some(parse(key, value)?)
                }
                "pruning.max-num-minimizations" => {
                    self.pruning
                        .get_or_insert_with(Default::default)
                        .max_num_minimizations = Some(parse(key, value)?)
                }
                "phase.max-nodes" => {
                    self.phase.get_or_insert_with(Default::default).max_nodes =
                        Some(parse(key, value)?)
                }
                "phase.max-seconds" => {
                    self.phase.get_or_insert_with(Default::default).max_seconds =
                        Some(parse(key, value)?)
                }
                "concurrency.max-in-flight" => {
                    self.concurrency().max_in_flight = Some(parse(key, value)?)
                }
                "concurrency.batch-size" => self.concurrency().batch_size = Some(parse(key, value)?),
                "concurrency.poll-millis" => {
                    self.concurrency().poll_millis = Some(parse(key, value)?)
                }
                "concurrency.barrier-timeout-seconds" => {
                    self.concurrency().barrier_timeout_seconds = Some(parse(key, value)?)
                }
                "soundness.tolerance" => {
                    self.soundness.get_or_insert_with(Default::default).tolerance =
                        Some(parse(key, value)?)
                }
                "soundness.fatal-violations" => {
                    self.soundness
                        .get_or_insert_with(Default::default)
                        .fatal_violations = Some(parse(key, value)?)
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn frontier(&mut self) -> &mut PartialFrontierConfig {
        self.frontier.get_or_insert_with(Default::default)
    }

    fn concurrency(&mut self) -> &mut PartialConcurrencyConfig {
        self.concurrency.get_or_insert_with(Default::default)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CliError::Config(format!("Invalid value for {}: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use std::fs;
    use tempfile::tempdir;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut args = vec!["zbound", "estimate", "--space", "space.toml"];
        args.extend_from_slice(extra);
        match Cli::parse_from(args).command {
            Commands::Estimate(args) => args.run,
            Commands::Cluster(_) => panic!("Expected 'estimate' subcommand"),
        }
    }

    #[test]
    fn file_values_are_merged_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
            temperature = 310.0

            [frontier]
            mode = "sweep"
            increment = 0.5
            memory-bytes = 4096

            [pruning]
            negligible-free-energy = -2.0

            [soundness]
            fatal-violations = true
            "#,
        )
        .unwrap();

        let config = PartialRunConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&run_args(&[]))
            .unwrap();
        assert_eq!(config.temperature, 310.0);
        assert_eq!(config.mode, FrontierMode::Sweep { increment: 0.5 });
        assert_eq!(config.storage.frontier_mem_bytes, 4096);
        assert_eq!(config.storage.frontier_file, None);
        assert_eq!(config.prune.negligible_free_energy, -2.0);
        assert!(config.soundness.fatal_violations);
        assert_eq!(config.concurrency.max_in_flight, 64);
    }

    #[test]
    fn cli_arguments_and_set_values_override_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            "[frontier]\nmode = \"sweep\"\nmemory-bytes = 4096\nscore-staleness = 2.5\n",
        )
        .unwrap();

        let args = run_args(&[
            "--mode",
            "priority",
            "--frontier-memory",
            "8192",
            "-S",
            "concurrency.max-in-flight=3",
            "-S",
            "phase.max-seconds=0.5",
            "-S",
            "ledger.file=run.ledger",
        ]);
        let config = PartialRunConfig::from_file(&path)
            .unwrap()
            .merge_with_cli(&args)
            .unwrap();
        assert_eq!(
            config.mode,
            FrontierMode::Priority {
                score_staleness: 2.5
            }
        );
        assert_eq!(config.storage.frontier_mem_bytes, 8192);
        assert_eq!(config.concurrency.max_in_flight, 3);
        assert_eq!(config.phase.max_duration, Duration::from_millis(500));
        assert_eq!(config.storage.ledger_file, Some(PathBuf::from("run.ledger")));
    }

    #[test]
    fn frontier_file_requires_its_size() {
        let args = run_args(&["-S", "frontier.file=frontier.bin"]);
        let result = PartialRunConfig::default().merge_with_cli(&args);
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let args = run_args(&["-S", "frontier.colour=blue"]);
        let result = PartialRunConfig::default().merge_with_cli(&args);
        assert!(matches!(result, Err(CliError::Config(msg)) if msg.contains("frontier.colour")));

        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, "[frontier]\ncolour = \"blue\"\n").unwrap();
        assert!(matches!(
            PartialRunConfig::from_file(&path),
            Err(CliError::FileParsing { .. })
        ));
    }

    #[test]
    fn invalid_values_are_reported_by_key() {
        let args = run_args(&["-S", "frontier.memory-bytes=lots"]);
        let result = PartialRunConfig::default().merge_with_cli(&args);
        assert!(
            matches!(result, Err(CliError::Config(msg)) if msg.contains("frontier.memory-bytes"))
        );

        let args = run_args(&["-S", "frontier.mode=depth-first"]);
        let result = PartialRunConfig::default().merge_with_cli(&args);
        assert!(matches!(result, Err(CliError::Config(msg)) if msg.contains("depth-first")));
    }
}
