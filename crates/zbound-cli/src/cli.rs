use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "zbound developers",
    version,
    about = "zbound CLI - Bounds per-sequence partition functions of multi-state conformation spaces by bounded-memory branch and bound.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Refine bounds in this process, with a resumable frontier and ledger.
    Estimate(EstimateArgs),
    /// Refine bounds with several cluster members sharing one ledger.
    Cluster(ClusterArgs),
}

/// Arguments shared by every run.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the conformation space file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub space: PathBuf,

    /// Path to the run configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the frontier discipline from the config file.
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Override the in-memory frontier size in bytes.
    #[arg(long, value_name = "BYTES")]
    pub frontier_memory: Option<u64>,

    /// Stop once these sequences are resolved in every state.
    /// Residue types are separated by spaces or commas; '*' leaves a position open.
    /// Can be used multiple times. Defaults to every sequence of the space.
    #[arg(long = "sequence", value_name = "TYPES")]
    pub sequences: Vec<String>,

    /// Relative bound width at which a sequence counts as resolved.
    #[arg(short, long, value_name = "FLOAT", default_value_t = 0.1)]
    pub tolerance: f64,

    /// Write the final bounds of every reported sequence to a CSV file.
    #[arg(long, value_name = "PATH")]
    pub csv: Option<PathBuf>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S frontier.memory-bytes=1048576
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Sweep,
    Priority,
}

/// Arguments for the `estimate` subcommand.
#[derive(Args, Debug)]
pub struct EstimateArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Start over even if persisted frontier or ledger files exist.
    #[arg(long)]
    pub overwrite: bool,

    /// Only explore conformations of this sequence (same format as --sequence).
    #[arg(long, value_name = "TYPES")]
    pub restrict_to: Option<String>,
}

/// Arguments for the `cluster` subcommand.
#[derive(Args, Debug)]
pub struct ClusterArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Number of cluster members.
    #[arg(short = 'n', long, value_name = "INT", default_value_t = 2)]
    pub members: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_arguments_parse_with_globals() {
        let cli = Cli::parse_from([
            "zbound",
            "-vv",
            "estimate",
            "--space",
            "space.toml",
            "--sequence",
            "ALA GLY",
            "--sequence",
            "GLY,*",
            "--overwrite",
            "-S",
            "frontier.mode=sweep",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Estimate(args) = cli.command else {
            panic!("Expected 'estimate' subcommand");
        };
        assert_eq!(args.run.space, PathBuf::from("space.toml"));
        assert_eq!(args.run.sequences, vec!["ALA GLY", "GLY,*"]);
        assert_eq!(args.run.tolerance, 0.1);
        assert!(args.overwrite);
        assert_eq!(args.run.set_values, vec!["frontier.mode=sweep"]);
    }

    #[test]
    fn cluster_members_default_to_two() {
        let cli = Cli::parse_from(["zbound", "cluster", "-s", "space.toml", "-m", "priority"]);
        let Commands::Cluster(args) = cli.command else {
            panic!("Expected 'cluster' subcommand");
        };
        assert_eq!(args.members, 2);
        assert_eq!(args.run.mode, Some(ModeArg::Priority));
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["zbound", "-q", "-v", "estimate", "-s", "x.toml"]);
        assert!(result.is_err());
    }
}
