use super::{criterion, load_space, report_bounds, target_sequences};
use crate::cli::ClusterArgs;
use crate::config::PartialRunConfig;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use tracing::{info, warn};
use zbound::engine::evaluator::PairwiseEvaluator;
use zbound::engine::progress::ProgressReporter;
use zbound::engine::report::BoundsRow;
use zbound::workflows::cluster;
use zbound::workflows::estimate::RefineEnd;

pub fn run(args: ClusterArgs) -> Result<Vec<BoundsRow>> {
    if args.members == 0 {
        return Err(CliError::Argument(
            "a cluster needs at least one member".to_string(),
        ));
    }
    let space = load_space(&args.run.space)?;
    let config = PartialRunConfig::load(args.run.config.as_deref())?.merge_with_cli(&args.run)?;

    let targets = target_sequences(&space, &args.run)?;
    let criterion = criterion(&targets, &args.run)?;
    let evaluator = PairwiseEvaluator::new(space.clone());

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Starting a cluster run with {} members...", args.members);
    let report = cluster::run(
        space.clone(),
        &config,
        args.members,
        &evaluator,
        &criterion,
        &reporter,
    )?;
    info!(checks = report.checks, ended = ?report.ended, "Cluster run finished.");

    match report.ended {
        RefineEnd::Criterion => println!("Every target sequence is resolved."),
        RefineEnd::Exhausted => println!("The search space is exhausted."),
        RefineEnd::Stalled => println!("Warning: refinement stalled before every target was resolved."),
        RefineEnd::Stopped => println!("Refinement was stopped."),
    }
    let tolerance = config.soundness.tolerance;
    for c in report.conservation.iter().filter(|c| !c.holds(tolerance)) {
        warn!(state = %c.state, residual = %c.residual, "Bound mass is not conserved.");
    }

    report_bounds(
        &space,
        &config,
        &report.ledger,
        &targets,
        &report.totals,
        &args.run,
    )
}
