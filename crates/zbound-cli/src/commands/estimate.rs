use super::{criterion, load_space, report_bounds, target_sequences};
use crate::cli::EstimateArgs;
use crate::config::PartialRunConfig;
use crate::error::{CliError, Result};
use crate::utils::parser;
use crate::utils::progress::CliProgressHandler;
use tracing::{info, warn};
use zbound::engine::evaluator::PairwiseEvaluator;
use zbound::engine::progress::ProgressReporter;
use zbound::engine::report::BoundsRow;
use zbound::workflows::estimate::{EstimatorBuilder, RefineEnd, Start};

pub fn run(args: EstimateArgs) -> Result<Vec<BoundsRow>> {
    let space = load_space(&args.run.space)?;

    let partial_config = PartialRunConfig::load(args.run.config.as_deref())?;
    info!("Merging configuration from file and CLI arguments...");
    let config = partial_config.merge_with_cli(&args.run)?;

    let targets = target_sequences(&space, &args.run)?;
    let criterion = criterion(&targets, &args.run)?;
    let evaluator = PairwiseEvaluator::new(space.clone());

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    let mut builder =
        EstimatorBuilder::new(space.clone(), config.clone(), &evaluator).reporter(reporter);
    if let Some(text) = &args.restrict_to {
        let seq = parser::parse_sequence(&space.seq_space, text)
            .map_err(|e| CliError::Argument(e.to_string()))?;
        info!(sequence = %space.seq_space.format(&seq), "Restricting the search to one sequence.");
        builder = builder.restrict_to(seq);
    }

    let (mut estimator, start) = builder.open(args.overwrite)?;
    match start {
        Start::Fresh => println!("Starting a new estimation ({} mode)...", config.mode.name()),
        Start::Resumed => println!("Resuming the estimation from its persisted files..."),
    }

    let report = estimator.refine(&criterion)?;
    info!(phases = report.phases, ended = ?report.ended, "Refinement finished.");
    match report.ended {
        RefineEnd::Criterion => println!("Every target sequence is resolved."),
        RefineEnd::Exhausted => println!("The search space is exhausted."),
        RefineEnd::Stalled => {
            warn!("Refinement stalled with nodes left in the frontier.");
            println!("Warning: refinement stalled before every target was resolved.");
        }
        RefineEnd::Stopped => println!("Refinement was stopped."),
    }

    let violations = estimator.violations();
    if violations > 0 {
        warn!(violations, "Soundness violations were recorded during the run.");
        println!("Warning: {} soundness violation(s) were recorded.", violations);
    }

    report_bounds(
        &space,
        &config,
        &estimator.ledger(),
        &targets,
        &report.totals,
        &args.run,
    )
}
