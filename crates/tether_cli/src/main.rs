//! `tether <problem> <planner> <timelimit> <-a|-p> [-v]`
//!
//! Plans on a built-in constrained problem, prints the summary, and writes
//! `anim.txt` and `report.json` (plus PLY dumps for 3D problems with `-v`).

mod artifacts;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgGroup, CommandFactory, FromArgMatches, Parser};
use tracing::{error, info};

use tether_core::planner::PLANNERS;
use tether_core::problems::{parse_problem, PROBLEMS};
use tether_core::{Experiment, ExperimentError, ExperimentStage, SpaceVariant};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Constrained motion planning experiments on implicit manifolds"
)]
#[command(group(ArgGroup::new("variant").required(true).args(["atlas", "projected"])))]
struct Cli {
    /// Built-in problem to solve
    problem: String,

    /// Planner to run
    planner: String,

    /// Planning time limit in seconds
    #[arg(allow_negative_numbers = true)]
    timelimit: f64,

    /// Plan on an atlas of charts
    #[arg(short = 'a')]
    atlas: bool,

    /// Plan by projecting onto the manifold
    #[arg(short = 'p')]
    projected: bool,

    /// Dump path, atlas and planner graph as PLY (3D problems only)
    #[arg(short = 'v')]
    verbose: bool,

    /// Artificial delay added to every validity check, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Directory receiving the output files
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

fn catalogue() -> String {
    format!(
        "Problems: {}\nPlanners: {}",
        PROBLEMS.join(", "),
        PLANNERS.join(", ")
    )
}

fn command() -> clap::Command {
    Cli::command().after_help(catalogue())
}

/// Prints the message with usage and the catalogue, then exits with status 2.
fn usage_error(message: String) -> ! {
    command()
        .error(ErrorKind::InvalidValue, format!("{message}\n\n{}", catalogue()))
        .exit()
}

fn main() -> Result<()> {
    if let Err(err) = logging::init_tracing() {
        eprintln!("warning: {err}");
    }
    let matches = command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());

    let problem = match parse_problem(&cli.problem) {
        Some(problem) => problem.with_artificial_delay(Duration::from_millis(cli.delay_ms)),
        None => usage_error(format!("unknown problem '{}'", cli.problem)),
    };
    let three_d = problem.ambient_dimension() == 3;
    let variant = if cli.atlas {
        SpaceVariant::Atlas
    } else {
        SpaceVariant::Projected
    };

    let mut experiment = Experiment::new(problem);
    match experiment.configure(variant, &cli.planner) {
        Ok(()) => {}
        Err(ExperimentError::UnknownPlanner(name)) => {
            usage_error(format!("unknown planner '{name}'"))
        }
        Err(err) => return Err(err).context("failed to configure the experiment"),
    }

    match experiment.plan(cli.timelimit) {
        Ok(status) => info!(?status, "planner finished"),
        Err(ExperimentError::InvalidTimeLimit(limit)) => {
            usage_error(format!("time limit must be a positive number of seconds, got {limit}"))
        }
        // Reconstruction failures still leave a reportable experiment.
        Err(err) if experiment.stage() == ExperimentStage::Failed => {
            error!(%err, "could not reconstruct the solution path");
        }
        Err(err) => return Err(err).context("planning failed"),
    }

    let report = experiment.report()?;
    report.write_summary(&mut std::io::stdout().lock())?;

    let out = artifacts::OutputDir::create(&cli.out_dir)?;
    if report.succeeded() {
        out.write("anim.txt", |w| report.write_dense_path(w))?;
    }
    out.write_json("report.json", &report)?;

    if cli.verbose && three_d {
        artifacts::write_ply_dumps(&out, &experiment)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let matches = command().try_get_matches_from(args)?;
        Cli::from_arg_matches(&matches)
    }

    #[test]
    fn parses_positional_arguments_and_variant() {
        let cli = parse(&["tether", "sphere", "RRT", "5", "-a", "-v"]).unwrap();
        assert_eq!(cli.problem, "sphere");
        assert_eq!(cli.planner, "RRT");
        assert_eq!(cli.timelimit, 5.0);
        assert!(cli.atlas && !cli.projected && cli.verbose);
    }

    #[test]
    fn variant_flag_is_required_and_exclusive() {
        assert!(parse(&["tether", "circle", "RRT", "5"]).is_err());
        assert!(parse(&["tether", "circle", "RRT", "5", "-a", "-p"]).is_err());
    }

    #[test]
    fn negative_time_limit_reaches_the_driver() {
        let cli = parse(&["tether", "circle", "RRT", "-1", "-p"]).unwrap();
        assert_eq!(cli.timelimit, -1.0);
    }

    #[test]
    fn help_lists_problems_and_planners() {
        let help = command().render_long_help().to_string();
        assert!(help.contains("Problems: circle, sphere, torus, paraboloid"));
        assert!(help.contains("Planners: RRT, RRTConnect"));
    }
}
