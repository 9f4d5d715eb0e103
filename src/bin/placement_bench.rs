//! placement-bench - A/B storage-placement benchmark orchestrator
//!
//! Usage:
//!   placement-bench [-f bench.toml] check
//!   placement-bench [-f bench.toml] fetch --start 0 --end 100000
//!   placement-bench [-f bench.toml] transform --start 0 --end 100000
//!   placement-bench [-f bench.toml] run [baseline|treatment|both]
//!   placement-bench compare <baseline_dir> <treatment_dir>

use std::process::ExitCode;

use clap::Parser;
use placement_bench::common::cli::{Cli, Commands, RunTarget};
use placement_bench::common::setup_shutdown;
use placement_bench::config::{BenchConfig, TrialKind};
use placement_bench::extract::MetricsRecord;
use placement_bench::host::Host;
use placement_bench::pipeline::{fetch_range, transform_range, CommandStages};
use placement_bench::report;
use placement_bench::trial::{check_environment, run_comparison, run_trial};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("placement_bench=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match execute(&cli).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "placement-bench failed");
            eprintln!("Error: {:#}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn execute(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Check => {
            check_environment(&cli.load_config()?)?;
            println!("Environment OK");
        }
        Commands::Fetch { start, end } => {
            let config = cli.load_config()?;
            let host = Host::system()?;
            let stages = CommandStages::new(host.runner.clone(), &config.dataset);
            let chunk = fetch_range(&stages, *start, *end, &config.dataset.staging_dir).await?;
            println!("{}", chunk.download_path.display());
        }
        Commands::Transform { start, end } => {
            let config = cli.load_config()?;
            let host = Host::system()?;
            let stages = CommandStages::new(host.runner.clone(), &config.dataset);
            let chunk = transform_range(&stages, *start, *end, &config.dataset.staging_dir).await?;
            println!("{}", chunk.artifact_path.display());
        }
        Commands::Run { target } => {
            let config = cli.load_config()?;
            let host = Host::system()?;
            run(&host, &config, *target).await?;
        }
        Commands::Compare {
            baseline,
            treatment,
        } => {
            let baseline = MetricsRecord::load(baseline)?;
            let treatment = MetricsRecord::load(treatment)?;
            print!("{}", report::render(&report::compare(&baseline, &treatment)));
        }
    }
    Ok(())
}

async fn run(host: &Host, config: &BenchConfig, target: RunTarget) -> anyhow::Result<()> {
    check_environment(config)?;
    let (_shutdown_tx, mut shutdown_rx) = setup_shutdown();

    match target {
        RunTarget::Both => {
            let comparison = run_comparison(host, config, &mut shutdown_rx).await?;
            print!("{}", report::render(&comparison));
        }
        RunTarget::Baseline | RunTarget::Treatment => {
            let kind = if target == RunTarget::Baseline {
                TrialKind::Baseline
            } else {
                TrialKind::Treatment
            };
            let record = run_trial(host, config, kind, shutdown_rx).await?;
            print!("{}", record.summary());
        }
    }
    Ok(())
}
