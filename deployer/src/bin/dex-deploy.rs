//! `dex-deploy`: run migrations, fork simulations and legacy publish batches.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dex_deployer::{
    DeployConfig, Deployer, ExecutionReport, ForkSimulation, Handoff, Layer, MarketTable, Stage,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "dex-deploy", version, about = "Resumable two-layer DEX deployments")]
struct Cli {
    #[clap(long, global = true, help = "Deployer configuration (TOML)")]
    config: Option<PathBuf>,

    #[clap(long, global = true, help = "AMM market parameters (TOML)")]
    markets: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one migration file on a stage
    Migrate {
        #[clap(help = "production, staging or test")]
        stage: Stage,
        #[clap(help = "Migration file named NNNN-<layer>-<description>.toml")]
        file: PathBuf,
        #[clap(long, help = "Last batch of its layer: hand upgrade admin to governance")]
        final_layer: bool,
    },
    /// Rehearse a migration on a local fork, in the test stage
    Simulate {
        #[clap(help = "RPC URL of the network to fork")]
        fork_rpc_url: String,
        #[clap(help = "Migration file named NNNN-<layer>-<description>.toml")]
        file: PathBuf,
        #[clap(long, default_value = "staging", help = "Stage whose state seeds the test stage")]
        source_stage: Stage,
        #[clap(long, help = "Pin the fork to this block")]
        block: Option<u64>,
        #[clap(long, help = "Include the governance handoff")]
        final_layer: bool,
    },
    /// Run one batch of a layer from a publish plan
    DeployLayer {
        #[clap(help = "production, staging or test")]
        stage: Stage,
        #[clap(help = "layer1 or layer2")]
        layer: Layer,
        #[clap(help = "Batch index within the layer")]
        batch: u64,
        #[clap(long, default_value = "publish/plan.toml", help = "Publish plan")]
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dex_deployer=info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(report) => {
            info!(
                "{} batch {} on {}: {} task(s) run, {} skipped, version {}",
                report.layer,
                report.batch,
                report.stage,
                report.executed.len(),
                report.skipped,
                report.version
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExecutionReport> {
    let config = match &cli.config {
        Some(path) => DeployConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeployConfig::default(),
    };

    let mut deployer = Deployer::new(config)?;
    if let Some(path) = &cli.markets {
        let markets = MarketTable::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?;
        deployer = deployer.with_markets(markets);
    }

    let report = match cli.command {
        Command::Migrate {
            stage,
            file,
            final_layer,
        } => deployer
            .migrate(stage, &file, Handoff::from_flag(final_layer))
            .await
            .with_context(|| format!("migration {} on {}", file.display(), stage))?,
        Command::Simulate {
            fork_rpc_url,
            file,
            source_stage,
            block,
            final_layer,
        } => {
            let mut simulation = ForkSimulation::new(fork_rpc_url).from_stage(source_stage);
            if let Some(block) = block {
                simulation = simulation.at_block(block);
            }
            deployer
                .simulate(&simulation, &file, Handoff::from_flag(final_layer))
                .await
                .with_context(|| format!("simulating {}", file.display()))?
        }
        Command::DeployLayer {
            stage,
            layer,
            batch,
            plan,
        } => deployer
            .publish_layer(stage, &plan, layer, batch)
            .await
            .with_context(|| format!("{} batch {} on {}", layer, batch, stage))?,
    };

    Ok(report)
}
