//! CLI entry point for the transcode orchestrator
//!
//! Parses command line arguments, loads the configuration and runs the
//! orchestrator until Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transcode_orchestrator::{Config, Orchestrator};

/// Transcode Orchestrator - resource-aware scheduling of transcoding jobs
#[derive(Parser, Debug)]
#[command(name = "transcode-orchestratord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (transcoder availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Profile name used for files given on the command line
    #[arg(short, long, default_value = "default")]
    profile: String,

    /// Extra transcoder arguments for files given on the command line
    #[arg(long = "profile-arg", allow_hyphen_values = true)]
    profile_args: Vec<String>,

    /// Queue priority for files given on the command line (higher runs first)
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    priority: i32,

    /// Source files to enqueue at startup
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "Transcode orchestrator starting");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Orchestrator::new_without_checks(config)
    } else {
        Orchestrator::new(config)
    };

    let orchestrator = match orchestrator_result {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "Failed to initialize orchestrator");
            return ExitCode::FAILURE;
        }
    };

    let status = orchestrator.pool_status();
    info!(
        limit = status.concurrency_limit,
        queued = status.queued,
        pause_supported = status.pause_supported,
        "Orchestrator initialized"
    );

    for input in &args.inputs {
        let item = orchestrator
            .queue_item(input, &args.profile)
            .with_profile_args(args.profile_args.clone());
        if let Err(e) = orchestrator.enqueue(item, args.priority) {
            error!(input = %input.display(), error = %e, "Failed to enqueue");
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = orchestrator.run().await {
        error!(error = %e, "Orchestrator error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
