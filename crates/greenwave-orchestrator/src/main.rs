//! Greenwave CLI - traffic signal timing from four lane videos.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use greenwave_core::{BatchStage, OptimizerFailure, LANE_COUNT};
use greenwave_optimizer::OptimizerInvoker;
use greenwave_orchestrator::{Config, OrchestrationService};
use greenwave_worker::TimeoutPolicy;

/// Greenwave - detection, optimization and recommendation for one intersection
#[derive(Parser)]
#[command(name = "greenwave")]
#[command(about = "Compute green-light timings from lane videos", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Optimizer executable
    #[arg(long)]
    optimizer: Option<PathBuf>,

    /// Detector executable
    #[arg(long)]
    detector: Option<PathBuf>,

    /// Maximum concurrent detection workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Report a lane error instead of a zero count when detection times out
    #[arg(long)]
    fail_on_timeout: bool,

    /// Do not ask the optimizer for its progress log
    #[arg(long)]
    quiet_optimizer: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one batch of lane videos (north, south, west, east)
    Run {
        #[arg(required = true, num_args = 4, value_names = ["NORTH", "SOUTH", "WEST", "EAST"])]
        videos: Vec<PathBuf>,
    },

    /// Run only the optimizer on the given car counts
    Optimize {
        #[arg(required = true, num_args = 4, value_names = ["NORTH", "SOUTH", "WEST", "EAST"])]
        counts: Vec<String>,
    },

    /// Check that the configured executables are present
    Health,
}

const EXIT_DETECTION_FAILED: u8 = 2;
const EXIT_OPTIMIZATION_FAILED: u8 = 3;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the JSON response
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("greenwave=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { videos } => run_batch(&config, videos).await,
        Commands::Optimize { counts } => optimize(&config, counts).await,
        Commands::Health => health(&config),
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(path) = &cli.optimizer {
        config.optimizer_path = path.clone();
    }
    if let Some(path) = &cli.detector {
        config.detector_program = Some(path.clone());
    }
    if let Some(max_workers) = cli.max_workers {
        config.max_workers = max_workers;
    }
    if cli.fail_on_timeout {
        config.timeout_policy = TimeoutPolicy::Fail;
    }
    if cli.quiet_optimizer {
        config.verbose = false;
    }

    Ok(config)
}

async fn run_batch(
    config: &Config,
    videos: Vec<PathBuf>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let videos: [PathBuf; LANE_COUNT] = videos
        .try_into()
        .map_err(|v: Vec<PathBuf>| format!("expected {} videos, got {}", LANE_COUNT, v.len()))?;

    let service = OrchestrationService::from_config(config);
    let response = service.process_batch(videos).await;

    println!("{}", serde_json::to_string_pretty(&response)?);

    let code = match response.stage {
        BatchStage::Completed => ExitCode::SUCCESS,
        BatchStage::DetectionFailed => ExitCode::from(EXIT_DETECTION_FAILED),
        BatchStage::OptimizationFailed => ExitCode::from(EXIT_OPTIMIZATION_FAILED),
    };
    Ok(code)
}

async fn optimize(
    config: &Config,
    counts: Vec<String>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let values: Vec<Value> = counts.into_iter().map(Value::String).collect();
    let service = OrchestrationService::from_config(config);

    let (output, failed) = match service.optimize_counts(&values).await {
        Ok(result) => (result.to_json(), result.is_error()),
        Err(e) => (json!({ "error": OptimizerFailure::from(&e) }), true),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(if failed {
        ExitCode::from(EXIT_OPTIMIZATION_FAILED)
    } else {
        ExitCode::SUCCESS
    })
}

fn health(config: &Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let (healthy, report) = health_report(config);

    info!(healthy = healthy, "Health check");
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Optimizer and detector must both be present; the recommender is optional.
fn health_report(config: &Config) -> (bool, Value) {
    let optimizer_ok = OptimizerInvoker::new(&config.optimizer_path).is_available();
    let detector = match &config.detector_program {
        Some(p) => json!({
            "path": p.display().to_string(),
            "available": program_available(p),
        }),
        None => json!({
            "path": null,
            "available": false,
            "error": "no detector configured (set detector_program)",
        }),
    };
    let detector_ok = detector["available"].as_bool().unwrap_or(false);
    let recommender = config.recommender_program.as_ref().map(|p| {
        json!({
            "path": p.display().to_string(),
            "available": program_available(p),
        })
    });

    let healthy = optimizer_ok && detector_ok;
    let report = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "optimizer": {
            "path": config.optimizer_path.display().to_string(),
            "available": optimizer_ok,
        },
        "detector": detector,
        "recommender": recommender,
    });
    (healthy, report)
}

/// A bare program name is looked up on `PATH`; anything else must exist.
fn program_available(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
