//! HUNT ENGINE — command-line entry point.
//!
//! Loads configuration, initialises structured logging and runs one of
//! three commands against a hypothesis JSON file: `check` (validate and
//! price), `expand` (list variants in grid order) or `run` (dry-run the
//! full grid and print the result document).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::sync::Arc;
use tracing::info;

use hunt_engine::config::HuntConfig;
use hunt_engine::engine::executor::ExhaustiveExecutor;
use hunt_engine::engine::{DryRunEvaluator, Evaluator, StableRegime};
use hunt_engine::grid::GridExpander;
use hunt_engine::output::{FormatOptions, OutputFormatter};
use hunt_engine::types::{Hypothesis, Variant};

/// Budget-constrained exhaustive parameter-grid scheduler
#[derive(Parser)]
#[command(name = "hunt-engine")]
#[command(about = "Exhaustively evaluate human-approved parameter grids", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a hypothesis and print the budget decision
    Check {
        /// Hypothesis JSON file
        file: String,
    },

    /// Print the ordered variant list
    Expand {
        /// Hypothesis JSON file
        file: String,
    },

    /// Dry-run every variant and print the result document
    Run {
        /// Hypothesis JSON file
        file: String,

        /// Shuffle output rows with this seed instead of grid order
        #[arg(long)]
        shuffle_seed: Option<u64>,
    },
}

#[derive(Serialize)]
struct ExpandOutput<'a> {
    hypothesis_id: &'a str,
    total_variants: usize,
    variants: &'a [Variant],
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging();

    let cfg = if fs::metadata(&cli.config).is_ok() {
        HuntConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config, "No config file found, using defaults");
        HuntConfig::default()
    };

    match cli.command {
        Commands::Check { file } => {
            let hypothesis = load_hypothesis(&file, &cfg)?;
            let executor = ExhaustiveExecutor::new(&cfg);
            let decision = executor.enforcer().check_pre_execution(&hypothesis);
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Expand { file } => {
            let hypothesis = load_hypothesis(&file, &cfg)?;
            let expansion = GridExpander::expand(&hypothesis)?;
            let out = ExpandOutput {
                hypothesis_id: hypothesis.id(),
                total_variants: expansion.total,
                variants: &expansion.variants,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Run { file, shuffle_seed } => {
            let hypothesis = load_hypothesis(&file, &cfg)?;
            let evaluator: Arc<dyn Evaluator> =
                Arc::new(DryRunEvaluator::new(hypothesis.metrics()));
            let executor = ExhaustiveExecutor::new(&cfg);
            let record = executor
                .run(hypothesis, evaluator, Arc::new(StableRegime))
                .await?;
            let result = OutputFormatter::format(&record, &FormatOptions { shuffle_seed });
            info!(summary = %result, "Run complete");
            println!("{}", result.to_json_pretty()?);
        }
    }

    Ok(())
}

fn load_hypothesis(path: &str, cfg: &HuntConfig) -> Result<Hypothesis> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read hypothesis file: {path}"))?;
    let hypothesis = Hypothesis::from_json(&text, &cfg.grid_limits())
        .with_context(|| format!("Invalid hypothesis: {path}"))?;
    info!(
        hypothesis_id = %hypothesis.id(),
        approved = hypothesis.is_approved(),
        "Hypothesis loaded"
    );
    Ok(hypothesis)
}

/// Logs go to stderr so stdout stays a clean JSON document.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hunt_engine=info"));

    let json_logging = std::env::var("HUNT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
