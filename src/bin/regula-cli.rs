//! Operator CLI: offline inspection and validation tooling
//!
//! Validates custom workflow files before submission, prints the routing
//! topology, and shows the effective configuration presets.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use regula::config::KernelConfig;
use regula::engine::CustomWorkflowSpec;
use regula::messaging::{MessageBus, QueueRouter};

#[derive(Debug, Parser)]
#[command(name = "regula-cli", about = "Regula operator tooling")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a custom workflow JSON file without submitting it
    Validate {
        /// Path to a JSON file with a custom workflow spec
        file: PathBuf,
    },
    /// Print the queue topology and per-queue configuration
    Routes,
    /// Print a configuration preset
    Config {
        /// Preset name: development, production, or testing
        #[arg(default_value = "production")]
        preset: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Validate { file } => validate(&file),
        Command::Routes => routes().await,
        Command::Config { preset } => preset_summary(&preset),
    }
}

fn validate(file: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let spec: CustomWorkflowSpec =
        serde_json::from_str(&raw).context("parsing workflow spec")?;
    let step_count = spec.steps.len();

    match spec.into_workflow() {
        Ok(workflow) => {
            println!(
                "ok: {} steps, workflow would be created as {}",
                step_count, workflow.workflow_id
            );
            Ok(())
        }
        Err(reason) => {
            println!("invalid: {reason}");
            std::process::exit(1);
        }
    }
}

async fn routes() -> Result<()> {
    let bus = Arc::new(MessageBus::new());
    let router = QueueRouter::new(bus);
    for info in router.all_queue_status().await {
        println!(
            "{:<20} priority={:<8} capacity={}",
            info.name,
            format!("{:?}", info.priority).to_lowercase(),
            info.capacity,
        );
    }
    Ok(())
}

fn preset_summary(preset: &str) -> Result<()> {
    let config = match preset {
        "development" => KernelConfig::development(),
        "testing" => KernelConfig::testing(),
        "production" => KernelConfig::production(),
        other => anyhow::bail!("unknown preset: {other}"),
    };
    println!("preset: {preset}");
    println!("listen: {}", config.server.listen);
    println!("cache dir: {}", config.cache.file_dir.display());
    println!(
        "cache local budget: {} bytes",
        config.cache.local_budget.as_usize()
    );
    println!(
        "max concurrent workflows: {}",
        config.engine.max_concurrent_workflows.as_usize()
    );
    println!(
        "dispatch interval: {:?}",
        config.engine.dispatch_interval
    );
    println!("step timeout: {:?}", config.engine.step_timeout);
    Ok(())
}
