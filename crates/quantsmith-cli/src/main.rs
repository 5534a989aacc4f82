//! Quantsmith CLI - batch front end for the conversion pipeline.
//!
//! Reads a JSON pipeline config, runs every source file through it and writes
//! a JSON batch report. Ctrl-C cancels the running stage and stops the batch.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quantsmith::{
    quant_options, CancellationToken, ExternalToolchain, HfHubClient, ModelStage, OutputLayout,
    Pipeline, PipelineConfig, ProgressTracker, RetentionTiming, StageRunner, TargetConfig,
    UploadCoordinator,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "quantsmith")]
#[command(about = "Convert, quantize and publish model weight files")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a batch of source files through the pipeline
    Run(RunArgs),
    /// List known quantization targets
    Targets {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a starter config file
    InitConfig {
        /// Where to write the config
        #[arg(default_value = "quantsmith.json")]
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Pipeline config (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source weight files (.safetensors or .gguf)
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Override the output directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Put each model's files in its own subdirectory
    #[arg(long)]
    per_model: bool,

    /// Targets to generate, replacing the configured list (e.g. Q4_K_M,FP8_E4M3)
    #[arg(short, long, value_delimiter = ',')]
    targets: Vec<String>,

    /// Defer uploads and cleanup until every model has been processed
    #[arg(long)]
    batch_end_retention: bool,

    /// Write the batch report here
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let result = match args.command {
        Command::Run(run) => run_batch(run).await,
        Command::Targets { json } => list_targets(json),
        Command::InitConfig { path } => init_config(path),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if args.per_model {
        config.layout = OutputLayout::PerModel;
    }
    if args.batch_end_retention {
        config.retention = RetentionTiming::BatchEnd;
    }
    if !args.targets.is_empty() {
        config.targets = args
            .targets
            .iter()
            .map(|name| {
                let existing = config.targets.iter().find(|t| t.name.eq_ignore_ascii_case(name));
                existing.cloned().unwrap_or_else(|| TargetConfig::new(name.trim()))
            })
            .collect();
    }
    Ok(config)
}

async fn run_batch(args: RunArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    config.validate().context("invalid pipeline config")?;

    let cancel = CancellationToken::new();
    let progress = Arc::new(ProgressTracker::new());
    let runner = StageRunner::new(cancel.clone(), progress.clone());
    let toolchain = ExternalToolchain::new(config.toolchain.clone(), runner.clone());

    let uploader = match config.upload.clone().filter(|r| !r.is_empty()) {
        Some(routing) => {
            let client = HfHubClient::new(runner.clone())?;
            Some(UploadCoordinator::new(Arc::new(client), routing))
        }
        None => None,
    };

    let mut pipeline = Pipeline::new(config, Arc::new(toolchain), cancel.clone())?
        .with_progress(progress);
    if let Some(uploader) = uploader {
        pipeline = pipeline.with_uploader(uploader);
    }

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            signal_token.cancel();
        }
    });

    info!("Running {} source file(s)", args.sources.len());
    let report = pipeline.run_batch(&args.sources).await;

    for model in &report.models {
        let done = model.targets.iter().filter(|t| t.outcome.is_completed()).count();
        info!(
            "{}: {:?} ({}/{} targets)",
            model.base_name,
            model.state,
            done,
            model.targets.len()
        );
    }

    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("writing report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    if report.models.iter().any(|m| m.state == ModelStage::Cancelled) {
        bail!("batch cancelled");
    }
    Ok(if report.all_done() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn list_targets(json: bool) -> Result<ExitCode> {
    let options = quant_options();
    if json {
        println!("{}", serde_json::to_string_pretty(&options)?);
    } else {
        for option in options {
            let marker = if option.recommended { "*" } else { " " };
            println!(
                "{} {:<10} {:>5.2} bpw  {:<15} {}",
                marker, option.name, option.bits_per_weight, option.family, option.description
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn init_config(path: PathBuf) -> Result<ExitCode> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    PipelineConfig::default()
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote starter config to {}", path.display());
    Ok(ExitCode::SUCCESS)
}
