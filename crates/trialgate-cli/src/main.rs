//! Trialgate CLI
//!
//! The `trialgate` command runs batches of generated candidates against a
//! task rubric and tunes task difficulty toward a target pass-rate band.
//!
//! ## Commands
//!
//! - `run`: run one batch and print its summary
//! - `tune`: adjust thresholds until the pass rate lands in the target band
//! - `history`: show recorded batches, or the trials of one run

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use uuid::Uuid;

use trialgate_core::generation::Provider;
use trialgate_core::reporting::{
    render_batch_summary_md, write_batch_report_json, write_tuner_outcome_json,
};
use trialgate_core::telemetry::init_tracing;
use trialgate_core::{
    BatchOrchestrator, BatchPlan, BatchReport, DatasetRef, DifficultyTuner, EngineConfig,
    InterpreterExecutor, PromptSpec, ResultsRecorder, TrialRunner, TunerOutcome,
};

#[derive(Parser)]
#[command(name = "trialgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Trial evaluation engine for generated code", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true, env = "TRIALGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one batch of trials
    Run {
        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Search for thresholds that put the pass rate in the target band
    Tune {
        #[command(flatten)]
        batch: BatchArgs,

        /// Maximum number of batches
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Lower bound of the target pass rate
        #[arg(long)]
        target_min: Option<f64>,

        /// Upper bound of the target pass rate
        #[arg(long)]
        target_max: Option<f64>,
    },

    /// Show recorded batches
    History {
        /// Log directory (default: from config)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Number of most recent batches to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Show the trials of one run instead
        #[arg(long)]
        run: Option<Uuid>,
    },
}

/// Overrides shared by `run` and `tune`.
#[derive(Args, Debug, Clone, Default)]
struct BatchArgs {
    /// Dataset path or http(s) URL
    #[arg(long)]
    dataset: Option<String>,

    /// Column the prompt names as the prediction target
    #[arg(long)]
    target_column: Option<String>,

    /// Trials per batch
    #[arg(short = 'n', long)]
    trials: Option<usize>,

    /// Run trials one at a time
    #[arg(long, conflicts_with = "concurrency")]
    sequential: bool,

    /// Maximum trials in flight
    #[arg(long, value_name = "K")]
    concurrency: Option<usize>,

    /// Replay saved candidates from this directory instead of calling a model
    #[arg(long)]
    candidates_dir: Option<PathBuf>,

    /// Directory for the run summary and trial logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Do not write the run summary and trial logs
    #[arg(long)]
    no_log: bool,

    /// Write the full JSON report here
    #[arg(long)]
    report: Option<PathBuf>,
}

impl BatchArgs {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(dataset) = &self.dataset {
            config.task.dataset = dataset.clone();
        }
        if let Some(column) = &self.target_column {
            config.task.target_column = Some(column.clone());
        }
        if let Some(trials) = self.trials {
            config.batch.trials = trials;
        }
        if self.sequential {
            config.batch.sequential = true;
        }
        if let Some(k) = self.concurrency {
            config.batch.sequential = false;
            config.batch.max_in_flight = k;
        }
        if let Some(dir) = &self.candidates_dir {
            config.generator.provider = Provider::Fixtures;
            config.generator.candidates_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.log_dir {
            config.logs.dir = dir.clone();
        }
        if self.no_log {
            config.logs.disabled = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { batch } => {
            batch.apply(&mut config);
            let report = cmd_run(config, batch.report.as_deref(), cancel_on_ctrl_c()).await?;
            print!("{}", render_batch_summary_md(&report));
            Ok(())
        }
        Commands::Tune {
            batch,
            max_attempts,
            target_min,
            target_max,
        } => {
            batch.apply(&mut config);
            if let Some(max) = max_attempts {
                config.tuner.max_attempts = max;
            }
            if let Some(min) = target_min {
                config.tuner.target_min = min;
            }
            if let Some(max) = target_max {
                config.tuner.target_max = max;
            }
            let outcome = cmd_tune(config, batch.report.as_deref(), cancel_on_ctrl_c()).await?;
            print_tuner_outcome(&outcome);
            Ok(())
        }
        Commands::History {
            log_dir,
            limit,
            run,
        } => {
            let dir = log_dir.unwrap_or(config.logs.dir);
            cmd_history(&dir, limit, run).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Flip the cancel flag on the first Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, waiting for in-flight trials");
            tx.send_replace(true);
        }
    });
    rx
}

/// Everything a batch needs, built from a validated configuration.
struct Engine {
    config: EngineConfig,
    prompt: PromptSpec,
    orchestrator: BatchOrchestrator,
}

async fn build_engine(mut config: EngineConfig) -> Result<Engine> {
    config.validate().context("Invalid configuration")?;

    let dataset = DatasetRef::parse(&config.task.dataset);
    let resolved = dataset
        .resolve(&config.dataset.data_dir)
        .await
        .with_context(|| format!("Failed to resolve dataset {}", dataset))?;
    config.task.dataset = resolved.display().to_string();

    let prompt = config
        .prompt
        .load()
        .context("Failed to load prompt template")?;
    let generator = config
        .generator
        .build()
        .context("Failed to build candidate generator")?;
    let executor =
        InterpreterExecutor::new(config.executor.clone()).context("Failed to configure executor")?;

    let runner =
        TrialRunner::new(generator, Arc::new(executor)).with_retry(config.retry_policy());
    let mut orchestrator = BatchOrchestrator::new(runner, config.tuner.target());
    if !config.logs.disabled {
        let recorder = ResultsRecorder::open(config.logs.dir.clone())
            .await
            .with_context(|| format!("Failed to open log directory {:?}", config.logs.dir))?;
        orchestrator = orchestrator.with_recorder(Arc::new(recorder));
    }

    info!(
        dataset = %config.task.dataset,
        generator = ?config.generator.provider,
        model = %config.generator.model(),
        "engine ready"
    );
    Ok(Engine {
        config,
        prompt,
        orchestrator,
    })
}

/// Run one batch
async fn cmd_run(
    config: EngineConfig,
    report_path: Option<&Path>,
    cancel: watch::Receiver<bool>,
) -> Result<BatchReport> {
    let engine = build_engine(config).await?;
    let report = engine
        .orchestrator
        .run_batch(
            engine.config.batch.trials,
            Arc::new(engine.config.task.clone()),
            &engine.prompt,
            engine.config.batch.policy(),
            cancel,
        )
        .await
        .context("Batch did not complete")?;

    if let Some(path) = report_path {
        write_batch_report_json(path, &report)?;
        info!(path = %path.display(), "report written");
    }
    Ok(report)
}

/// Run the difficulty tuner
async fn cmd_tune(
    config: EngineConfig,
    report_path: Option<&Path>,
    cancel: watch::Receiver<bool>,
) -> Result<TunerOutcome> {
    let engine = build_engine(config).await?;
    let tuner = DifficultyTuner::new(engine.config.tuner.clone())
        .context("Invalid tuner configuration")?;
    let plan = BatchPlan {
        orchestrator: engine.orchestrator,
        trials: engine.config.batch.trials,
        policy: engine.config.batch.policy(),
        cancel,
    };

    let outcome = tuner
        .run(&plan, engine.config.task, engine.prompt)
        .await
        .context("Tuning stopped")?;

    if let Some(path) = report_path {
        write_tuner_outcome_json(path, &outcome)?;
        info!(path = %path.display(), "tuner report written");
    }
    Ok(outcome)
}

fn print_tuner_outcome(outcome: &TunerOutcome) {
    for attempt in &outcome.history {
        println!(
            "attempt {:>2}  run {}  pass_rate {:>5.1}%  {}",
            attempt.attempt,
            attempt.run_id,
            attempt.pass_rate * 100.0,
            attempt.status
        );
    }
    println!();
    println!("State: {}", outcome.state);
    match outcome.last_pass_rate {
        Some(rate) => println!("Last pass rate: {:.1}%", rate * 100.0),
        None => println!("Last pass rate: n/a"),
    }
    println!("Thresholds:");
    for threshold in &outcome.thresholds {
        println!("  {}", threshold);
    }
}

/// Show recorded batches
async fn cmd_history(log_dir: &Path, limit: usize, run: Option<Uuid>) -> Result<()> {
    let recorder = ResultsRecorder::at(log_dir);

    if let Some(run_id) = run {
        let entries: Vec<_> = recorder
            .history()
            .await
            .context("Failed to read trial log")?
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect();
        if entries.is_empty() {
            println!("No trials recorded for run {}", run_id);
            return Ok(());
        }
        for entry in entries {
            let record = &entry.record;
            match record.verdict.reason() {
                None => println!("#{:<3} passed  ({} ms)", record.trial_index, record.elapsed_ms),
                Some(reason) => println!("#{:<3} failed  {}", record.trial_index, reason),
            }
        }
        return Ok(());
    }

    let summaries = recorder
        .summaries()
        .await
        .context("Failed to read run summary log")?;
    if summaries.is_empty() {
        println!("No batches recorded in {}", log_dir.display());
        return Ok(());
    }
    let skip = summaries.len().saturating_sub(limit);
    for line in &summaries[skip..] {
        println!("{}", line);
    }
    Ok(())
}
