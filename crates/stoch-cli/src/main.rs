use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use stoch_runner::{
    aggregate_results, describe, provision_worker_models, run_from_config, serve_process,
    EngineConfig, ProcessLauncher, ProvisionOptions, RunOutcome, RunPlan, RunReport,
    ShutdownHandle,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_FAILED: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "stoch", version = "0.3.0", about = "Stochastic simulation dispatch CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every (scenario, policy) job of a config on the worker pool.
    Run {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show what a config would run without starting workers.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Create private per-worker copies of the model.
    Provision {
        config: PathBuf,
        #[arg(long)]
        n_workers: Option<usize>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        json: bool,
    },
    /// Summarize per-policy result files into one CSV.
    Aggregate {
        #[arg(long)]
        output_dir: PathBuf,
        /// Relative to the output directory.
        #[arg(long)]
        out_file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        worker_id: u32,
        #[arg(long)]
        model: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(CommandOutput { payload, exit_code }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(EXIT_FAILED);
            }
            Err(err)
        }
    }
}

struct CommandOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run { config, json } => {
            let config_path = absolute(&config)?;
            let engine_config = EngineConfig::load(&config_path)?;
            init_logging(&engine_config.log_level, engine_config.log_file.as_deref())?;
            info!(config = %config_path.display(), "loaded configuration");

            let shutdown = ShutdownHandle::new();
            let handle = shutdown.clone();
            spawn_signal_listener(move |signal| {
                warn!(signal, "shutdown requested, finishing in-flight jobs");
                handle.request();
            })?;

            let launcher = ProcessLauncher::current_exe(&config_path)?;
            let report = run_from_config(&engine_config, &launcher, shutdown)?;
            let exit_code = match &report.outcome {
                RunOutcome::Completed => 0,
                RunOutcome::Interrupted => EXIT_INTERRUPTED,
                RunOutcome::Failed(_) => EXIT_FAILED,
            };
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": exit_code == 0,
                        "command": "run",
                        "run": report_to_json(&report),
                        "output_dir": engine_config.output_dir,
                    })),
                    exit_code,
                });
            }
            print_report(&report);
            Ok(CommandOutput {
                payload: None,
                exit_code,
            })
        }
        Commands::Describe { config, json } => {
            let engine_config = EngineConfig::load(&config)?;
            init_logging("warn", None)?;
            let plan = describe(&engine_config)?;
            if json {
                return Ok(CommandOutput::done(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "plan": plan,
                }))));
            }
            print_plan(&plan);
            Ok(CommandOutput::done(None))
        }
        Commands::Provision {
            config,
            n_workers,
            force,
            clean,
            json,
        } => {
            let engine_config = EngineConfig::load(&config)?;
            init_logging(&engine_config.log_level, None)?;
            let n_workers = n_workers.unwrap_or_else(|| engine_config.provision_workers());
            let models = provision_worker_models(
                &engine_config.model_path,
                &engine_config.worker_models_dir,
                n_workers,
                ProvisionOptions { force, clean },
            )?;
            if json {
                let rows: Vec<Value> = models
                    .iter()
                    .map(|m| {
                        json!({
                            "worker_id": m.worker_id,
                            "path": m.path,
                            "status": m.status(),
                            "sha256": m.sha256,
                        })
                    })
                    .collect();
                return Ok(CommandOutput::done(Some(json!({
                    "ok": true,
                    "command": "provision",
                    "worker_models_dir": engine_config.worker_models_dir,
                    "models": rows,
                }))));
            }
            for m in &models {
                println!(
                    "worker {}: {} ({}) sha256={}",
                    m.worker_id,
                    m.path.display(),
                    m.status(),
                    m.sha256.as_deref().unwrap_or("unavailable")
                );
            }
            Ok(CommandOutput::done(None))
        }
        Commands::Aggregate {
            output_dir,
            out_file,
            json,
        } => {
            init_logging("info", None)?;
            let report = aggregate_results(&output_dir, out_file.as_deref())?;
            if json {
                return Ok(CommandOutput::done(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "summary_path": report.summary_path,
                    "policies": report.policies,
                    "scenarios": report.scenarios,
                }))));
            }
            match &report.summary_path {
                Some(path) => println!("wrote summary to {}", path.display()),
                None => println!("no results found to summarize"),
            }
            Ok(CommandOutput::done(None))
        }
        Commands::Worker {
            config,
            worker_id,
            model,
        } => {
            let engine_config = EngineConfig::load(&config)?;
            // stdout carries results; logs stay on stderr
            init_logging(&engine_config.log_level, None)?;
            // interrupts reach the whole process group; the scheduler stops
            // this worker through the task channel instead
            spawn_signal_listener(move |signal| {
                info!(worker = worker_id, signal, "ignoring signal, waiting for shutdown task");
            })?;
            let exit = serve_process(&engine_config, worker_id, &model);
            Ok(CommandOutput {
                payload: None,
                exit_code: exit.exit_code(),
            })
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("config file not found: {}", path.display()))
}

/// Console output on stderr plus an optional plain-text log file.
/// `RUST_LOG` overrides the configured level.
fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.to_ascii_lowercase())
            .with_context(|| format!("invalid log_level '{}'", level))?,
    };
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}

/// Listens for SIGINT/SIGTERM on a dedicated thread and calls `on_signal`
/// with the signal name each time one arrives.
fn spawn_signal_listener<F>(on_signal: F) -> Result<()>
where
    F: Fn(&'static str) + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut interrupt, mut terminate) = {
            let _guard = runtime.enter();
            (
                signal(SignalKind::interrupt()).context("listen for SIGINT")?,
                signal(SignalKind::terminate()).context("listen for SIGTERM")?,
            )
        };
        thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            Some(()) = interrupt.recv() => on_signal("SIGINT"),
                            Some(()) = terminate.recv() => on_signal("SIGTERM"),
                            else => break,
                        }
                    }
                })
            })
            .context("spawn signal listener")?;
    }

    #[cfg(not(unix))]
    {
        thread::Builder::new()
            .name("signal-listener".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while tokio::signal::ctrl_c().await.is_ok() {
                        on_signal("ctrl-c");
                    }
                })
            })
            .context("spawn signal listener")?;
    }
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Provision { json, .. }
        | Commands::Aggregate { json, .. } => *json,
        Commands::Worker { .. } => false,
    }
}

fn report_to_json(report: &RunReport) -> Value {
    let error = match &report.outcome {
        RunOutcome::Failed(err) => Some(err.to_string()),
        _ => None,
    };
    json!({
        "outcome": report.outcome.label(),
        "error": error,
        "completed_jobs": report.completed_jobs,
        "total_jobs": report.total_jobs,
        "elapsed_s": report.elapsed.as_secs_f64(),
        "avg_job_s": report.average_per_job().map(|d| d.as_secs_f64()),
    })
}

fn print_report(report: &RunReport) {
    println!("outcome: {}", report.outcome.label());
    if let RunOutcome::Failed(err) = &report.outcome {
        println!("error: {}", err);
    }
    println!("completed: {}/{}", report.completed_jobs, report.total_jobs);
    println!("elapsed: {:.2}s", report.elapsed.as_secs_f64());
    if let Some(avg) = report.average_per_job() {
        println!("avg_per_job: {:.2}s", avg.as_secs_f64());
    }
}

fn print_plan(plan: &RunPlan) {
    println!("scenarios: {:?}", plan.scenarios);
    println!("policies: {:?}", plan.policies);
    println!("jobs: {}", plan.total_jobs);
    println!("workers: {}", plan.n_workers);
    println!("sims_per_job: {}", plan.n_sims);
    println!("output_dir: {}", plan.output_dir.display());
    println!("worker_models_dir: {}", plan.worker_models_dir.display());
}
