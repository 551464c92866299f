use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{EngineRegions, Region};
use crate::retry::{RetryPolicy, MAX_RETRY_DELAY};
use crate::selection::Selection;

/// Contents of the run's YAML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub assumptions_csv: PathBuf,
    pub policies_csv: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_worker_models_dir")]
    pub worker_models_dir: PathBuf,

    pub n_workers: usize,
    pub n_sims: usize,
    pub scenarios: Selection,
    pub policies: Selection,

    #[serde(default = "default_worksheet")]
    pub worksheet_name: String,
    #[serde(default = "default_rng_assump")]
    pub rng_assump: String,
    #[serde(default = "default_rng_policy")]
    pub rng_policy: String,
    #[serde(default = "default_rng_out")]
    pub rng_out: String,

    /// Seconds.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: f64,
    /// Seconds.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub provision: ProvisionConfig,

    /// Program and arguments of the engine bridge; the private model path
    /// is appended as the last argument.
    #[serde(default)]
    pub engine_command: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub clean: bool,
    /// Falls back to `n_workers`.
    #[serde(default)]
    pub n_workers: Option<usize>,
}

fn default_worker_models_dir() -> PathBuf {
    PathBuf::from("worker_models")
}
fn default_worksheet() -> String {
    "Inputs".to_string()
}
fn default_rng_assump() -> String {
    "I7:Z7".to_string()
}
fn default_rng_policy() -> String {
    "I3:T3".to_string()
}
fn default_rng_out() -> String {
    "U11:V11".to_string()
}
fn default_queue_timeout() -> f64 {
    10.0
}
fn default_worker_timeout() -> f64 {
    300.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_retry_backoff() -> f64 {
    2.0
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("engine.log"))
}

/// Explicit timing and sizing record handed to the scheduler loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub n_workers: usize,
    pub queue_timeout: Duration,
    pub worker_timeout: Duration,
    /// Bounded wait for each worker to exit after `Shutdown`.
    pub join_timeout: Duration,
    /// Extra wait after force-terminating a worker that ignored `Shutdown`.
    pub kill_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            n_workers: 1,
            queue_timeout: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(300),
            join_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Everything a worker process needs besides its model copy.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub n_sims: usize,
    pub regions: EngineRegions,
    pub retry: RetryPolicy,
    pub output_dir: PathBuf,
}

impl EngineConfig {
    /// Loads the YAML file, resolves relative paths against the file's
    /// directory and validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: EngineConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
        config.resolve_paths(&base);
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for p in [
            &mut self.model_path,
            &mut self.assumptions_csv,
            &mut self.policies_csv,
            &mut self.output_dir,
            &mut self.worker_models_dir,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
        if let Some(log_file) = self.log_file.as_mut() {
            if log_file.is_relative() {
                *log_file = base.join(&*log_file);
            }
        }
    }

    /// Reports every problem at once rather than stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.n_workers == 0 {
            problems.push("n_workers must be at least 1".to_string());
        }
        if self.n_sims == 0 {
            problems.push("n_sims must be at least 1".to_string());
        }
        if self.max_retries == 0 {
            problems.push("max_retries must be at least 1".to_string());
        }
        for (name, value) in [
            ("queue_timeout", self.queue_timeout),
            ("worker_timeout", self.worker_timeout),
        ] {
            if !(value.is_finite() && value > 0.0) {
                problems.push(format!("{} must be a positive number of seconds", name));
            } else if Duration::try_from_secs_f64(value).is_err() {
                problems.push(format!("{} is too large", name));
            }
        }
        let retry_delay_ok = self.retry_delay.is_finite()
            && self.retry_delay >= 0.0
            && self.retry_delay <= MAX_RETRY_DELAY.as_secs_f64();
        if !retry_delay_ok {
            problems.push(format!(
                "retry_delay must be between 0 and {} seconds",
                MAX_RETRY_DELAY.as_secs()
            ));
        }
        if !(self.retry_backoff.is_finite() && self.retry_backoff >= 1.0) {
            problems.push("retry_backoff must be at least 1.0".to_string());
        } else if self.max_retries > 0
            && retry_delay_ok
            && self.retry_policy().largest_delay().is_none()
        {
            problems.push(format!(
                "retry_delay * retry_backoff^(max_retries - 2) must not exceed {}s",
                MAX_RETRY_DELAY.as_secs()
            ));
        }
        if self.engine_command.is_empty() {
            problems.push("engine_command must name the engine bridge program".to_string());
        }
        if self.provision.n_workers == Some(0) {
            problems.push("provision.n_workers must be at least 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid config: {}", problems.join("; ")))
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            n_workers: self.n_workers,
            queue_timeout: Duration::from_secs_f64(self.queue_timeout),
            worker_timeout: Duration::from_secs_f64(self.worker_timeout),
            ..SchedulerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs_f64(self.retry_delay),
            retry_backoff: self.retry_backoff,
        }
    }

    pub fn regions(&self) -> EngineRegions {
        let region = |address: &str| Region::new(&self.worksheet_name, address);
        EngineRegions {
            assumptions: region(&self.rng_assump),
            policy: region(&self.rng_policy),
            output: region(&self.rng_out),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            n_sims: self.n_sims,
            regions: self.regions(),
            retry: self.retry_policy(),
            output_dir: self.output_dir.clone(),
        }
    }

    pub fn provision_workers(&self) -> usize {
        self.provision.n_workers.unwrap_or(self.n_workers)
    }
}
