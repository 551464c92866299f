//! Run orchestration: config → tables → worker models → pool → scheduler →
//! run summary.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use stoch_core::{atomic_write_bytes, ensure_dir};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::RunError;
use crate::pool::{spawn_pool, WorkerLauncher};
use crate::provision::{ensure_worker_models, provision_worker_models, ProvisionOptions};
use crate::scheduler::{RunOutcome, RunReport, Scheduler, ShutdownHandle};
use crate::tables::InputTable;
use crate::{PolicyId, ScenarioId};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// What a config would run, without starting anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPlan {
    pub scenarios: Vec<ScenarioId>,
    pub policies: Vec<PolicyId>,
    pub total_jobs: usize,
    pub n_workers: usize,
    pub n_sims: usize,
    pub output_dir: PathBuf,
    pub worker_models_dir: PathBuf,
}

pub struct LoadedInputs {
    pub plan: RunPlan,
    pub assumptions: InputTable,
    pub policies: InputTable,
}

/// Loads both tables and expands the scenario and policy selections
/// against their IDs.
pub fn load_inputs(config: &EngineConfig) -> Result<LoadedInputs> {
    let assumptions = InputTable::load(&config.assumptions_csv)?;
    let policies = InputTable::load(&config.policies_csv)?;
    let scenario_ids = config
        .scenarios
        .expand(&assumptions.ids())
        .context("expand scenario selection")?;
    let policy_ids = config
        .policies
        .expand(&policies.ids())
        .context("expand policy selection")?;
    let plan = RunPlan {
        total_jobs: scenario_ids.len() * policy_ids.len(),
        scenarios: scenario_ids,
        policies: policy_ids,
        n_workers: config.n_workers,
        n_sims: config.n_sims,
        output_dir: config.output_dir.clone(),
        worker_models_dir: config.worker_models_dir.clone(),
    };
    Ok(LoadedInputs {
        plan,
        assumptions,
        policies,
    })
}

pub fn describe(config: &EngineConfig) -> Result<RunPlan> {
    Ok(load_inputs(config)?.plan)
}

/// Runs a whole configuration. Fatal run conditions come back inside the
/// report; `Err` is reserved for setup failures before the scheduler
/// starts.
pub fn run_from_config(
    config: &EngineConfig,
    launcher: &dyn WorkerLauncher,
    shutdown: ShutdownHandle,
) -> Result<RunReport> {
    let started_at = Utc::now();
    if !config.model_path.is_file() {
        return Err(anyhow!("model file not found: {}", config.model_path.display()));
    }
    if config.provision.enabled {
        info!("provisioning worker models before run");
        provision_worker_models(
            &config.model_path,
            &config.worker_models_dir,
            config.provision_workers(),
            ProvisionOptions {
                force: config.provision.force,
                clean: config.provision.clean,
            },
        )?;
    }

    let inputs = load_inputs(config)?;
    let plan = &inputs.plan;
    info!(
        scenarios = plan.scenarios.len(),
        policies = plan.policies.len(),
        jobs = plan.total_jobs,
        workers = config.n_workers,
        sims = config.n_sims,
        "run plan"
    );
    ensure_dir(&config.output_dir)?;

    let scheduler_config = config.scheduler_config();
    let failed_before_start = |err: RunError| -> Result<RunReport> {
        let report = RunReport {
            total_jobs: plan.total_jobs,
            completed_jobs: 0,
            elapsed: Default::default(),
            outcome: RunOutcome::Failed(err),
        };
        write_run_summary(&config.output_dir, &report, started_at, Utc::now())?;
        Ok(report)
    };
    let model_paths = match ensure_worker_models(
        &config.model_path,
        &config.worker_models_dir,
        config.n_workers,
    ) {
        Ok(paths) => paths,
        Err(err) => return failed_before_start(err),
    };

    let (results_tx, results_rx) = mpsc::channel();
    let links = match spawn_pool(launcher, &model_paths, &results_tx, scheduler_config.kill_grace)
    {
        Ok(links) => links,
        Err(err) => return failed_before_start(RunError::PoolStart(format!("{:#}", err))),
    };
    // only the reader threads may hold senders, so a dead pool disconnects
    drop(results_tx);

    let mut scheduler = Scheduler::new(
        scheduler_config,
        inputs.assumptions,
        inputs.policies,
        &inputs.plan.scenarios,
        &inputs.plan.policies,
        links,
        results_rx,
    )?
    .with_shutdown(shutdown);
    let report = scheduler.run();
    write_run_summary(&config.output_dir, &report, started_at, Utc::now())?;
    Ok(report)
}

pub fn write_run_summary(
    output_dir: &Path,
    report: &RunReport,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Result<PathBuf> {
    let error = match &report.outcome {
        RunOutcome::Failed(err) => Some(err.to_string()),
        _ => None,
    };
    let summary = json!({
        "schema_version": "run_summary_v1",
        "started_at": started_at.to_rfc3339(),
        "finished_at": finished_at.to_rfc3339(),
        "outcome": report.outcome.label(),
        "error": error,
        "completed_jobs": report.completed_jobs,
        "total_jobs": report.total_jobs,
        "elapsed_s": report.elapsed.as_secs_f64(),
        "avg_job_s": report.average_per_job().map(|d| d.as_secs_f64()),
    });
    let path = output_dir.join(RUN_SUMMARY_FILE);
    atomic_write_bytes(&path, &serde_json::to_vec_pretty(&summary)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_root;
    use serde_json::Value;
    use std::fs;
    use std::time::Duration;

    fn write_config(root: &Path, extra: &str) -> EngineConfig {
        fs::write(root.join("model.xlsb"), b"model").expect("model");
        fs::write(
            root.join("assumptions.csv"),
            "id,a,b\n1,0.1,0.2\n2,0.3,0.4\n3,0.5,0.6\n",
        )
        .expect("assumptions");
        fs::write(root.join("policies.csv"), "id,x\n10,1\n20,2\n30,3\n").expect("policies");
        let yaml = format!(
            r#"
model_path: model.xlsb
assumptions_csv: assumptions.csv
policies_csv: policies.csv
output_dir: out
n_workers: 2
n_sims: 5
scenarios: "1:2"
policies: [30, 10]
engine_command: ["bridge"]
{}
"#,
            extra
        );
        let path = root.join("config.yaml");
        fs::write(&path, yaml).expect("config");
        EngineConfig::load(&path).expect("load config")
    }

    #[test]
    fn describe_expands_selections() {
        let root = temp_root("runner_describe");
        let config = write_config(&root, "");
        let plan = describe(&config).expect("plan");
        assert_eq!(plan.scenarios, vec![1, 2]);
        assert_eq!(plan.policies, vec![10, 30]);
        assert_eq!(plan.total_jobs, 4);
        assert!(plan.output_dir.ends_with("out"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn summary_records_outcome_and_counts() {
        let root = temp_root("runner_summary");
        let report = RunReport {
            total_jobs: 4,
            completed_jobs: 2,
            elapsed: Duration::from_secs(8),
            outcome: RunOutcome::Failed(RunError::WorkerFatal {
                worker_id: 2,
                detail: "engine crashed".to_string(),
            }),
        };
        let path = write_run_summary(&root, &report, Utc::now(), Utc::now()).expect("write");
        let value: Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(value["schema_version"], "run_summary_v1");
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["completed_jobs"], 2);
        assert_eq!(value["avg_job_s"], 4.0);
        assert!(value["error"]
            .as_str()
            .expect("error text")
            .contains("worker 2 failed"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_model_fails_before_any_worker_starts() {
        struct NoLaunch;
        impl WorkerLauncher for NoLaunch {
            fn launch(
                &self,
                _: crate::WorkerId,
                _: &Path,
                _: mpsc::Sender<crate::protocol::ResultMessage>,
            ) -> Result<Box<dyn crate::pool::WorkerLink>> {
                panic!("no worker may start");
            }
        }
        let root = temp_root("runner_no_model");
        let config = write_config(&root, "");
        fs::remove_file(root.join("model.xlsb")).expect("remove model");
        let err = match run_from_config(&config, &NoLaunch, ShutdownHandle::new()) {
            Ok(_) => panic!("run must fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("model file not found"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pool_start_failure_still_writes_summary() {
        struct RefuseLaunch;
        impl WorkerLauncher for RefuseLaunch {
            fn launch(
                &self,
                worker_id: crate::WorkerId,
                _: &Path,
                _: mpsc::Sender<crate::protocol::ResultMessage>,
            ) -> Result<Box<dyn crate::pool::WorkerLink>> {
                Err(anyhow!("no such executable for worker {}", worker_id))
            }
        }
        let root = temp_root("runner_pool_start");
        let config = write_config(&root, "");
        let report =
            run_from_config(&config, &RefuseLaunch, ShutdownHandle::new()).expect("report");
        match &report.outcome {
            RunOutcome::Failed(RunError::PoolStart(detail)) => {
                assert!(detail.contains("failed to start worker 1"), "{}", detail);
                assert!(detail.contains("no such executable"), "{}", detail);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.completed_jobs, 0);
        assert_eq!(report.total_jobs, 4);

        let path = config.output_dir.join(RUN_SUMMARY_FILE);
        let value: Value =
            serde_json::from_slice(&fs::read(&path).expect("summary")).expect("json");
        assert_eq!(value["outcome"], "failed");
        assert!(value["error"]
            .as_str()
            .expect("error text")
            .contains("worker pool failed to start"));
        let _ = fs::remove_dir_all(root);
    }
}
