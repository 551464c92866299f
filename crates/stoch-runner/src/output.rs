use anyhow::{anyhow, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use stoch_core::atomic_write_bytes;

use crate::{PolicyId, ScenarioId};

pub const POLICY_CSV_HEADER: &str = "sim,PVFP,PVFPrem";

/// Two numeric outputs of one simulation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimOutput {
    pub pvfp: Option<f64>,
    pub pvfprem: Option<f64>,
}

impl SimOutput {
    /// Takes the first two values read from the output region; missing ones
    /// stay empty.
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            pvfp: values.first().copied(),
            pvfprem: values.get(1).copied(),
        }
    }
}

pub fn policy_output_path(output_dir: &Path, scenario_id: ScenarioId, policy_id: PolicyId) -> PathBuf {
    output_dir
        .join(format!("scenario_{}", scenario_id))
        .join(format!("policy_{}.csv", policy_id))
}

pub fn render_policy_csv(outputs: &[SimOutput]) -> String {
    let mut out = String::with_capacity(32 + outputs.len() * 32);
    out.push_str(POLICY_CSV_HEADER);
    out.push('\n');
    let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
    for (idx, row) in outputs.iter().enumerate() {
        let _ = writeln!(out, "{},{},{}", idx + 1, cell(row.pvfp), cell(row.pvfprem));
    }
    out
}

pub fn write_policy_csv(path: &Path, outputs: &[SimOutput]) -> Result<()> {
    if outputs.is_empty() {
        return Err(anyhow!("no outputs to write for {}", path.display()));
    }
    atomic_write_bytes(path, render_policy_csv(outputs).as_bytes())
}
