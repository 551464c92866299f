use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use stoch_core::atomic_write_bytes;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{PolicyId, ScenarioId};

pub const SUMMARY_CSV_HEADER: &str =
    "Scenario,Policy,N,ProbRuin,AvgPVFP,AvgPVFPrem,PM_Avg,MedianPVFP,MedianPVFPrem,PM_Median";

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStats {
    pub n: usize,
    /// Share of simulations with negative PVFP.
    pub prob_ruin: f64,
    pub avg_pvfp: f64,
    pub avg_pvfprem: f64,
    /// `None` when the denominator is zero.
    pub pm_avg: Option<f64>,
    pub median_pvfp: f64,
    pub median_pvfprem: f64,
    pub pm_median: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicySummary {
    pub scenario_id: ScenarioId,
    pub policy_id: PolicyId,
    pub stats: PolicyStats,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    (den != 0.0).then(|| num / den)
}

/// Statistics over one policy result file. `Ok(None)` for a file without
/// simulation rows. Columns are found by header name (`PVFP`/`PVFPrem`,
/// falling back to `out1`/`out2`); empty cells count as 0.
pub fn summarize_policy_csv(raw: &str) -> Result<Option<PolicyStats>> {
    let mut lines = raw.lines();
    let header: Vec<&str> = match lines.next() {
        Some(h) => h.split(',').map(str::trim).collect(),
        None => return Ok(None),
    };
    let column = |names: [&str; 2]| {
        names
            .iter()
            .find_map(|name| header.iter().position(|h| h == name))
    };
    let pvfp_col = column(["PVFP", "out1"]);
    let pvfprem_col = column(["PVFPrem", "out2"]);

    let mut pvfps = Vec::new();
    let mut pvfprems = Vec::new();
    for (idx, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let cell = |col: Option<usize>| -> Result<f64> {
            match col.and_then(|c| fields.get(c)).copied() {
                None | Some("") => Ok(0.0),
                Some(v) => v
                    .parse::<f64>()
                    .map_err(|_| anyhow!("line {}: invalid number '{}'", idx + 2, v)),
            }
        };
        pvfps.push(cell(pvfp_col)?);
        pvfprems.push(cell(pvfprem_col)?);
    }
    if pvfps.is_empty() {
        return Ok(None);
    }

    let n = pvfps.len();
    let avg_pvfp = mean(&pvfps);
    let avg_pvfprem = mean(&pvfprems);
    let median_pvfp = median(&pvfps);
    let median_pvfprem = median(&pvfprems);
    Ok(Some(PolicyStats {
        n,
        prob_ruin: pvfps.iter().filter(|v| **v < 0.0).count() as f64 / n as f64,
        avg_pvfp,
        avg_pvfprem,
        pm_avg: ratio(avg_pvfp, avg_pvfprem),
        median_pvfp,
        median_pvfprem,
        pm_median: ratio(median_pvfp, median_pvfprem),
    }))
}

fn parse_suffix(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}

/// Summaries for every `scenario_<s>/policy_<p>.csv` under `output_dir`,
/// ordered by scenario then policy.
pub fn collect_summaries(output_dir: &Path) -> Result<Vec<PolicySummary>> {
    let mut summaries = Vec::new();
    for entry in WalkDir::new(output_dir).min_depth(2).max_depth(2) {
        let entry = entry.with_context(|| format!("walk {}", output_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let scenario_id = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| parse_suffix(&n.to_string_lossy(), "scenario_", ""));
        let policy_id = parse_suffix(&entry.file_name().to_string_lossy(), "policy_", ".csv");
        let (Some(scenario_id), Some(policy_id)) = (scenario_id, policy_id) else {
            continue;
        };
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        match summarize_policy_csv(&raw).with_context(|| format!("summarize {}", path.display()))? {
            Some(stats) => summaries.push(PolicySummary {
                scenario_id,
                policy_id,
                stats,
            }),
            None => debug!(file = %path.display(), "no simulation rows"),
        }
    }
    summaries.sort_by_key(|s| (s.scenario_id, s.policy_id));
    Ok(summaries)
}

pub fn render_summary_csv(summaries: &[PolicySummary]) -> String {
    let mut out = String::new();
    out.push_str(SUMMARY_CSV_HEADER);
    out.push('\n');
    let opt = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
    for s in summaries {
        let st = &s.stats;
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            s.scenario_id,
            s.policy_id,
            st.n,
            st.prob_ruin,
            st.avg_pvfp,
            st.avg_pvfprem,
            opt(st.pm_avg),
            st.median_pvfp,
            st.median_pvfprem,
            opt(st.pm_median)
        );
    }
    out
}

/// `<output_dir>/<basename of output_dir>_summary.csv`.
pub fn default_summary_path(output_dir: &Path) -> PathBuf {
    let base = output_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    output_dir.join(format!("{}_summary.csv", base))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    /// `None` when no results were found and nothing was written.
    pub summary_path: Option<PathBuf>,
    pub policies: usize,
    pub scenarios: usize,
}

/// Writes the summary CSV. `out_file`, when relative, is taken relative to
/// `output_dir`.
pub fn aggregate_results(output_dir: &Path, out_file: Option<&Path>) -> Result<AggregateReport> {
    if !output_dir.is_dir() {
        return Err(anyhow!("output directory not found: {}", output_dir.display()));
    }
    let summaries = collect_summaries(output_dir)?;
    let mut per_scenario: HashMap<ScenarioId, usize> = HashMap::new();
    for s in &summaries {
        *per_scenario.entry(s.scenario_id).or_default() += 1;
    }
    if summaries.is_empty() {
        info!(dir = %output_dir.display(), "no results found to summarize");
        return Ok(AggregateReport {
            summary_path: None,
            policies: 0,
            scenarios: 0,
        });
    }
    let summary_path = match out_file {
        Some(p) => output_dir.join(p),
        None => default_summary_path(output_dir),
    };
    atomic_write_bytes(&summary_path, render_summary_csv(&summaries).as_bytes())?;
    info!(
        path = %summary_path.display(),
        policies = summaries.len(),
        scenarios = per_scenario.len(),
        "wrote summary"
    );
    Ok(AggregateReport {
        summary_path: Some(summary_path),
        policies: summaries.len(),
        scenarios: per_scenario.len(),
    })
}
