//! In-memory engine used by the worker and scheduler tests.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::engine::{Engine, EngineOpener, Region};
use crate::error::EngineError;

pub(crate) fn temp_root(label: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "stoch_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    std::fs::create_dir_all(&root).expect("temp root");
    root
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeLog {
    pub opens: usize,
    pub closes: usize,
    pub calcs: usize,
    /// `(region, values)` for every write attempt, failed ones included.
    pub writes: Vec<(String, Vec<f64>)>,
}

type CalcPlan = Arc<dyn Fn(usize) -> Result<Vec<f64>, EngineError> + Send + Sync>;
type WritePlan = Arc<dyn Fn(usize) -> Result<(), EngineError> + Send + Sync>;

/// Opens engines that share one log. Plans receive the 0-based index of
/// the call across all engines opened by this opener.
#[derive(Clone)]
pub(crate) struct FakeEngineOpener {
    log: Arc<Mutex<FakeLog>>,
    calc: CalcPlan,
    write: WritePlan,
    open_fails: bool,
}

impl Default for FakeEngineOpener {
    fn default() -> Self {
        Self {
            log: Arc::default(),
            calc: Arc::new(|call| Ok(vec![call as f64, 1.0])),
            write: Arc::new(|_| Ok(())),
            open_fails: false,
        }
    }
}

impl FakeEngineOpener {
    pub fn with_calc<F>(plan: F) -> Self
    where
        F: Fn(usize) -> Result<Vec<f64>, EngineError> + Send + Sync + 'static,
    {
        Self {
            calc: Arc::new(plan),
            ..Self::default()
        }
    }

    pub fn with_write<F>(plan: F) -> Self
    where
        F: Fn(usize) -> Result<(), EngineError> + Send + Sync + 'static,
    {
        Self {
            write: Arc::new(plan),
            ..Self::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            open_fails: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> FakeLog {
        self.log.lock().expect("fake log").clone()
    }
}

impl EngineOpener for FakeEngineOpener {
    type Engine = FakeEngine;

    fn open(&self, resource: &Path) -> Result<FakeEngine, EngineError> {
        self.log.lock().expect("fake log").opens += 1;
        if self.open_fails {
            return Err(EngineError::Open(format!("cannot open {}", resource.display())));
        }
        Ok(FakeEngine {
            opener: self.clone(),
        })
    }
}

pub(crate) struct FakeEngine {
    opener: FakeEngineOpener,
}

impl Engine for FakeEngine {
    fn write_region(&mut self, region: &Region, values: &[f64]) -> Result<(), EngineError> {
        let call = {
            let mut log = self.opener.log.lock().expect("fake log");
            log.writes.push((region.to_string(), values.to_vec()));
            log.writes.len() - 1
        };
        (self.opener.write)(call)
    }

    fn recalculate_and_read(&mut self, _region: &Region) -> Result<Vec<f64>, EngineError> {
        let call = {
            let mut log = self.opener.log.lock().expect("fake log");
            log.calcs += 1;
            log.calcs - 1
        };
        (self.opener.calc)(call)
    }

    fn close(&mut self) {
        self.opener.log.lock().expect("fake log").closes += 1;
    }
}
