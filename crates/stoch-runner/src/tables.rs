use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Input vectors keyed by integer ID (assumption sets or policies).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputTable {
    rows: BTreeMap<u32, Vec<f64>>,
}

impl InputTable {
    pub fn from_rows(rows: BTreeMap<u32, Vec<f64>>) -> Self {
        Self { rows }
    }

    /// Reads a CSV whose first row is a header, first column an integer ID
    /// and remaining columns floats.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read input table {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse input table {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut rows = BTreeMap::new();
        for (idx, line) in raw.lines().enumerate().skip(1) {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            let key_raw = fields.next().unwrap_or_default();
            let key = key_raw
                .parse::<u32>()
                .map_err(|_| anyhow!("line {}: invalid ID '{}'", line_no, key_raw))?;
            let values = fields
                .map(|f| {
                    f.parse::<f64>()
                        .map_err(|_| anyhow!("line {}: invalid number '{}'", line_no, f))
                })
                .collect::<Result<Vec<_>>>()?;
            rows.insert(key, values);
        }
        Ok(Self { rows })
    }

    pub fn get(&self, id: u32) -> Option<&[f64]> {
        self.rows.get(&id).map(Vec::as_slice)
    }

    pub fn ids(&self) -> BTreeSet<u32> {
        self.rows.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// IDs from `selected` that have no row.
    pub fn missing<'a>(&self, selected: impl IntoIterator<Item = &'a u32>) -> Vec<u32> {
        selected
            .into_iter()
            .filter(|id| !self.rows.contains_key(id))
            .copied()
            .collect()
    }
}
