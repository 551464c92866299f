use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;

/// Which scenario or policy IDs a run covers, as written in the config:
/// `all`, a range (`"5:10"` or `"5-10"`, inclusive), or a list mixing IDs,
/// ranges and `all`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    Many(Vec<SelectionItem>),
    One(SelectionItem),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SelectionItem {
    Id(u32),
    Expr(String),
}

impl Selection {
    /// Resolves against the IDs present in the loaded table. Lists come back
    /// sorted and de-duplicated.
    pub fn expand(&self, available: &BTreeSet<u32>) -> Result<Vec<u32>> {
        match self {
            Selection::One(SelectionItem::Expr(s)) if is_all(s) => Ok(all(available)),
            Selection::One(SelectionItem::Expr(s)) => parse_range(s, available),
            Selection::One(item @ SelectionItem::Id(_)) => {
                Selection::Many(vec![item.clone()]).expand(available)
            }
            Selection::Many(items) => {
                let mut out = BTreeSet::new();
                for item in items {
                    match item {
                        SelectionItem::Id(id) => {
                            if !available.contains(id) {
                                return Err(anyhow!(
                                    "ID {} not found in available keys: {:?}",
                                    id,
                                    all(available)
                                ));
                            }
                            out.insert(*id);
                        }
                        SelectionItem::Expr(s) if is_all(s) => out.extend(available.iter()),
                        SelectionItem::Expr(s) => out.extend(parse_range(s, available)?),
                    }
                }
                Ok(out.into_iter().collect())
            }
        }
    }
}

fn is_all(s: &str) -> bool {
    s.trim().eq_ignore_ascii_case("all")
}

fn all(available: &BTreeSet<u32>) -> Vec<u32> {
    available.iter().copied().collect()
}

/// Inclusive `start:end` or `start-end`, filtered to the available IDs.
/// A range that matches nothing is an error.
pub fn parse_range(range: &str, available: &BTreeSet<u32>) -> Result<Vec<u32>> {
    let parts: Vec<&str> = if range.contains(':') {
        range.split(':').collect()
    } else if range.contains('-') {
        range.split('-').collect()
    } else {
        return Err(anyhow!(
            "invalid range format: {}. Use 'start:end' or 'start-end'",
            range
        ));
    };
    if parts.len() != 2 {
        return Err(anyhow!(
            "invalid range format: {}. Use 'start:end' or 'start-end'",
            range
        ));
    }
    let bound = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| anyhow!("range must contain integers: {}", range))
    };
    let start = bound(parts[0])?;
    let end = bound(parts[1])?;
    if start > end {
        return Err(anyhow!("invalid range: start {} > end {}", start, end));
    }
    let ids: Vec<u32> = available.range(start..=end).copied().collect();
    if ids.is_empty() {
        return Err(anyhow!(
            "range {} doesn't match any available IDs. Available: {:?}",
            range,
            all(available)
        ));
    }
    Ok(ids)
}
