use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use stoch_core::{ensure_dir, sha256_file};
use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::WorkerId;

/// `<dir>/model_worker_<id><ext>`, keeping the master model's extension.
pub fn worker_model_path(worker_models_dir: &Path, model_path: &Path, worker_id: WorkerId) -> PathBuf {
    let ext = model_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    worker_models_dir.join(format!("model_worker_{}{}", worker_id, ext))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedModel {
    pub worker_id: WorkerId,
    pub path: PathBuf,
    pub created: bool,
    /// `None` when the copy could not be hashed.
    pub sha256: Option<String>,
}

impl ProvisionedModel {
    pub fn status(&self) -> &'static str {
        if self.created {
            "created"
        } else {
            "exists"
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    /// Recopy even when a destination already exists.
    pub force: bool,
    /// Remove the whole output directory first.
    pub clean: bool,
}

/// Creates private model copies for workers `1..=n_workers`. Existing
/// copies are left alone unless `force` is set.
pub fn provision_worker_models(
    model_path: &Path,
    out_dir: &Path,
    n_workers: usize,
    options: ProvisionOptions,
) -> Result<Vec<ProvisionedModel>> {
    if options.clean && out_dir.exists() {
        fs::remove_dir_all(out_dir)
            .with_context(|| format!("remove directory {}", out_dir.display()))?;
    }
    ensure_dir(out_dir)?;
    let mut results = Vec::with_capacity(n_workers);
    for worker_id in 1..=n_workers as WorkerId {
        let dest = worker_model_path(out_dir, model_path, worker_id);
        let created = if dest.exists() && !options.force {
            false
        } else {
            fs::copy(model_path, &dest).with_context(|| {
                format!("copy model for worker {} to {}", worker_id, dest.display())
            })?;
            true
        };
        let sha256 = match sha256_file(&dest) {
            Ok(digest) => Some(digest),
            Err(e) => {
                warn!(worker = worker_id, error = %e, "could not hash model copy");
                None
            }
        };
        results.push(ProvisionedModel {
            worker_id,
            path: dest,
            created,
            sha256,
        });
    }
    info!(
        workers = n_workers,
        created = results.iter().filter(|m| m.created).count(),
        dir = %out_dir.display(),
        "provisioning complete"
    );
    Ok(results)
}

/// Pre-flight check run before any worker starts: reuse a complete set of
/// copies, otherwise create the missing ones. Never hands out the shared
/// master model.
pub fn ensure_worker_models(
    model_path: &Path,
    worker_models_dir: &Path,
    n_workers: usize,
) -> Result<BTreeMap<WorkerId, PathBuf>, RunError> {
    ensure_dir(worker_models_dir).map_err(|e| RunError::Provisioning(format!("{:#}", e)))?;
    let expected: BTreeMap<WorkerId, PathBuf> = (1..=n_workers as WorkerId)
        .map(|id| (id, worker_model_path(worker_models_dir, model_path, id)))
        .collect();
    if expected.values().all(|p| p.exists()) {
        info!(dir = %worker_models_dir.display(), "using existing pre-provisioned worker models");
        return Ok(expected);
    }
    info!(
        dir = %worker_models_dir.display(),
        "pre-provisioned worker models not complete; creating missing copies"
    );
    for (worker_id, dest) in &expected {
        if dest.exists() {
            continue;
        }
        fs::copy(model_path, dest).map_err(|e| {
            RunError::Provisioning(format!(
                "failed to create worker model copy for worker {}: {}",
                worker_id, e
            ))
        })?;
        debug!(worker = *worker_id, dest = %dest.display(), "copied model");
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_root;
    use stoch_core::sha256_bytes;

    #[test]
    fn copy_names_keep_model_extension() {
        let dir = Path::new("/w");
        assert_eq!(
            worker_model_path(dir, Path::new("/m/model.xlsb"), 3),
            PathBuf::from("/w/model_worker_3.xlsb")
        );
        assert_eq!(
            worker_model_path(dir, Path::new("/m/model"), 1),
            PathBuf::from("/w/model_worker_1")
        );
    }

    #[test]
    fn provisioning_is_idempotent_unless_forced() {
        let root = temp_root("provision_idem");
        let model = root.join("model.xlsb");
        fs::write(&model, b"v1").expect("model");
        let out = root.join("copies");

        let first = provision_worker_models(&model, &out, 2, ProvisionOptions::default())
            .expect("first");
        assert!(first.iter().all(|m| m.created));
        assert_eq!(first[0].sha256.as_deref(), Some(sha256_bytes(b"v1").as_str()));

        fs::write(&model, b"v2").expect("model v2");
        let second = provision_worker_models(&model, &out, 3, ProvisionOptions::default())
            .expect("second");
        let statuses: Vec<&str> = second.iter().map(|m| m.status()).collect();
        assert_eq!(statuses, vec!["exists", "exists", "created"]);
        assert_eq!(fs::read(&second[0].path).expect("copy"), b"v1");

        let forced = provision_worker_models(
            &model,
            &out,
            2,
            ProvisionOptions {
                force: true,
                clean: false,
            },
        )
        .expect("forced");
        assert!(forced.iter().all(|m| m.created));
        assert_eq!(fs::read(&forced[0].path).expect("copy"), b"v2");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn clean_removes_stale_files() {
        let root = temp_root("provision_clean");
        let model = root.join("model.xlsm");
        fs::write(&model, b"m").expect("model");
        let out = root.join("copies");
        ensure_dir(&out).expect("out");
        fs::write(out.join("stale.txt"), b"x").expect("stale");

        provision_worker_models(
            &model,
            &out,
            1,
            ProvisionOptions {
                force: false,
                clean: true,
            },
        )
        .expect("clean provision");
        assert!(!out.join("stale.txt").exists());
        assert!(out.join("model_worker_1.xlsm").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn preflight_fills_gaps_and_never_falls_back_to_master() {
        let root = temp_root("provision_preflight");
        let model = root.join("model.xlsb");
        fs::write(&model, b"master").expect("model");
        let dir = root.join("worker_models");
        ensure_dir(&dir).expect("dir");
        fs::write(dir.join("model_worker_1.xlsb"), b"existing").expect("existing copy");

        let paths = ensure_worker_models(&model, &dir, 2).expect("preflight");
        assert_eq!(paths.len(), 2);
        assert_eq!(fs::read(&paths[&1]).expect("w1"), b"existing");
        assert_eq!(fs::read(&paths[&2]).expect("w2"), b"master");
        assert!(paths.values().all(|p| p != &model));

        let missing_master = root.join("absent.xlsb");
        let err = ensure_worker_models(&missing_master, &root.join("other"), 1)
            .expect_err("copy must fail");
        assert!(matches!(err, RunError::Provisioning(_)));
        let _ = fs::remove_dir_all(root);
    }
}
