//! Atomic patch applier.
//!
//! Commits a [`PatchBundle`] (values patch plus template patches) to a chart
//! directory all-or-nothing. Two strategies:
//!
//! - **Direct**: patch files in place, snapshotting each file before its
//!   first write and restoring every snapshot if anything fails.
//! - **Staged replace**: apply the bundle to a temporary copy of the chart,
//!   optionally verify it there, then promote the changed files only if none
//!   of the originals changed since they were hashed.
//!
//! Both strategies hold the chart's lock from [`lock::chart_lock`] while
//! touching the original tree.

pub mod diff;
pub mod lock;
pub mod paths;

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::types::{Chart, PatchBundle, TemplatePatchBody, VerificationStatus, Violation};
use super::values_patcher::patch_values_yaml;
use super::verify::{VerificationPipeline, VerificationResult};
use crate::error::{OptimizerError, Result};

pub use diff::{apply_unified_diff, parse_bundle_diff};
pub use lock::chart_lock;
pub use paths::{canonical_chart_path, copy_chart_tree, resolve_in_chart, validate_template_path};

/// How a bundle reached the chart directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStrategy {
    Direct,
    StagedReplace,
}

/// Outcome of an apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub chart_path: PathBuf,
    /// Original files that were rewritten
    pub files_written: Vec<PathBuf>,
    pub values_changed: bool,
    pub strategy: ApplyStrategy,
    /// Staged verification, when one was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
}

/// Options for [`apply_full_fix_bundle_via_staged_replace`].
#[derive(Default)]
pub struct StagedApplyOptions<'a> {
    /// Verify these violations against the staged copy before promotion
    pub verify: Option<(&'a VerificationPipeline<'a>, &'a [Violation])>,
    /// Refuse to promote unless staged verification reports `verified`
    pub require_verified: bool,
}

// ============================================================================
// Strategies
// ============================================================================

/// Apply a bundle in place, rolling back every written file on failure.
///
/// `chart` must be a top-level chart record backed by a local values file.
pub fn apply_full_fix_bundle_atomic(chart: &Chart, bundle: &PatchBundle) -> Result<ApplyResult> {
    let (root, values_file) = local_paths(chart)?;
    let lock = chart_lock(&root);
    let _guard = lock.lock();

    let written = write_bundle(&root, &values_file, bundle)?;
    info!(
        "Applied fix bundle to {} ({} file(s) written)",
        chart.name,
        written.files_written.len()
    );

    Ok(ApplyResult {
        chart_path: root,
        files_written: written.files_written,
        values_changed: written.values_changed,
        strategy: ApplyStrategy::Direct,
        verification: None,
    })
}

/// Apply a bundle to a staged copy, then promote the changed files.
///
/// Fails with [`OptimizerError::ConcurrentModification`] without touching
/// the chart if any target changed after it was hashed. When
/// `require_verified` is set and the staged copy does not verify, nothing is
/// promoted and the result carries the verification with no files written.
pub fn apply_full_fix_bundle_via_staged_replace(
    chart: &Chart,
    bundle: &PatchBundle,
    options: &StagedApplyOptions<'_>,
) -> Result<ApplyResult> {
    if options.require_verified && options.verify.is_none() {
        return Err(OptimizerError::Config(
            "staged apply requires verification but no pipeline was given".to_string(),
        ));
    }

    let (root, values_file) = local_paths(chart)?;
    let values_rel = relative_to(&values_file, &root)?;
    let targets = planned_targets(&root, &values_rel, bundle)?;

    let recorded = targets
        .iter()
        .map(|rel| Ok((rel.clone(), hash_file(&root.join(rel))?)))
        .collect::<Result<Vec<_>>>()?;

    let staged = tempfile::Builder::new().prefix("helm-optimize-").tempdir()?;
    copy_chart_tree(&root, staged.path())?;
    write_bundle(staged.path(), &staged.path().join(&values_rel), bundle)?;
    debug!("Staged fix bundle for {} in {}", chart.name, staged.path().display());

    // Verification renders the staged copy; the chart lock is not held here
    let verification = options
        .verify
        .map(|(pipeline, violations)| pipeline.verify_full_fix_bundle_staged(chart, staged.path(), violations, bundle));

    if options.require_verified {
        if let Some(result) = verification.as_ref().filter(|r| r.status != VerificationStatus::Verified) {
            warn!(
                "Not promoting fix bundle for {}: staged verification is {}",
                chart.name, result.status
            );
            return Ok(ApplyResult {
                chart_path: root,
                files_written: Vec::new(),
                values_changed: false,
                strategy: ApplyStrategy::StagedReplace,
                verification,
            });
        }
    }

    let lock = chart_lock(&root);
    let _guard = lock.lock();

    for (rel, hash) in &recorded {
        let path = root.join(rel);
        if hash_file(&path)? != *hash {
            warn!("{} changed since it was staged, aborting promotion", path.display());
            return Err(OptimizerError::ConcurrentModification { path });
        }
    }

    let mut txn = FileTransaction::default();
    let values_changed = match promote(&mut txn, staged.path(), &root, &targets, &values_rel) {
        Ok(changed) => changed,
        Err(e) => {
            warn!("Promotion into {} failed, rolling back: {}", root.display(), e);
            txn.rollback();
            return Err(e);
        }
    };

    let files_written = txn.into_written();
    info!(
        "Promoted staged fix bundle into {} ({} file(s) written)",
        chart.name,
        files_written.len()
    );

    Ok(ApplyResult {
        chart_path: root,
        files_written,
        values_changed,
        strategy: ApplyStrategy::StagedReplace,
        verification,
    })
}

// ============================================================================
// Bundle writing
// ============================================================================

/// Files written by one bundle application.
#[derive(Debug, Clone, Default)]
pub struct BundleWrite {
    pub files_written: Vec<PathBuf>,
    pub values_changed: bool,
}

/// Apply a bundle under `chart_root` with snapshot/restore semantics.
///
/// Template patches are written first, the values file last. Holds no lock;
/// callers serialize access to the original tree.
pub fn write_bundle(chart_root: &Path, values_file: &Path, bundle: &PatchBundle) -> Result<BundleWrite> {
    let mut txn = FileTransaction::default();
    match write_bundle_in(&mut txn, chart_root, values_file, bundle) {
        Ok(values_changed) => Ok(BundleWrite {
            files_written: txn.into_written(),
            values_changed,
        }),
        Err(e) => {
            if !txn.snapshots.is_empty() {
                warn!(
                    "Rolling back {} file(s) in {}: {}",
                    txn.snapshots.len(),
                    chart_root.display(),
                    e
                );
            }
            txn.rollback();
            Err(e)
        }
    }
}

fn write_bundle_in(
    txn: &mut FileTransaction,
    chart_root: &Path,
    values_file: &Path,
    bundle: &PatchBundle,
) -> Result<bool> {
    for patch in &bundle.template_patches {
        let relative = validate_template_path(&patch.path)?;
        let target = resolve_in_chart(chart_root, &relative)?;
        let updated = match &patch.body {
            TemplatePatchBody::Replacement(body) => body.clone(),
            TemplatePatchBody::UnifiedDiff(diff) => {
                let current = read_text_or_empty(&target)?;
                apply_unified_diff(&current, diff, &patch.path)?
            }
        };
        txn.write(&target, updated.as_bytes())?;
    }

    if bundle.values_patch.is_empty() {
        return Ok(false);
    }
    let original = read_text_or_empty(values_file)?;
    let patched = patch_values_yaml(&original, &bundle.values_patch)?;
    if patched == original {
        debug!("Values patch for {} is already applied", values_file.display());
        return Ok(false);
    }
    txn.write(values_file, patched.as_bytes())?;
    Ok(true)
}

/// Copy changed staged files over their originals.
fn promote(
    txn: &mut FileTransaction,
    staged_root: &Path,
    root: &Path,
    targets: &[PathBuf],
    values_rel: &Path,
) -> Result<bool> {
    let mut values_changed = false;
    for rel in targets {
        let Some(new_bytes) = read_optional(&staged_root.join(rel))? else {
            continue;
        };
        let original_path = root.join(rel);
        if read_optional(&original_path)?.as_deref() == Some(new_bytes.as_slice()) {
            continue;
        }
        txn.write(&original_path, &new_bytes)?;
        if rel == values_rel {
            values_changed = true;
        }
    }
    Ok(values_changed)
}

// ============================================================================
// Transactions
// ============================================================================

/// Original bytes of every file touched so far (`None` = did not exist).
#[derive(Default)]
struct FileTransaction {
    snapshots: Vec<(PathBuf, Option<Vec<u8>>)>,
    written: Vec<PathBuf>,
}

impl FileTransaction {
    fn write(&mut self, path: &Path, contents: &[u8]) -> Result<()> {
        if !self.snapshots.iter().any(|(p, _)| p == path) {
            let original = read_optional(path)?;
            self.snapshots.push((path.to_path_buf(), original));
        }
        atomic_write(path, contents)?;
        if !self.written.iter().any(|p| p == path) {
            self.written.push(path.to_path_buf());
        }
        Ok(())
    }

    fn rollback(self) {
        for (path, original) in self.snapshots.into_iter().rev() {
            let restored = match original {
                Some(bytes) => atomic_write(&path, &bytes),
                None => match fs::remove_file(&path) {
                    Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                },
            };
            if let Err(e) = restored {
                error!("Failed to restore {}: {}", path.display(), e);
            }
        }
    }

    fn into_written(self) -> Vec<PathBuf> {
        self.written
    }
}

/// Write via a sibling temp file and rename, keeping the original's permissions.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.persist(path).map_err(|e| OptimizerError::Io(e.error))?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Canonical chart root and values file of a local chart.
fn local_paths(chart: &Chart) -> Result<(PathBuf, PathBuf)> {
    let values_file = match (&chart.values_file, chart.is_local()) {
        (Some(file), true) => file,
        _ => {
            return Err(OptimizerError::Config(format!(
                "{} is not backed by a local values file",
                chart.name
            )));
        }
    };
    let root = canonical_chart_path(&chart.path);
    let values = canonical_chart_path(values_file);
    if !values.starts_with(&root) {
        return Err(OptimizerError::PathEscapesChart {
            path: values_file.display().to_string(),
        });
    }
    Ok((root, values))
}

fn relative_to(path: &Path, root: &Path) -> Result<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| OptimizerError::PathEscapesChart {
            path: path.display().to_string(),
        })
}

/// Chart-relative paths a bundle may change.
fn planned_targets(root: &Path, values_rel: &Path, bundle: &PatchBundle) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    for patch in &bundle.template_patches {
        let relative = validate_template_path(&patch.path)?;
        resolve_in_chart(root, &relative)?;
        if !targets.contains(&relative) {
            targets.push(relative);
        }
    }
    if !bundle.values_patch.is_empty() {
        targets.push(values_rel.to_path_buf());
    }
    Ok(targets)
}

fn hash_file(path: &Path) -> Result<Option<blake3::Hash>> {
    Ok(read_optional(path)?.map(|bytes| blake3::hash(&bytes)))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_text_or_empty(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}
