//! Release reuse and retention.
//!
//! Retention keeps the newest releases of a kind, every active release, and
//! every release pinned by `current` or `last_good`. Everything else is
//! removed from the catalog and from disk, except directories a kept record
//! still points at.

use crate::catalog::{CatalogError, ReleaseCatalog};
use crate::package::sha256_digest::Sha256Digest;
use crate::release::{ReleaseId, ReleaseRecord, ReleaseStatus};
use crate::store::{Pointer, ResolvedPins, Store, StoreError};
use camino::Utf8PathBuf;
use std::collections::HashSet;
use std::io;
use thiserror::Error;

/// Number of newest releases retained per kind when none is configured.
pub const DEFAULT_RETENTION_COUNT: usize = 20;

/// Errors raised while pruning releases.
#[derive(Debug, Error)]
pub enum RetentionError {
    /// The activation lock could not be taken.
    #[error("failed to take the activation lock: {0}")]
    Lock(#[source] StoreError),

    /// The release pointers could not be resolved.
    #[error("failed to resolve release pointers: {0}")]
    Pins(#[source] StoreError),

    /// The catalog could not be updated.
    #[error("failed to delete pruned releases: {0}")]
    Catalog(#[source] CatalogError),
}

/// Return true when `record` can be reused instead of staging it again.
///
/// The record must be verified or active, match `expected` when a digest is
/// known, and have its release directory inside the store.
#[must_use]
pub fn can_reuse(store: &Store, record: &ReleaseRecord, expected: Option<&Sha256Digest>) -> bool {
    if !record.status.is_reusable() {
        return false;
    }
    if expected.is_some_and(|digest| !digest.as_str().eq_ignore_ascii_case(&record.checksum)) {
        return false;
    }
    let release_dir = store.release_dir(&record.version);
    store.contains(&release_dir) && release_dir.is_dir()
}

/// Which releases to keep and what to remove.
///
/// Only direct children of the releases directory are ever removed, and
/// never one that holds a kept or pinned path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Releases that stay.
    pub keep: Vec<ReleaseId>,
    /// Releases to delete from the catalog.
    pub delete: Vec<ReleaseId>,
    /// Release directories to remove, de-duplicated.
    pub remove_paths: Vec<Utf8PathBuf>,
}

/// Decide what to prune from `releases`, which must be ordered newest first.
///
/// A `keep` of zero selects [`DEFAULT_RETENTION_COUNT`].
#[must_use]
pub fn plan_retention(
    store: &Store,
    releases: &[ReleaseRecord],
    keep: usize,
    pins: &ResolvedPins,
) -> RetentionPlan {
    let keep = if keep == 0 { DEFAULT_RETENTION_COUNT } else { keep };
    let (kept, doomed): (Vec<_>, Vec<_>) = releases.iter().enumerate().partition(|(index, record)| {
        *index < keep || record.status == ReleaseStatus::Active || pins.contains(&record.storage_path)
    });

    let releases_dir = store.releases_dir();
    let protected: HashSet<Utf8PathBuf> = kept
        .iter()
        .filter_map(|(_, record)| store.ensure_within(&record.storage_path).ok())
        .chain(pins.paths.iter().cloned())
        .collect();

    let mut plan = RetentionPlan {
        keep: kept.iter().map(|(_, record)| record.id).collect(),
        ..RetentionPlan::default()
    };
    for (_, record) in doomed {
        plan.delete.push(record.id);
        let Ok(path) = store.ensure_within(&record.storage_path) else {
            log::debug!(
                "release {} path {} is outside the store; leaving it on disk",
                record.id,
                record.storage_path
            );
            continue;
        };
        if path.parent() != Some(releases_dir.as_path()) {
            log::debug!(
                "release {} path {path} is not a release directory; leaving it on disk",
                record.id
            );
            continue;
        }
        let shelters_kept = protected.iter().any(|kept| kept.starts_with(&path));
        if !shelters_kept && !plan.remove_paths.contains(&path) {
            plan.remove_paths.push(path);
        }
    }
    plan
}

/// What a prune run did.
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Releases deleted from the catalog.
    pub deleted: Vec<ReleaseId>,
    /// Directories removed from disk.
    pub removed_paths: Vec<Utf8PathBuf>,
    /// Directories that could not be removed.
    pub failed_removals: Vec<(Utf8PathBuf, io::Error)>,
    /// Pointers whose target no longer exists.
    pub dangling_pointers: Vec<Pointer>,
}

/// Prune releases of `kind` beyond the newest `keep`.
///
/// Runs under the store's activation lock, in-process and on
/// `.activation.lock`, so no activation in any process moves a pointer while
/// the plan is applied. Directory removal failures are logged and reported, not
/// returned as errors.
///
/// # Errors
///
/// Returns [`RetentionError`] when the lock cannot be taken, pointers cannot
/// be read or the catalog cannot be updated. Nothing is removed from disk in that case.
pub fn prune_releases(
    store: &Store,
    catalog: &mut dyn ReleaseCatalog,
    kind: &str,
    keep: usize,
) -> Result<PruneReport, RetentionError> {
    let _lock = store.lock_activation().map_err(RetentionError::Lock)?;
    let releases = catalog.releases_newest_first(kind);
    let pins = store.resolve_pins().map_err(RetentionError::Pins)?;
    for pointer in &pins.dangling {
        log::warn!("{pointer} points at a release that no longer exists");
    }

    let plan = plan_retention(store, &releases, keep, &pins);
    let mut report = PruneReport {
        dangling_pointers: pins.dangling,
        ..PruneReport::default()
    };
    if plan.delete.is_empty() {
        log::debug!("nothing to prune for {kind}");
        return Ok(report);
    }

    catalog
        .delete_releases(&plan.delete)
        .map_err(RetentionError::Catalog)?;
    report.deleted = plan.delete;

    for path in plan.remove_paths {
        match std::fs::remove_dir_all(&path) {
            Ok(()) => report.removed_paths.push(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                log::warn!("failed to remove pruned release {path}: {err}");
                report.failed_removals.push((path, err));
            }
        }
    }

    log::info!(
        "pruned {} {kind} release(s), removed {} director(ies)",
        report.deleted.len(),
        report.removed_paths.len()
    );
    Ok(report)
}
