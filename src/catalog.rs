//! JSON-backed catalog of release and update-job records.
//!
//! The catalog is a single JSON document rewritten atomically on every
//! change. It records which releases exist, which one is active per kind,
//! and the jobs run against them.

use crate::release::{
    JobRecord, NewRelease, ReleaseId, ReleaseRecord, ReleaseStatus, unix_now,
};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors raised by catalog persistence.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog file exists but could not be read.
    #[error("failed to read catalog {path}: {source}")]
    Read {
        /// Catalog path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The catalog file is not valid JSON for this schema.
    #[error("catalog {path} is corrupt: {source}")]
    Corrupt {
        /// Catalog path.
        path: Utf8PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// The catalog could not be written.
    #[error("failed to write catalog {path}: {source}")]
    Write {
        /// Catalog path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// No release has the given identifier.
    #[error("release {0} is not in the catalog")]
    UnknownRelease(ReleaseId),
}

/// Read and delete access to release records, as needed by retention.
pub trait ReleaseCatalog {
    /// Releases of `kind`, newest first (creation time, then identifier).
    fn releases_newest_first(&self, kind: &str) -> Vec<ReleaseRecord>;

    /// Delete the given releases and every job referencing them.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the change cannot be persisted.
    fn delete_releases(&mut self, ids: &[ReleaseId]) -> Result<(), CatalogError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct CatalogState {
    next_id: u64,
    releases: Vec<ReleaseRecord>,
    jobs: Vec<JobRecord>,
}

/// Release catalog stored in a JSON file.
#[derive(Debug)]
pub struct JsonCatalog {
    path: Utf8PathBuf,
    state: CatalogState,
}

impl JsonCatalog {
    /// Open the catalog at `path`. A missing file yields an empty catalog;
    /// nothing is written until the first change.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Read`] or [`CatalogError::Corrupt`] when an
    /// existing file cannot be used.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| CatalogError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => CatalogState::default(),
            Err(source) => return Err(CatalogError::Read { path, source }),
        };
        Ok(Self { path, state })
    }

    /// Return the catalog file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Return every release record.
    #[must_use]
    pub fn releases(&self) -> &[ReleaseRecord] {
        &self.state.releases
    }

    /// Return every job record.
    #[must_use]
    pub fn jobs(&self) -> &[JobRecord] {
        &self.state.jobs
    }

    /// Find the release for `(kind, version)`.
    #[must_use]
    pub fn find(&self, kind: &str, version: &str) -> Option<&ReleaseRecord> {
        self.state
            .releases
            .iter()
            .find(|record| record.kind == kind && record.version == version)
    }

    /// Return the active release of `kind`, if any.
    #[must_use]
    pub fn active(&self, kind: &str) -> Option<&ReleaseRecord> {
        self.state
            .releases
            .iter()
            .find(|record| record.kind == kind && record.status == ReleaseStatus::Active)
    }

    /// Record a release, updating the existing record for the same
    /// `(kind, version)` in place.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Write`] when the change cannot be persisted.
    pub fn upsert(&mut self, release: NewRelease) -> Result<ReleaseRecord, CatalogError> {
        let existing = self
            .state
            .releases
            .iter_mut()
            .find(|record| record.kind == release.kind && record.version == release.version);
        let record = if let Some(record) = existing {
            record.artifact_type = release.artifact_type;
            record.checksum = release.checksum;
            record.size_bytes = release.size_bytes;
            record.storage_path = release.storage_path;
            record.status = release.status;
            record.clone()
        } else {
            self.state.next_id += 1;
            let record = ReleaseRecord {
                id: ReleaseId(self.state.next_id),
                kind: release.kind,
                version: release.version,
                artifact_type: release.artifact_type,
                checksum: release.checksum,
                size_bytes: release.size_bytes,
                storage_path: release.storage_path,
                status: release.status,
                created_at_unix: unix_now(),
            };
            self.state.releases.push(record.clone());
            record
        };
        self.save()?;
        Ok(record)
    }

    /// Mark `id` active and demote other active releases of its kind to
    /// rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownRelease`] for an unknown identifier or
    /// [`CatalogError::Write`] when the change cannot be persisted.
    pub fn mark_active(&mut self, id: ReleaseId) -> Result<(), CatalogError> {
        let kind = self.get(id)?.kind.clone();
        for record in &mut self.state.releases {
            if record.id == id {
                record.status = ReleaseStatus::Active;
            } else if record.kind == kind && record.status == ReleaseStatus::Active {
                record.status = ReleaseStatus::RolledBack;
            }
        }
        self.save()
    }

    /// Mark `id` failed.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownRelease`] for an unknown identifier or
    /// [`CatalogError::Write`] when the change cannot be persisted.
    pub fn mark_failed(&mut self, id: ReleaseId) -> Result<(), CatalogError> {
        self.get(id)?;
        for record in &mut self.state.releases {
            if record.id == id {
                record.status = ReleaseStatus::Failed;
            }
        }
        self.save()
    }

    /// Append a job record.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Write`] when the change cannot be persisted.
    pub fn record_job(&mut self, job: JobRecord) -> Result<(), CatalogError> {
        self.state.jobs.push(job);
        self.save()
    }

    fn get(&self, id: ReleaseId) -> Result<&ReleaseRecord, CatalogError> {
        self.state
            .releases
            .iter()
            .find(|record| record.id == id)
            .ok_or(CatalogError::UnknownRelease(id))
    }

    fn save(&self) -> Result<(), CatalogError> {
        let write_error = |source| CatalogError::Write {
            path: self.path.clone(),
            source,
        };
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        std::fs::create_dir_all(parent).map_err(write_error)?;

        let json = serde_json::to_vec_pretty(&self.state).map_err(|err| write_error(err.into()))?;
        let mut temp = NamedTempFile::new_in(parent).map_err(write_error)?;
        temp.write_all(&json).map_err(write_error)?;
        temp.as_file().sync_all().map_err(write_error)?;
        temp.persist(&self.path).map_err(|err| write_error(err.error))?;
        Ok(())
    }
}

impl ReleaseCatalog for JsonCatalog {
    fn releases_newest_first(&self, kind: &str) -> Vec<ReleaseRecord> {
        let mut releases: Vec<_> = self
            .state
            .releases
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect();
        releases.sort_by(|a, b| {
            b.created_at_unix
                .cmp(&a.created_at_unix)
                .then(b.id.cmp(&a.id))
        });
        releases
    }

    fn delete_releases(&mut self, ids: &[ReleaseId]) -> Result<(), CatalogError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.state.jobs.retain(|job| !ids.contains(&job.release_id));
        self.state.releases.retain(|record| !ids.contains(&record.id));
        self.save()
    }
}
