//! Staging pipeline: fetch or copy, verify, extract, and publish a release.
//!
//! A package is written to a hidden staged path under `packages/`, verified,
//! and renamed to its final name. It is then extracted into a hidden scratch
//! directory under `releases/` that is renamed into place only after
//! extraction succeeds, so a half-extracted tree is never visible as an
//! activable release.

use crate::config::RulegateConfig;
use crate::lifecycle::can_reuse;
use crate::package::download::{FetchAuth, FetchError, FetchOptions, PackageFetcher};
use crate::package::extraction::{ExtractOptions, ExtractionError, PackageExtractor};
use crate::package::kind::PackageKind;
use crate::package::sha256_digest::Sha256Digest;
use crate::package::verification::{VerifyError, VerifyOptions, verify_package};
use crate::release::{ArtifactType, ReleaseRecord};
use crate::store::{Store, StoreError, sanitize_version};
use crate::version::derive_version_from_url;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io;
use std::time::Duration;
use thiserror::Error;

const STAGED_PREFIX: &str = ".staged-";
const SCRATCH_PREFIX: &str = ".extract-";

/// Errors raised while staging a release.
#[derive(Debug, Error)]
pub enum StageError {
    /// No version was given and none could be derived from the URL.
    #[error("cannot determine a release version for {url}; pass one explicitly")]
    MissingVersion {
        /// Download URL.
        url: String,
    },

    /// The store layout could not be prepared or read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The package could not be downloaded.
    #[error("{}{source}", fetch_prefix(.proxy_attempted, .source))]
    Fetch {
        /// Failure of the last attempt.
        #[source]
        source: FetchError,
        /// True when a proxied attempt failed before the direct one.
        proxy_attempted: bool,
    },

    /// The package failed verification.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The package could not be extracted.
    #[error(transparent)]
    Extract(#[from] ExtractionError),

    /// The release directory is pinned and cannot be replaced.
    #[error("release {version} at {path} is in use by current or last_good")]
    ReleaseInUse {
        /// Version as supplied.
        version: String,
        /// Pinned release directory.
        path: Utf8PathBuf,
    },

    /// A local file operation failed.
    #[error("failed to {action} {path}: {source}")]
    Io {
        /// What was being done.
        action: &'static str,
        /// Path involved.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

fn fetch_prefix(proxy_attempted: &bool, source: &FetchError) -> &'static str {
    if *proxy_attempted && source.is_timeout() {
        "proxy and direct both failed: "
    } else {
        ""
    }
}

impl StageError {
    /// Operator hint for resolving the failure, if one applies.
    #[must_use]
    pub const fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Fetch {
                source,
                proxy_attempted: true,
            } if source.is_timeout() => Some("check proxy connectivity or retry later"),
            Self::Fetch { source, .. } => source.remediation(),
            Self::MissingVersion { .. } => Some("pass --release-version"),
            Self::Extract(err) if err.is_unsafe_entry() => {
                Some("the package holds unsafe entries; obtain it from a trusted source")
            }
            _ => None,
        }
    }
}

fn io_error(action: &'static str, path: &Utf8Path) -> impl FnOnce(io::Error) -> StageError + use<> {
    let path = path.to_path_buf();
    move |source| StageError::Io {
        action,
        path,
        source,
    }
}

/// Limits and network settings applied to every staged package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSettings {
    /// Hosts permitted as download sources.
    pub allowed_hosts: Vec<String>,
    /// Whole-request download timeout.
    pub fetch_timeout: Duration,
    /// Maximum package size in bytes.
    pub max_package_bytes: u64,
    /// Extraction caps.
    pub extract: ExtractOptions,
}

impl From<&RulegateConfig> for StageSettings {
    fn from(config: &RulegateConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_hosts.clone(),
            fetch_timeout: config.fetch_timeout(),
            max_package_bytes: config.max_package_bytes(),
            extract: ExtractOptions {
                max_files: config.extract_max_files(),
                max_total_bytes: config.extract_max_total_bytes(),
            },
        }
    }
}

/// A package to download.
#[derive(Debug, Clone, Default)]
pub struct RemoteSource {
    /// HTTPS download URL.
    pub url: String,
    /// Release kind.
    pub kind: String,
    /// Explicit version; derived from the URL when absent.
    pub version: Option<String>,
    /// Digest the package must match, when known.
    pub expected_sha256: Option<Sha256Digest>,
    /// Credentials for the source.
    pub auth: FetchAuth,
    /// Optional HTTPS proxy, with a direct retry when it fails.
    pub proxy: Option<String>,
}

/// A package supplied from local disk.
#[derive(Debug, Clone)]
pub struct UploadSource {
    /// Package path.
    pub path: Utf8PathBuf,
    /// Release kind.
    pub kind: String,
    /// Release version.
    pub version: String,
    /// Digest the package must match, when known.
    pub expected_sha256: Option<Sha256Digest>,
}

/// A release ready for activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRelease {
    /// Version as supplied or derived.
    pub version: String,
    /// Release kind.
    pub kind: String,
    /// How the package was obtained.
    pub artifact_type: ArtifactType,
    /// Lowercase hex SHA-256 of the package.
    pub checksum: String,
    /// Package size in bytes.
    pub size_bytes: u64,
    /// Release directory.
    pub storage_path: Utf8PathBuf,
    /// Stored package, absent for reused releases.
    pub package_path: Option<Utf8PathBuf>,
    /// True when an existing release was reused.
    pub reused: bool,
}

impl StagedRelease {
    fn reused(record: &ReleaseRecord) -> Self {
        Self {
            version: record.version.clone(),
            kind: record.kind.clone(),
            artifact_type: record.artifact_type,
            checksum: record.checksum.clone(),
            size_bytes: record.size_bytes,
            storage_path: record.storage_path.clone(),
            package_path: None,
            reused: true,
        }
    }
}

/// Removes a file on drop unless disarmed.
struct CleanupFile(Option<Utf8PathBuf>);

impl CleanupFile {
    fn new(path: &Utf8Path) -> Self {
        Self(Some(path.to_path_buf()))
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CleanupFile {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            if fs::remove_file(&path).is_ok() {
                log::debug!("removed {path}");
            }
        }
    }
}

/// Stages packages into the store.
pub struct ReleasePipeline<'a> {
    store: &'a Store,
    fetcher: &'a dyn PackageFetcher,
    extractor: &'a dyn PackageExtractor,
    settings: StageSettings,
}

impl<'a> ReleasePipeline<'a> {
    /// Create a pipeline over `store`.
    #[must_use]
    pub fn new(
        store: &'a Store,
        fetcher: &'a dyn PackageFetcher,
        extractor: &'a dyn PackageExtractor,
        settings: StageSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            extractor,
            settings,
        }
    }

    /// Download, verify, and extract a remote package, or reuse `existing`
    /// when it is still valid.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] naming the failing step. Staged files and the
    /// scratch directory are removed on failure.
    pub fn stage_remote(
        &self,
        source: &RemoteSource,
        existing: Option<&ReleaseRecord>,
    ) -> Result<StagedRelease, StageError> {
        let url = source.url.trim();
        let version = source
            .version
            .as_deref()
            .map(str::trim)
            .filter(|version| !version.is_empty())
            .map(str::to_owned)
            .or_else(|| derive_version_from_url(url))
            .ok_or_else(|| StageError::MissingVersion {
                url: url.to_owned(),
            })?;

        if let Some(record) = self.reusable(existing, source.expected_sha256.as_ref()) {
            log::info!("reusing {} release {}", record.kind, record.version);
            return Ok(StagedRelease::reused(record));
        }

        self.store.ensure_dirs()?;
        self.ensure_replaceable(&version)?;
        let staged = self.staged_path(&source.kind, &version, package_kind_of_url(url));
        let mut cleanup = CleanupFile::new(&staged);

        let options = FetchOptions {
            allowed_hosts: self.settings.allowed_hosts.clone(),
            auth: source.auth.clone(),
            timeout: self.settings.fetch_timeout,
            proxy: source.proxy.clone(),
        };
        log::debug!("fetching {url} to {staged}");
        let fetched = match self.fetcher.fetch(url, &staged, &options) {
            Ok(fetched) => fetched,
            Err(err) if options.proxy.is_some() => {
                log::warn!("proxied fetch of {url} failed ({err}); retrying direct");
                self.fetcher
                    .fetch(url, &staged, &options.without_proxy())
                    .map_err(|source| StageError::Fetch {
                        source,
                        proxy_attempted: true,
                    })?
            }
            Err(source) => {
                return Err(StageError::Fetch {
                    source,
                    proxy_attempted: false,
                });
            }
        };
        log::debug!("fetched {} bytes (status {})", fetched.size_bytes, fetched.status_code);

        let staged_release = self.publish(
            &staged,
            &source.kind,
            &version,
            source.expected_sha256.clone(),
            None,
        )?;
        cleanup.disarm();
        Ok(staged_release)
    }

    /// Verify and extract a local package, or reuse `existing` when it is
    /// still valid. The source file is copied, never moved.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] naming the failing step. Staged files and the
    /// scratch directory are removed on failure.
    pub fn stage_upload(
        &self,
        source: &UploadSource,
        existing: Option<&ReleaseRecord>,
    ) -> Result<StagedRelease, StageError> {
        let version = source.version.trim();
        if version.is_empty() {
            return Err(StageError::MissingVersion {
                url: source.path.to_string(),
            });
        }
        if let Some(record) = self.reusable(existing, source.expected_sha256.as_ref()) {
            log::info!("reusing {} release {}", record.kind, record.version);
            return Ok(StagedRelease::reused(record));
        }

        self.store.ensure_dirs()?;
        self.ensure_replaceable(version)?;
        // Unknown extensions still get staged so verification can name them.
        let staged = match PackageKind::detect(&source.path) {
            Some(kind) => self.staged_path(&source.kind, version, kind),
            None => self.store.package_path(&format!(
                "{STAGED_PREFIX}{}_{}",
                sanitize_version(&source.kind),
                source.path.file_name().unwrap_or("package")
            )),
        };
        let mut cleanup = CleanupFile::new(&staged);
        fs::copy(&source.path, &staged).map_err(io_error("copy package to", &staged))?;

        let staged_release = self.publish(
            &staged,
            &source.kind,
            version,
            source.expected_sha256.clone(),
            Some(ArtifactType::Upload),
        )?;
        cleanup.disarm();
        Ok(staged_release)
    }

    fn reusable<'r>(
        &self,
        existing: Option<&'r ReleaseRecord>,
        expected: Option<&Sha256Digest>,
    ) -> Option<&'r ReleaseRecord> {
        existing.filter(|record| can_reuse(self.store, record, expected))
    }

    fn staged_path(&self, kind: &str, version: &str, package: PackageKind) -> Utf8PathBuf {
        self.store.package_path(&format!(
            "{STAGED_PREFIX}{}_{}{}",
            sanitize_version(kind),
            sanitize_version(version),
            package.extension()
        ))
    }

    fn ensure_replaceable(&self, version: &str) -> Result<(), StageError> {
        let release_dir = self.store.release_dir(version);
        if release_dir.exists() && self.store.resolve_pins()?.contains(&release_dir) {
            return Err(StageError::ReleaseInUse {
                version: version.to_owned(),
                path: release_dir,
            });
        }
        Ok(())
    }

    fn publish(
        &self,
        staged: &Utf8Path,
        kind: &str,
        version: &str,
        expected_sha256: Option<Sha256Digest>,
        artifact_type: Option<ArtifactType>,
    ) -> Result<StagedRelease, StageError> {
        let verified = verify_package(
            staged,
            &VerifyOptions {
                allowed_extensions: Vec::new(),
                max_package_bytes: self.settings.max_package_bytes,
                expected_sha256,
            },
        )?;
        log::debug!("verified {staged} ({} bytes, sha256 {})", verified.size_bytes, verified.sha256);

        let package_path = self.store.package_path(&format!(
            "{}_{}{}",
            sanitize_version(kind),
            sanitize_version(version),
            verified.kind.extension()
        ));
        fs::rename(staged, &package_path).map_err(io_error("move package to", &package_path))?;
        let mut package_cleanup = CleanupFile::new(&package_path);

        let releases_dir = self.store.releases_dir();
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&releases_dir)
            .map_err(io_error("create scratch directory in", &releases_dir))?;
        let scratch_path = Utf8PathBuf::try_from(scratch.path().to_path_buf()).map_err(|err| {
            StageError::Io {
                action: "use scratch directory",
                path: releases_dir.clone(),
                source: err.into_io_error(),
            }
        })?;

        let summary = self.extractor.extract(
            &package_path,
            verified.kind,
            &scratch_path,
            &self.settings.extract,
        )?;
        log::debug!("extracted {} files ({} bytes)", summary.file_count, summary.total_bytes);

        let release_dir = self.store.release_dir(version);
        {
            let _lock = self.store.lock_activation()?;
            self.ensure_replaceable(version)?;
            if release_dir.exists() {
                log::debug!("replacing stale release directory {release_dir}");
                fs::remove_dir_all(&release_dir)
                    .map_err(io_error("remove stale release", &release_dir))?;
            }
            fs::rename(&scratch_path, &release_dir)
                .map_err(io_error("publish release to", &release_dir))?;
        }
        drop(scratch);
        package_cleanup.disarm();

        log::info!("staged {kind} release {version} at {release_dir}");
        Ok(StagedRelease {
            version: version.to_owned(),
            kind: kind.to_owned(),
            artifact_type: artifact_type.unwrap_or_else(|| verified.kind.into()),
            checksum: verified.sha256.into_inner(),
            size_bytes: verified.size_bytes,
            storage_path: release_dir,
            package_path: Some(package_path),
            reused: false,
        })
    }
}

/// Package kind implied by a URL path, `.tar.gz` when nothing matches.
fn package_kind_of_url(url: &str) -> PackageKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    PackageKind::detect(path).unwrap_or(PackageKind::TarGz)
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
