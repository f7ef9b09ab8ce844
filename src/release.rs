//! Release and update-job records shared by the catalog and lifecycle.

use crate::package::kind::PackageKind;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Release kind used when none is given, the WAF rule corpus.
pub const DEFAULT_KIND: &str = "crs";

/// Catalog identifier of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(pub u64);

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// Package fetched but not yet verified.
    Downloaded,
    /// Package verified and extracted.
    Verified,
    /// Release currently live for its kind.
    Active,
    /// Activation or staging failed.
    Failed,
    /// Previously active release replaced by a newer activation.
    RolledBack,
}

impl ReleaseStatus {
    /// Return true when the release may be reused without a new download.
    #[must_use]
    pub const fn is_reusable(self) -> bool {
        matches!(self, Self::Verified | Self::Active)
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Downloaded => "downloaded",
            Self::Verified => "verified",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        })
    }
}

/// How a release package was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactType {
    /// Downloaded `.tar.gz` package.
    #[serde(rename = "tar.gz")]
    TarGz,
    /// Downloaded `.zip` package.
    #[serde(rename = "zip")]
    Zip,
    /// Package supplied directly by an operator.
    #[serde(rename = "upload")]
    Upload,
}

impl ArtifactType {
    /// Map a package extension such as `.tar.gz` to an artifact type.
    ///
    /// # Examples
    ///
    /// ```
    /// use rulegate::release::ArtifactType;
    ///
    /// assert_eq!(ArtifactType::from_extension(".TAR.GZ"), ArtifactType::TarGz);
    /// assert_eq!(ArtifactType::from_extension(".rar"), ArtifactType::Upload);
    /// ```
    #[must_use]
    pub fn from_extension(extension: &str) -> Self {
        match extension.trim().to_ascii_lowercase().as_str() {
            ".tar.gz" => Self::TarGz,
            ".zip" => Self::Zip,
            _ => Self::Upload,
        }
    }
}

impl From<PackageKind> for ArtifactType {
    fn from(kind: PackageKind) -> Self {
        Self::from_extension(kind.extension())
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TarGz => "tar.gz",
            Self::Zip => "zip",
            Self::Upload => "upload",
        })
    }
}

/// A release as recorded by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    /// Catalog identifier.
    pub id: ReleaseId,
    /// Release kind, such as `crs`.
    pub kind: String,
    /// Version as supplied, before sanitising.
    pub version: String,
    /// How the package was obtained.
    pub artifact_type: ArtifactType,
    /// Lowercase hex SHA-256 of the package.
    pub checksum: String,
    /// Package size in bytes.
    pub size_bytes: u64,
    /// Absolute release directory inside the store.
    pub storage_path: Utf8PathBuf,
    /// Lifecycle status.
    pub status: ReleaseStatus,
    /// Creation time, seconds since the Unix epoch.
    pub created_at_unix: u64,
}

/// Attributes of a release about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRelease {
    /// Release kind.
    pub kind: String,
    /// Version as supplied.
    pub version: String,
    /// How the package was obtained.
    pub artifact_type: ArtifactType,
    /// Lowercase hex SHA-256 of the package.
    pub checksum: String,
    /// Package size in bytes.
    pub size_bytes: u64,
    /// Absolute release directory inside the store.
    pub storage_path: Utf8PathBuf,
    /// Initial status.
    pub status: ReleaseStatus,
}

/// Action performed by an update job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Remote package staged.
    Download,
    /// Local package staged.
    Upload,
    /// Release activated.
    Activate,
    /// Activation rolled back.
    Rollback,
}

/// Outcome of an update job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The action completed.
    Success,
    /// The action failed.
    Failed,
}

/// Audit record of one action on a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Release the job refers to.
    pub release_id: ReleaseId,
    /// Action performed.
    pub action: JobAction,
    /// Outcome.
    pub status: JobStatus,
    /// Operator-facing detail, empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Completion time, seconds since the Unix epoch.
    pub finished_at_unix: u64,
}

/// Current time in seconds since the Unix epoch, or zero if the clock is
/// set before it.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
