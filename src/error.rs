//! Error type for the `rulegate` CLI.
//!
//! Component errors are wrapped unchanged so their source chains survive.
//! Exit codes and remediation hints are derived from the typed variants.

use crate::activation::ActivationError;
use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::lifecycle::RetentionError;
use crate::package::sha256_digest::DigestError;
use crate::pipeline::StageError;
use crate::store::StoreError;
use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store could not be read or prepared.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The release catalog could not be read or written.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Staging a release failed.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Activating a release failed.
    #[error(transparent)]
    Activation(#[from] ActivationError),

    /// Pruning releases failed.
    #[error(transparent)]
    Retention(#[from] RetentionError),

    /// The `--sha256` value is not a SHA-256 digest.
    #[error("invalid --sha256 value: {source}")]
    InvalidChecksum {
        /// Parser error.
        #[source]
        source: DigestError,
    },

    /// The requested release is not in the catalog.
    #[error("no {kind} release {version} in the catalog")]
    UnknownRelease {
        /// Release kind.
        kind: String,
        /// Requested version.
        version: String,
    },

    /// A config file named on the command line could not be read.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The applied config could not be saved for the next activation.
    #[error("failed to save live config to {path}: {source}")]
    SaveLiveConfig {
        /// Destination path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing command output failed.
    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

impl CliError {
    /// Process exit code for this failure.
    ///
    /// | Code | Meaning                                     |
    /// |------|---------------------------------------------|
    /// | 2    | invalid input or configuration              |
    /// | 3    | download failed                             |
    /// | 4    | package rejected by verification/extraction |
    /// | 5    | activation rejected and rolled back         |
    /// | 6    | rollback failed; live state may be inconsistent |
    /// | 1    | anything else                               |
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_)
            | Self::InvalidChecksum { .. }
            | Self::UnknownRelease { .. }
            | Self::ReadFile { .. }
            | Self::Stage(StageError::MissingVersion { .. } | StageError::ReleaseInUse { .. }) => 2,
            Self::Stage(StageError::Fetch { .. }) => 3,
            Self::Stage(StageError::Verify(_) | StageError::Extract(_)) => 4,
            Self::Activation(err) if err.may_be_inconsistent() => 6,
            Self::Activation(ActivationError::Rejected { .. }) => 5,
            _ => 1,
        }
    }

    /// Operator hint for resolving the failure, if one applies.
    #[must_use]
    pub const fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Stage(err) => err.remediation(),
            Self::Activation(err) if err.may_be_inconsistent() => {
                Some("inspect the live configuration and re-run activate")
            }
            Self::Activation(ActivationError::ReleaseNotFound { .. })
            | Self::UnknownRelease { .. } => Some("stage the release with fetch or upload first"),
            _ => None,
        }
    }
}

/// Result alias using [`CliError`].
pub type Result<T> = std::result::Result<T, CliError>;
