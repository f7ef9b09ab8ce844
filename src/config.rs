//! Operator configuration loaded from `rulegate.toml`.
//!
//! Every field is optional. Omitted fields, and numeric fields set to zero,
//! fall back to the defaults below so a templated file with blank values
//! behaves like an absent one.
//!
//! ```toml
//! base_dir = "/config/caddy/waf"
//! allowed_hosts = ["github.com", "codeload.github.com"]
//! fetch_timeout_secs = 180
//! retention_count = 20
//!
//! [caddy]
//! admin_url = "http://127.0.0.1:2019"
//! timeout_secs = 8
//! max_attempts = 2
//! ```

use crate::lifecycle::DEFAULT_RETENTION_COUNT;
use crate::package::extraction::{DEFAULT_EXTRACT_MAX_FILES, DEFAULT_EXTRACT_MAX_TOTAL_BYTES};
use crate::package::verification::DEFAULT_MAX_PACKAGE_BYTES;
use crate::store::DEFAULT_BASE_DIR;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// File name of the configuration inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "rulegate.toml";

const CATALOG_FILE_NAME: &str = "catalog.json";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Configuration path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Configuration path.
        path: Utf8PathBuf,
        /// Parser error.
        #[source]
        source: Box<toml::de::Error>,
    },
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RulegateConfig {
    /// Store base directory.
    pub base_dir: Option<Utf8PathBuf>,
    /// Release catalog file. Defaults to `<base_dir>/catalog.json`.
    pub catalog_path: Option<Utf8PathBuf>,
    /// Hosts permitted as download sources. Empty permits any HTTPS host.
    pub allowed_hosts: Vec<String>,
    /// Whole-request download timeout in seconds.
    pub fetch_timeout_secs: u64,
    /// Maximum package size in bytes.
    pub max_package_bytes: u64,
    /// Maximum number of files extracted from one package.
    pub extract_max_files: u64,
    /// Maximum number of bytes extracted from one package.
    pub extract_max_total_bytes: u64,
    /// Number of newest releases retained per kind.
    pub retention_count: usize,
    /// Caddy admin API settings.
    pub caddy: CaddySettings,
}

impl RulegateConfig {
    const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 180;

    /// Load configuration from `path`.
    ///
    /// With an explicit path the file must exist. Without one, the platform
    /// default location is tried and a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::load_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Load and parse the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&source).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// Store base directory.
    #[must_use]
    pub fn base_dir(&self) -> Utf8PathBuf {
        non_blank_path(self.base_dir.as_deref())
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_BASE_DIR))
    }

    /// Release catalog path.
    #[must_use]
    pub fn catalog_path(&self) -> Utf8PathBuf {
        non_blank_path(self.catalog_path.as_deref())
            .unwrap_or_else(|| self.base_dir().join(CATALOG_FILE_NAME))
    }

    /// Download timeout.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(or_default(
            self.fetch_timeout_secs,
            Self::DEFAULT_FETCH_TIMEOUT_SECS,
        ))
    }

    /// Maximum package size in bytes.
    #[must_use]
    pub fn max_package_bytes(&self) -> u64 {
        or_default(self.max_package_bytes, DEFAULT_MAX_PACKAGE_BYTES)
    }

    /// Maximum number of extracted files.
    #[must_use]
    pub fn extract_max_files(&self) -> u64 {
        or_default(self.extract_max_files, DEFAULT_EXTRACT_MAX_FILES)
    }

    /// Maximum number of extracted bytes.
    #[must_use]
    pub fn extract_max_total_bytes(&self) -> u64 {
        or_default(self.extract_max_total_bytes, DEFAULT_EXTRACT_MAX_TOTAL_BYTES)
    }

    /// Number of newest releases retained per kind.
    #[must_use]
    pub fn retention_count(&self) -> usize {
        if self.retention_count == 0 {
            DEFAULT_RETENTION_COUNT
        } else {
            self.retention_count
        }
    }
}

/// Settings for the Caddy admin API loader.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CaddySettings {
    /// Admin API base URL.
    pub admin_url: Option<String>,
    /// Bearer token sent to the admin API.
    pub token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Attempts per request when the transport fails.
    pub max_attempts: u32,
}

impl CaddySettings {
    /// Default admin API base URL.
    pub const DEFAULT_ADMIN_URL: &'static str = "http://127.0.0.1:2019";
    const DEFAULT_TIMEOUT_SECS: u64 = 8;
    const DEFAULT_MAX_ATTEMPTS: u32 = 2;

    /// Admin API base URL without a trailing slash.
    #[must_use]
    pub fn admin_url(&self) -> &str {
        self.admin_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(Self::DEFAULT_ADMIN_URL)
            .trim_end_matches('/')
    }

    /// Bearer token, ignoring blank values.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(or_default(self.timeout_secs, Self::DEFAULT_TIMEOUT_SECS))
    }

    /// Attempts per request.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            Self::DEFAULT_MAX_ATTEMPTS
        } else {
            self.max_attempts
        }
    }
}

/// Return the platform default configuration path, if one can be resolved.
#[must_use]
pub fn default_config_path() -> Option<Utf8PathBuf> {
    directories_next::BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::try_from(dirs.config_dir().to_path_buf()).ok())
        .map(|dir| dir.join(CONFIG_FILE_NAME))
}

const fn or_default(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}

fn non_blank_path(path: Option<&Utf8Path>) -> Option<Utf8PathBuf> {
    path.map(|path| path.as_str().trim())
        .filter(|path| !path.is_empty())
        .map(Utf8PathBuf::from)
}
