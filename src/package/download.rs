//! Package download over HTTPS.
//!
//! Provides a trait-based abstraction for fetching remote ruleset packages
//! so the staging pipeline can be exercised without network access. The
//! HTTP implementation enforces the scheme and host allowlist before any
//! request is made and writes the body through a temporary file that is only
//! renamed into place after a complete copy.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::io;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use ureq::http::Uri;

/// Default network timeout for a package download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Credentials attached to a download request.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum FetchAuth {
    /// No `Authorization` header.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
}

impl FetchAuth {
    /// Build credentials from an auth type name and secret.
    ///
    /// `token` (or `bearer`) uses the trimmed secret as a bearer token and
    /// ignores a blank secret. `basic` splits the secret once on `:` and
    /// ignores a secret without one. Unknown types yield [`FetchAuth::None`].
    ///
    /// # Examples
    ///
    /// ```
    /// use rulegate::package::download::FetchAuth;
    ///
    /// assert_eq!(FetchAuth::from_parts("token", "  "), FetchAuth::None);
    /// assert_eq!(
    ///     FetchAuth::from_parts("basic", "ops:s3:cret"),
    ///     FetchAuth::Basic { username: "ops".into(), password: "s3:cret".into() },
    /// );
    /// ```
    #[must_use]
    pub fn from_parts(auth_type: &str, secret: &str) -> Self {
        match auth_type.trim().to_ascii_lowercase().as_str() {
            "token" | "bearer" => {
                let token = secret.trim();
                if token.is_empty() {
                    Self::None
                } else {
                    Self::Bearer(token.to_owned())
                }
            }
            "basic" => secret
                .split_once(':')
                .map_or(Self::None, |(username, password)| Self::Basic {
                    username: username.to_owned(),
                    password: password.to_owned(),
                }),
            _ => Self::None,
        }
    }

    /// Value of the `Authorization` header, if any.
    #[must_use]
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Bearer(token) => Some(format!("Bearer {token}")),
            Self::Basic { username, password } => {
                Some(format!("Basic {}", BASE64.encode(format!("{username}:{password}"))))
            }
        }
    }
}

impl fmt::Debug for FetchAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Options controlling a single download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Hosts permitted as download sources. Empty permits any HTTPS host.
    pub allowed_hosts: Vec<String>,
    /// Credentials to send.
    pub auth: FetchAuth,
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Optional HTTPS proxy URL.
    pub proxy: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            auth: FetchAuth::None,
            timeout: DEFAULT_FETCH_TIMEOUT,
            proxy: None,
        }
    }
}

impl FetchOptions {
    /// Return a copy of these options with the proxy removed.
    #[must_use]
    pub fn without_proxy(&self) -> Self {
        Self {
            proxy: None,
            ..self.clone()
        }
    }
}

/// Outcome of a successful download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// Final location of the downloaded package.
    pub saved_path: Utf8PathBuf,
    /// Number of bytes written.
    pub size_bytes: u64,
    /// HTTP status code of the response.
    pub status_code: u16,
}

/// Errors arising from package downloads.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL could not be parsed.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// Rejected URL.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The URL does not use `https`.
    #[error("only https scheme is allowed: {url}")]
    InsecureScheme {
        /// Rejected URL.
        url: String,
    },

    /// The URL has no host component.
    #[error("url has no host: {url}")]
    MissingHost {
        /// Rejected URL.
        url: String,
    },

    /// The host is not on the allowlist.
    #[error("host not allowed: {host}")]
    HostNotAllowed {
        /// Normalised host name.
        host: String,
    },

    /// The proxy URL could not be used.
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy {
        /// Proxy URL as configured.
        proxy: String,
        /// Reason reported by the HTTP client.
        reason: String,
    },

    /// The request did not complete within the timeout.
    #[error("fetch timed out for {url}")]
    Timeout {
        /// Requested URL.
        url: String,
    },

    /// The request failed below the HTTP layer.
    #[error("fetch failed for {url}: {reason}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Client error message.
        reason: String,
    },

    /// The server answered with a non-2xx status.
    #[error("unexpected status code {status} for {url}")]
    UnexpectedStatus {
        /// Requested URL.
        url: String,
        /// Response status.
        status: u16,
    },

    /// Writing the package locally failed.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Destination or temporary path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Return true when the failure was a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Operator hint for resolving the failure, if one applies.
    #[must_use]
    pub const fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Timeout { .. } => Some("configure a proxy and retry"),
            Self::HostNotAllowed { .. } => Some("add the host to allowed_hosts"),
            Self::InsecureScheme { .. } => Some("use an https:// download URL"),
            Self::UnexpectedStatus {
                status: 401 | 403, ..
            } => Some("check the auth type and secret"),
            _ => None,
        }
    }
}

/// Trait for downloading packages, enabling test mocking.
///
/// # Examples
///
/// ```
/// use rulegate::package::download::HttpFetcher;
///
/// let fetcher = HttpFetcher;
/// // Use fetcher.fetch(url, destination, &options) in production
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait PackageFetcher {
    /// Download `url` to `destination`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] naming the cause: URL rejection, timeout,
    /// transport failure, non-2xx status, or local I/O.
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        options: &FetchOptions,
    ) -> Result<FetchResult, FetchError>;
}

/// HTTPS fetcher using `ureq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl PackageFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        options: &FetchOptions,
    ) -> Result<FetchResult, FetchError> {
        let url = url.trim();
        check_url(url, &options.allowed_hosts)?;
        let agent = http_agent(options)?;

        let mut request = agent.get(url);
        if let Some(value) = options.auth.header_value() {
            request = request.header("Authorization", value);
        }
        log::debug!("fetching {url}");
        let response = request.call().map_err(|err| map_ureq_error(url, err))?;

        let status_code = response.status().as_u16();
        if !(200..300).contains(&status_code) {
            return Err(FetchError::UnexpectedStatus {
                url: url.to_owned(),
                status: status_code,
            });
        }

        let size_bytes = write_atomically(destination, &mut response.into_body().as_reader())
            .map_err(|err| match err {
                WriteError::Body(source) if is_timeout_io(&source) => FetchError::Timeout {
                    url: url.to_owned(),
                },
                WriteError::Body(source) => FetchError::Transport {
                    url: url.to_owned(),
                    reason: source.to_string(),
                },
                WriteError::Local { path, source } => FetchError::Io { path, source },
            })?;

        log::debug!("fetched {size_bytes} bytes from {url} into {destination}");
        Ok(FetchResult {
            saved_path: destination.to_path_buf(),
            size_bytes,
            status_code,
        })
    }
}

/// Validate scheme and host before any network or filesystem activity.
fn check_url(url: &str, allowed_hosts: &[String]) -> Result<(), FetchError> {
    let uri: Uri = url.parse().map_err(|err: ureq::http::uri::InvalidUri| {
        FetchError::InvalidUrl {
            url: url.to_owned(),
            reason: err.to_string(),
        }
    })?;
    if uri.scheme_str() != Some("https") {
        return Err(FetchError::InsecureScheme {
            url: url.to_owned(),
        });
    }
    let host = uri
        .host()
        .map(|host| host.trim().to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .ok_or_else(|| FetchError::MissingHost {
            url: url.to_owned(),
        })?;
    if host_allowed(&host, allowed_hosts) {
        Ok(())
    } else {
        Err(FetchError::HostNotAllowed { host })
    }
}

/// An empty allowlist admits any host. Blank entries never match, so a
/// list of only blank entries admits nothing.
fn host_allowed(host: &str, allowed_hosts: &[String]) -> bool {
    if allowed_hosts.is_empty() {
        return true;
    }
    allowed_hosts
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .any(|entry| entry.eq_ignore_ascii_case(host))
}

/// Build an agent for one download. Timeout and proxy vary per call.
fn http_agent(options: &FetchOptions) -> Result<ureq::Agent, FetchError> {
    let proxy = options
        .proxy
        .as_deref()
        .map(str::trim)
        .filter(|proxy| !proxy.is_empty())
        .map(|proxy| {
            ureq::Proxy::new(proxy).map_err(|err| FetchError::InvalidProxy {
                proxy: proxy.to_owned(),
                reason: err.to_string(),
            })
        })
        .transpose()?;
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(options.timeout))
        .https_only(true)
        .http_status_as_error(false)
        .proxy(proxy)
        .build();
    Ok(ureq::Agent::new_with_config(config))
}

/// Map a ureq error to a [`FetchError`].
fn map_ureq_error(url: &str, err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Timeout(_) => FetchError::Timeout {
            url: url.to_owned(),
        },
        ureq::Error::StatusCode(status) => FetchError::UnexpectedStatus {
            url: url.to_owned(),
            status,
        },
        ureq::Error::Io(source) if is_timeout_io(&source) => FetchError::Timeout {
            url: url.to_owned(),
        },
        other => FetchError::Transport {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}

fn is_timeout_io(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

#[derive(Debug)]
enum WriteError {
    Body(io::Error),
    Local { path: Utf8PathBuf, source: io::Error },
}

/// Stream `body` into a temporary sibling of `destination` and rename it
/// into place. The temporary file is removed on any failure.
fn write_atomically(destination: &Utf8Path, body: &mut dyn io::Read) -> Result<u64, WriteError> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    std::fs::create_dir_all(parent).map_err(local_error(parent))?;
    let mut temp = NamedTempFile::new_in(parent).map_err(local_error(parent))?;
    let written = copy_body(body, temp.as_file_mut(), destination)?;
    temp.as_file().sync_all().map_err(local_error(destination))?;
    temp.persist(destination)
        .map_err(|err| local_error(destination)(err.error))?;
    Ok(written)
}

fn local_error(path: &Utf8Path) -> impl FnOnce(io::Error) -> WriteError + use<> {
    let path = path.to_path_buf();
    move |source| WriteError::Local { path, source }
}

/// Copy distinguishing read failures (network) from write failures (disk).
fn copy_body(
    body: &mut dyn io::Read,
    file: &mut std::fs::File,
    destination: &Utf8Path,
) -> Result<u64, WriteError> {
    use std::io::Write;

    let mut buffer = [0_u8; 64 * 1024];
    let mut written = 0_u64;
    loop {
        let chunk = match body.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => buffer.get(..read).unwrap_or_default(),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(WriteError::Body(err)),
        };
        file.write_all(chunk).map_err(local_error(destination))?;
        written += chunk.len() as u64;
    }
    Ok(written)
}
