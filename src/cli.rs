//! CLI argument definitions for `rulegate`.
//!
//! Kept apart from the binary so argument parsing can be tested without
//! touching the network or the store.

use crate::package::download::FetchAuth;
use crate::release::DEFAULT_KIND;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Stage and activate WAF ruleset releases.
#[derive(Parser, Debug)]
#[command(name = "rulegate")]
#[command(version, about)]
#[command(long_about = concat!(
    "Stage and activate WAF ruleset releases.\n\n",
    "Packages are downloaded over HTTPS or supplied locally, verified, and ",
    "extracted into per-version directories. Activation moves the `current` ",
    "pointer, pushes the config through the Caddy admin API, and rolls back ",
    "automatically when the config is rejected.",
))]
#[command(after_help = concat!(
    "EXAMPLES:\n",
    "  Stage a CRS release:\n",
    "    $ rulegate fetch https://github.com/coreruleset/coreruleset/archive/refs/tags/v4.7.0.tar.gz\n\n",
    "  Activate it:\n",
    "    $ rulegate activate v4.7.0 --config-file /etc/caddy/Caddyfile\n\n",
    "  Keep the newest five releases:\n",
    "    $ rulegate prune --keep 5",
))]
pub struct Cli {
    /// Configuration file [default: platform config dir/rulegate.toml].
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<Utf8PathBuf>,

    /// Suppress progress output (errors still shown).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download and stage a release, reusing a valid existing one.
    Fetch(FetchArgs),

    /// Stage a release from a local package.
    Upload(UploadArgs),

    /// Activate a staged release.
    Activate(ActivateArgs),

    /// Delete old releases beyond the retention count.
    Prune(PruneArgs),

    /// Show the `current` and `last_good` targets.
    Status,
}

/// Credential scheme for a download source.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Bearer token.
    Token,
    /// `user:password` basic authentication.
    Basic,
}

/// Arguments for `rulegate fetch`.
#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// HTTPS package URL.
    pub url: String,

    /// Release kind.
    #[arg(long, default_value = DEFAULT_KIND)]
    pub kind: String,

    /// Release version [default: derived from the URL].
    #[arg(long, value_name = "VERSION")]
    pub release_version: Option<String>,

    /// Expected SHA-256 of the package.
    #[arg(long, value_name = "HEX")]
    pub sha256: Option<String>,

    /// Credential scheme for the source.
    #[arg(long, value_enum, requires = "auth_secret")]
    pub auth_type: Option<AuthType>,

    /// Token, or `user:password` for basic auth.
    #[arg(long, value_name = "SECRET", requires = "auth_type")]
    pub auth_secret: Option<String>,

    /// HTTPS proxy, retried direct on failure.
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,
}

impl FetchArgs {
    /// Credentials described by `--auth-type` and `--auth-secret`.
    #[must_use]
    pub fn auth(&self) -> FetchAuth {
        match (self.auth_type, self.auth_secret.as_deref()) {
            (Some(AuthType::Token), Some(secret)) => FetchAuth::from_parts("token", secret),
            (Some(AuthType::Basic), Some(secret)) => FetchAuth::from_parts("basic", secret),
            _ => FetchAuth::None,
        }
    }
}

/// Arguments for `rulegate upload`.
#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    /// Local `.tar.gz` or `.zip` package.
    pub path: Utf8PathBuf,

    /// Release version.
    #[arg(long, value_name = "VERSION")]
    pub release_version: String,

    /// Release kind.
    #[arg(long, default_value = DEFAULT_KIND)]
    pub kind: String,

    /// Expected SHA-256 of the package.
    #[arg(long, value_name = "HEX")]
    pub sha256: Option<String>,
}

/// Arguments for `rulegate activate`.
#[derive(Args, Debug, Clone)]
pub struct ActivateArgs {
    /// Staged release version.
    pub version: String,

    /// Caddyfile to apply.
    #[arg(long, value_name = "FILE")]
    pub config_file: Utf8PathBuf,

    /// Caddyfile to restore on rollback [default: the last applied config].
    #[arg(long, value_name = "FILE")]
    pub previous_config_file: Option<Utf8PathBuf>,

    /// Release kind.
    #[arg(long, default_value = DEFAULT_KIND)]
    pub kind: String,
}

/// Arguments for `rulegate prune`.
#[derive(Args, Debug, Clone)]
pub struct PruneArgs {
    /// Release kind.
    #[arg(long, default_value = DEFAULT_KIND)]
    pub kind: String,

    /// Releases to keep [default: retention_count from config].
    #[arg(long, value_name = "N")]
    pub keep: Option<usize>,
}
