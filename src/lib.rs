//! Release acquisition and atomic activation for reverse-proxy WAF rulesets.
//!
//! `rulegate` downloads ruleset packages (for example a CRS rule corpus or a
//! Coraza engine module) from untrusted HTTPS sources, verifies and extracts
//! them into isolated per-version directories, and cuts the live proxy
//! configuration over to a new version with automatic rollback. It is used by
//! the `rulegate` CLI binary and can be embedded by an administrative API.
//!
//! # Modules
//!
//! - [`activation`] - Atomic pointer cutover with adapt/load and rollback
//! - [`caddy`] - Caddy admin API implementation of the config loader
//! - [`catalog`] - JSON-backed release and job records
//! - [`cli`] - Command-line argument definitions
//! - [`config`] - TOML configuration with defaults
//! - [`error`] - CLI-level error aggregation and exit codes
//! - [`lifecycle`] - Release reuse and retention pruning
//! - [`output`] - Operator-facing progress output
//! - [`package`] - Package download, verification, and extraction
//! - [`pipeline`] - Fetch, verify, and extract orchestration
//! - [`release`] - Release record types
//! - [`store`] - On-disk layout and the `current`/`last_good` pointers
//! - [`version`] - Release version derivation from download URLs

pub mod activation;
pub mod caddy;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod output;
pub mod package;
pub mod pipeline;
pub mod release;
pub mod store;
pub mod version;

mod paths;

#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
