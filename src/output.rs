//! Operator-facing output for the `rulegate` CLI.
//!
//! Progress lines go to an injected writer so tests can capture them; the
//! binary passes stderr.

use crate::lifecycle::PruneReport;
use crate::pipeline::StagedRelease;
use crate::store::Pointer;
use camino::Utf8Path;
use std::fmt::Display;
use std::io::Write;

/// Write `message` and a newline, ignoring write failures.
pub fn write_stderr_line(stderr: &mut dyn Write, message: impl Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort progress output.
    }
}

/// Summarise a staged or reused release.
///
/// # Example
///
/// ```
/// use camino::Utf8PathBuf;
/// use rulegate::output::staged_message;
/// use rulegate::pipeline::StagedRelease;
/// use rulegate::release::ArtifactType;
///
/// let staged = StagedRelease {
///     version: "v4.7.0".to_owned(),
///     kind: "crs".to_owned(),
///     artifact_type: ArtifactType::TarGz,
///     checksum: "ab".repeat(32),
///     size_bytes: 2048,
///     storage_path: Utf8PathBuf::from("/config/caddy/waf/releases/v4.7.0"),
///     package_path: None,
///     reused: true,
/// };
///
/// assert!(staged_message(&staged).starts_with("Reused crs release v4.7.0"));
/// ```
#[must_use]
pub fn staged_message(staged: &StagedRelease) -> String {
    let verb = if staged.reused { "Reused" } else { "Staged" };
    format!(
        "{verb} {} release {} at {} ({}, {} bytes, sha256 {})",
        staged.kind,
        staged.version,
        staged.storage_path,
        staged.artifact_type,
        staged.size_bytes,
        staged.checksum
    )
}

/// Summarise a prune run, one line per notable item.
#[must_use]
pub fn prune_lines(kind: &str, report: &PruneReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Pruned {} {kind} release(s); removed {} director(ies)",
        report.deleted.len(),
        report.removed_paths.len()
    )];
    lines.extend(
        report
            .failed_removals
            .iter()
            .map(|(path, err)| format!("  could not remove {path}: {err}")),
    );
    lines.extend(
        report
            .dangling_pointers
            .iter()
            .map(|pointer| format!("  warning: {pointer} points at a missing release")),
    );
    lines
}

/// Format one pointer for `rulegate status`.
#[must_use]
pub fn pointer_line(pointer: Pointer, target: Option<&Utf8Path>) -> String {
    match target {
        Some(target) if target.exists() => format!("{pointer}: {target}"),
        Some(target) => format!("{pointer}: {target} (missing)"),
        None => format!("{pointer}: (unset)"),
    }
}
