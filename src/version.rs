//! Release version derivation from download URLs.

use crate::package::kind::PackageKind;
use crate::store::sanitize_version;
use regex::Regex;
use std::sync::LazyLock;
use ureq::http::Uri;

static SEMVER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"v\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.\-]+)?").ok());

const TAG_MARKERS: [&str; 2] = ["/refs/tags/", "/releases/download/"];

/// Derive a release version from a package download URL.
///
/// The tag in `/refs/tags/<tag>` or `/releases/download/<tag>/` wins, then
/// the file name without its package extension. An embedded `vX.Y.Z` semver
/// is preferred over the surrounding text. Returns `None` when nothing usable
/// remains.
///
/// # Examples
///
/// ```
/// use rulegate::version::derive_version_from_url;
///
/// assert_eq!(
///     derive_version_from_url(
///         "https://github.com/coreruleset/coreruleset/archive/refs/tags/v4.7.0.tar.gz"
///     ),
///     Some("v4.7.0".to_owned())
/// );
/// assert_eq!(derive_version_from_url("https://example.com/"), None);
/// ```
#[must_use]
pub fn derive_version_from_url(url: &str) -> Option<String> {
    let uri: Uri = url.trim().parse().ok()?;
    let path = uri.path();

    let candidate = tag_segment(path).or_else(|| path.rsplit('/').find(|part| !part.is_empty()))?;
    let candidate = strip_package_extension(candidate);
    let candidate = SEMVER
        .as_ref()
        .and_then(|semver| semver.find(candidate))
        .map_or(candidate, |found| found.as_str());

    if candidate.trim().is_empty() {
        return None;
    }
    Some(sanitize_version(candidate))
}

fn tag_segment(path: &str) -> Option<&str> {
    TAG_MARKERS.iter().find_map(|marker| {
        let (_, rest) = path.split_once(marker)?;
        rest.split('/').next().filter(|tag| !tag.is_empty())
    })
}

fn strip_package_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    PackageKind::ALL
        .iter()
        .map(|kind| kind.extension())
        .find(|extension| lower.ends_with(extension))
        .and_then(|extension| name.get(..name.len() - extension.len()))
        .unwrap_or(name)
}
