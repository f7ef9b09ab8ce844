//! Package archive formats recognised by verification and extraction.

use std::fmt;
use std::path::Path;

/// Archive format of a ruleset package, detected from its file name.
///
/// # Examples
///
/// ```
/// use rulegate::package::kind::PackageKind;
///
/// assert_eq!(PackageKind::detect("crs-v4.2.0.TAR.GZ"), Some(PackageKind::TarGz));
/// assert_eq!(PackageKind::detect("coraza.zip"), Some(PackageKind::Zip));
/// assert_eq!(PackageKind::detect("rules.tar.zst"), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
    /// Gzip-compressed tar archive (`.tar.gz`).
    TarGz,
    /// Zip archive (`.zip`).
    Zip,
}

impl PackageKind {
    /// Every recognised kind.
    pub const ALL: [Self; 2] = [Self::TarGz, Self::Zip];

    /// File extension including the leading dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::TarGz => ".tar.gz",
            Self::Zip => ".zip",
        }
    }

    /// Detect the kind from the final component of `path`, ignoring case.
    #[must_use]
    pub fn detect(path: impl AsRef<Path>) -> Option<Self> {
        let file_name = path.as_ref().file_name()?.to_string_lossy().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| file_name.ends_with(kind.extension()))
    }

    /// Parse a normalised extension such as `.zip`.
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.extension() == extension)
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
