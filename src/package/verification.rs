//! Package integrity checks run before extraction.
//!
//! Verification is side-effect free: it checks the extension against an
//! allowlist, rejects oversize packages before hashing, always computes the
//! whole-file SHA-256, and compares it to an expected digest when one is
//! known.

use super::kind::PackageKind;
use super::sha256_digest::{Sha256Digest, compute_sha256};
use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use thiserror::Error;

/// Default upper bound on package size (100 MiB).
pub const DEFAULT_MAX_PACKAGE_BYTES: u64 = 100 * 1024 * 1024;

/// Options controlling package verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Permitted extensions such as `.tar.gz` or `zip`. Empty permits every
    /// recognised kind.
    pub allowed_extensions: Vec<String>,
    /// Maximum package size in bytes. Zero selects
    /// [`DEFAULT_MAX_PACKAGE_BYTES`].
    pub max_package_bytes: u64,
    /// Digest the package must match, when known.
    pub expected_sha256: Option<Sha256Digest>,
}

impl VerifyOptions {
    fn allowed_kinds(&self) -> Vec<PackageKind> {
        let mut kinds = Vec::new();
        for extension in &self.allowed_extensions {
            let normalized = extension.trim().to_ascii_lowercase();
            if normalized.is_empty() {
                continue;
            }
            let normalized = if normalized.starts_with('.') {
                normalized
            } else {
                format!(".{normalized}")
            };
            if let Some(kind) = PackageKind::from_extension(&normalized) {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
        }
        if kinds.is_empty() && self.allowed_extensions.iter().all(|e| e.trim().is_empty()) {
            kinds.extend(PackageKind::ALL);
        }
        kinds
    }

    fn max_package_bytes(&self) -> u64 {
        if self.max_package_bytes == 0 {
            DEFAULT_MAX_PACKAGE_BYTES
        } else {
            self.max_package_bytes
        }
    }
}

/// Facts established about a verified package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPackage {
    /// Package size in bytes.
    pub size_bytes: u64,
    /// Whole-file SHA-256 digest.
    pub sha256: Sha256Digest,
    /// Archive format detected from the file name.
    pub kind: PackageKind,
}

/// Errors raised while verifying a package.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The file name does not carry a permitted extension.
    #[error("unsupported package extension: {file_name}")]
    UnsupportedExtension {
        /// Final path component of the package.
        file_name: String,
    },

    /// The package metadata could not be read.
    #[error("failed to stat package {path}: {source}")]
    Stat {
        /// Package path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The package exceeds the size limit.
    #[error("package too large: {size_bytes} > {max_bytes}")]
    TooLarge {
        /// Actual size in bytes.
        size_bytes: u64,
        /// Configured limit in bytes.
        max_bytes: u64,
    },

    /// Hashing the package failed.
    #[error("failed to hash package {path}: {source}")]
    Hash {
        /// Package path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The computed digest differs from the expected one.
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected digest.
        expected: Sha256Digest,
        /// Computed digest.
        actual: Sha256Digest,
    },
}

/// Verify the package at `path`.
///
/// # Errors
///
/// Returns [`VerifyError`] when the extension is not permitted, the file is
/// missing or too large, hashing fails, or the digest does not match.
pub fn verify_package(path: &Utf8Path, options: &VerifyOptions) -> Result<VerifiedPackage, VerifyError> {
    let unsupported = || VerifyError::UnsupportedExtension {
        file_name: path.file_name().unwrap_or(path.as_str()).to_owned(),
    };
    let kind = PackageKind::detect(path).ok_or_else(unsupported)?;
    if !options.allowed_kinds().contains(&kind) {
        return Err(unsupported());
    }

    let metadata = std::fs::metadata(path).map_err(|source| VerifyError::Stat {
        path: path.to_path_buf(),
        source,
    })?;
    let size_bytes = metadata.len();
    let max_bytes = options.max_package_bytes();
    if size_bytes > max_bytes {
        return Err(VerifyError::TooLarge {
            size_bytes,
            max_bytes,
        });
    }

    let sha256 = compute_sha256(path.as_std_path()).map_err(|source| VerifyError::Hash {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(expected) = &options.expected_sha256 {
        if *expected != sha256 {
            return Err(VerifyError::ChecksumMismatch {
                expected: expected.clone(),
                actual: sha256,
            });
        }
    }

    log::debug!("verified {path}: {size_bytes} bytes, sha256 {sha256}");
    Ok(VerifiedPackage {
        size_bytes,
        sha256,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn package(contents: &[u8], name: &str) -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = Utf8PathBuf::try_from(temp.path().join(name)).expect("UTF-8 path");
        std::fs::write(&path, contents).expect("write package");
        (temp, path)
    }

    fn digest_of(contents: &[u8]) -> Sha256Digest {
        let (_temp, path) = package(contents, "sample.zip");
        compute_sha256(path.as_std_path()).expect("hash")
    }

    #[test]
    fn verifies_matching_package() {
        let (_temp, path) = package(b"ruleset", "crs.tar.gz");
        let expected = digest_of(b"ruleset");
        let options = VerifyOptions {
            expected_sha256: Some(Sha256Digest::parse(&expected.as_str().to_uppercase()).expect("digest")),
            ..VerifyOptions::default()
        };

        let verified = verify_package(&path, &options).expect("verify");

        assert_eq!(verified.kind, PackageKind::TarGz);
        assert_eq!(verified.size_bytes, 7);
        assert_eq!(verified.sha256, expected);
    }

    #[test]
    fn verification_is_repeatable() {
        let (_temp, path) = package(b"ruleset", "crs.zip");
        let first = verify_package(&path, &VerifyOptions::default()).expect("first");
        let second = verify_package(&path, &VerifyOptions::default()).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let (_temp, path) = package(b"tampered", "crs.zip");
        let options = VerifyOptions {
            expected_sha256: Some(digest_of(b"original")),
            ..VerifyOptions::default()
        };

        let err = verify_package(&path, &options).expect_err("mismatch");

        assert!(matches!(err, VerifyError::ChecksumMismatch { .. }));
    }

    #[test]
    fn rejects_oversize_package_before_hashing() {
        let (_temp, path) = package(&[0_u8; 32], "big.zip");
        let options = VerifyOptions {
            max_package_bytes: 16,
            expected_sha256: Some(digest_of(b"irrelevant")),
            ..VerifyOptions::default()
        };

        let err = verify_package(&path, &options).expect_err("too large");

        assert!(matches!(
            err,
            VerifyError::TooLarge {
                size_bytes: 32,
                max_bytes: 16
            }
        ));
    }

    #[rstest]
    #[case::unknown_suffix(&[], "crs.tar.zst")]
    #[case::not_in_allowlist(&["tar.gz"], "crs.zip")]
    #[case::unrecognised_allowlist(&[".rar"], "crs.zip")]
    fn rejects_unsupported_extensions(#[case] allowed: &[&str], #[case] name: &str) {
        let (_temp, path) = package(b"x", name);
        let options = VerifyOptions {
            allowed_extensions: allowed.iter().map(|e| (*e).to_owned()).collect(),
            ..VerifyOptions::default()
        };

        let err = verify_package(&path, &options).expect_err("unsupported");

        assert!(matches!(err, VerifyError::UnsupportedExtension { .. }));
    }

    #[test]
    fn normalises_allowed_extensions() {
        let options = VerifyOptions {
            allowed_extensions: vec![" ZIP ".into(), ".zip".into(), String::new()],
            ..VerifyOptions::default()
        };
        assert_eq!(options.allowed_kinds(), vec![PackageKind::Zip]);
    }

    #[test]
    fn missing_package_reports_stat_failure() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = Utf8PathBuf::try_from(temp.path().join("absent.zip")).expect("UTF-8 path");
        let err = verify_package(&path, &VerifyOptions::default()).expect_err("missing");
        assert!(matches!(err, VerifyError::Stat { .. }));
    }
}
