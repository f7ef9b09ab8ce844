//! Package acquisition: download, verification, and extraction.
//!
//! # Sub-modules
//!
//! - [`download`] - HTTPS fetch with host allowlist and atomic writes.
//! - [`extraction`] - Safe `.tar.gz` and `.zip` extraction with caps.
//! - [`kind`] - Package archive format detection (`PackageKind`).
//! - [`sha256_digest`] - SHA-256 digest newtype (`Sha256Digest`).
//! - [`verification`] - Extension, size, and checksum verification.

pub mod download;
pub mod extraction;
pub mod kind;
pub mod sha256_digest;
pub mod verification;

pub use download::{FetchAuth, FetchError, FetchOptions, FetchResult, HttpFetcher, PackageFetcher};
pub use extraction::{
    ArchiveExtractor, ExtractOptions, ExtractionError, ExtractionSummary, PackageExtractor,
};
pub use kind::PackageKind;
pub use sha256_digest::Sha256Digest;
pub use verification::{VerifiedPackage, VerifyError, VerifyOptions, verify_package};
