//! Package extraction with traversal protection and resource caps.
//!
//! Unpacks `.tar.gz` and `.zip` packages into a release directory. Every
//! entry name is validated before anything is written: empty, absolute, and
//! `..`-leading names are rejected, as is any name whose cleaned join would
//! leave the target directory. Symlink and hard-link entries are rejected
//! outright; other special tar entries are skipped.
//!
//! File-count and byte caps are checked after each file, and the copy of a
//! single entry is bounded so an overrun never exceeds the remaining budget
//! by more than one byte. Removing partial output is the caller's job.

use super::kind::PackageKind;
use crate::paths::{lexical_clean, starts_with_parent};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default maximum number of files per package.
pub const DEFAULT_EXTRACT_MAX_FILES: u64 = 5000;

/// Default maximum number of extracted bytes per package (512 MiB).
pub const DEFAULT_EXTRACT_MAX_TOTAL_BYTES: u64 = 512 * 1024 * 1024;

const SYMLINK_MODE: u32 = 0o120_000;
const FILE_TYPE_MASK: u32 = 0o170_000;

/// Resource caps for one extraction. Zero selects the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Maximum number of regular files.
    pub max_files: u64,
    /// Maximum number of bytes across all regular files.
    pub max_total_bytes: u64,
}

impl ExtractOptions {
    fn limits(self) -> (u64, u64) {
        let max_files = if self.max_files == 0 {
            DEFAULT_EXTRACT_MAX_FILES
        } else {
            self.max_files
        };
        let max_total_bytes = if self.max_total_bytes == 0 {
            DEFAULT_EXTRACT_MAX_TOTAL_BYTES
        } else {
            self.max_total_bytes
        };
        (max_files, max_total_bytes)
    }
}

/// Totals for a completed extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    /// Number of regular files written.
    pub file_count: u64,
    /// Bytes written across all regular files.
    pub total_bytes: u64,
    /// Directory the package was extracted into.
    pub extract_path: Utf8PathBuf,
}

/// Errors arising from package extraction.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The package file could not be opened.
    #[error("failed to open package {path}: {source}")]
    OpenArchive {
        /// Package path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The tar stream could not be read.
    #[error("failed to read tar entry from {path}: {source}")]
    ReadArchive {
        /// Package path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The zip container could not be read.
    #[error("failed to read zip archive {path}: {source}")]
    Zip {
        /// Package path.
        path: Utf8PathBuf,
        /// Underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// A directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// An entry could not be written.
    #[error("failed to write {path}: {source}")]
    WriteFile {
        /// Output path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// An entry has an empty name.
    #[error("archive entry name is empty")]
    EmptyEntryName,

    /// An entry has an absolute name.
    #[error("absolute path is not allowed: {entry}")]
    AbsolutePath {
        /// Entry name as stored in the archive.
        entry: String,
    },

    /// An entry would be written outside the target directory.
    #[error("path traversal detected: {entry}")]
    PathTraversal {
        /// Entry name as stored in the archive.
        entry: String,
    },

    /// The archive contains a symlink or hard link.
    #[error("link entry is not allowed: {entry}")]
    LinkEntry {
        /// Entry name as stored in the archive.
        entry: String,
    },

    /// The file-count cap was exceeded.
    #[error("too many extracted files: {count} > {max}")]
    TooManyFiles {
        /// Files written so far.
        count: u64,
        /// Configured cap.
        max: u64,
    },

    /// The byte cap was exceeded.
    #[error("extracted bytes exceed limit: {total} > {max}")]
    TooManyBytes {
        /// Bytes written so far.
        total: u64,
        /// Configured cap.
        max: u64,
    },
}

impl ExtractionError {
    /// Return true when the archive itself was rejected as unsafe.
    #[must_use]
    pub const fn is_unsafe_entry(&self) -> bool {
        matches!(
            self,
            Self::EmptyEntryName
                | Self::AbsolutePath { .. }
                | Self::PathTraversal { .. }
                | Self::LinkEntry { .. }
        )
    }
}

/// Trait for extracting packages, enabling test mocking.
///
/// # Examples
///
/// ```
/// use rulegate::package::extraction::ArchiveExtractor;
///
/// let extractor = ArchiveExtractor;
/// // Use extractor.extract(package, kind, target_dir, &options) in production
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait PackageExtractor {
    /// Extract `package` of the given `kind` into `target_dir`.
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractionError`] for unreadable packages, unsafe
    /// entries, cap overruns, or local I/O failures.
    fn extract(
        &self,
        package: &Utf8Path,
        kind: PackageKind,
        target_dir: &Utf8Path,
        options: &ExtractOptions,
    ) -> Result<ExtractionSummary, ExtractionError>;
}

/// Default extractor using the `tar`, `flate2`, and `zip` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveExtractor;

impl PackageExtractor for ArchiveExtractor {
    fn extract(
        &self,
        package: &Utf8Path,
        kind: PackageKind,
        target_dir: &Utf8Path,
        options: &ExtractOptions,
    ) -> Result<ExtractionSummary, ExtractionError> {
        let target = lexical_clean(target_dir.as_std_path());
        create_dir(&target)?;
        let file = File::open(package).map_err(|source| ExtractionError::OpenArchive {
            path: package.to_path_buf(),
            source,
        })?;

        let mut budget = Budget::new(*options);
        match kind {
            PackageKind::TarGz => extract_tar_gz(file, package, &target, &mut budget)?,
            PackageKind::Zip => extract_zip(file, package, &target, &mut budget)?,
        }

        log::debug!(
            "extracted {} files ({} bytes) from {package} into {target_dir}",
            budget.file_count,
            budget.total_bytes
        );
        Ok(ExtractionSummary {
            file_count: budget.file_count,
            total_bytes: budget.total_bytes,
            extract_path: target_dir.to_path_buf(),
        })
    }
}

fn extract_tar_gz(
    file: File,
    package: &Utf8Path,
    target: &Path,
    budget: &mut Budget,
) -> Result<(), ExtractionError> {
    let read_error = |source| ExtractionError::ReadArchive {
        path: package.to_path_buf(),
        source,
    };
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(read_error)? {
        let mut entry = entry.map_err(read_error)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let resolved = resolve_entry(target, &name)?;
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                if let Some(path) = resolved {
                    create_dir(&path)?;
                }
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let path = resolved.ok_or(ExtractionError::PathTraversal { entry: name })?;
                budget.write_file(&mut entry, &path)?;
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                return Err(ExtractionError::LinkEntry { entry: name });
            }
            _ => {}
        }
    }
    Ok(())
}

fn extract_zip(
    file: File,
    package: &Utf8Path,
    target: &Path,
    budget: &mut Budget,
) -> Result<(), ExtractionError> {
    let zip_error = |source| ExtractionError::Zip {
        path: package.to_path_buf(),
        source,
    };
    let mut archive = zip::ZipArchive::new(file).map_err(zip_error)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(zip_error)?;
        let name = entry.name().replace('\\', "/");
        let resolved = resolve_entry(target, &name)?;
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & FILE_TYPE_MASK == SYMLINK_MODE)
        {
            return Err(ExtractionError::LinkEntry { entry: name });
        }
        if entry.is_dir() {
            if let Some(path) = resolved {
                create_dir(&path)?;
            }
            continue;
        }
        let path = resolved.ok_or(ExtractionError::PathTraversal { entry: name })?;
        budget.write_file(&mut entry, &path)?;
    }
    Ok(())
}

/// Validate an entry name and return its output path.
///
/// Returns `Ok(None)` for names that refer to the target directory itself,
/// such as `./`.
fn resolve_entry(target: &Path, name: &str) -> Result<Option<PathBuf>, ExtractionError> {
    if name.trim().is_empty() {
        return Err(ExtractionError::EmptyEntryName);
    }
    let raw = Path::new(name);
    if raw.has_root() || raw.is_absolute() {
        return Err(ExtractionError::AbsolutePath {
            entry: name.to_owned(),
        });
    }

    let cleaned = lexical_clean(raw);
    if starts_with_parent(&cleaned) {
        return Err(ExtractionError::PathTraversal {
            entry: name.to_owned(),
        });
    }
    if cleaned == Path::new(".") {
        return Ok(None);
    }

    let joined = lexical_clean(&target.join(&cleaned));
    if joined == target || !joined.starts_with(target) {
        return Err(ExtractionError::PathTraversal {
            entry: name.to_owned(),
        });
    }
    Ok(Some(joined))
}

fn create_dir(path: &Path) -> Result<(), ExtractionError> {
    fs::create_dir_all(path).map_err(|source| ExtractionError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Running totals checked against the caps after every file.
struct Budget {
    file_count: u64,
    total_bytes: u64,
    max_files: u64,
    max_total_bytes: u64,
}

impl Budget {
    fn new(options: ExtractOptions) -> Self {
        let (max_files, max_total_bytes) = options.limits();
        Self {
            file_count: 0,
            total_bytes: 0,
            max_files,
            max_total_bytes,
        }
    }

    fn write_file(&mut self, reader: &mut dyn Read, path: &Path) -> Result<(), ExtractionError> {
        if let Some(parent) = path.parent() {
            create_dir(parent)?;
        }
        let write_error = |source| ExtractionError::WriteFile {
            path: path.to_path_buf(),
            source,
        };
        let mut output = File::create(path).map_err(write_error)?;
        let remaining = self.max_total_bytes.saturating_sub(self.total_bytes);
        let written = io::copy(&mut reader.take(remaining.saturating_add(1)), &mut output)
            .map_err(write_error)?;

        self.file_count += 1;
        self.total_bytes += written;
        if self.file_count > self.max_files {
            return Err(ExtractionError::TooManyFiles {
                count: self.file_count,
                max: self.max_files,
            });
        }
        if self.total_bytes > self.max_total_bytes {
            return Err(ExtractionError::TooManyBytes {
                total: self.total_bytes,
                max: self.max_total_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "extraction_tests.rs"]
mod tests;
