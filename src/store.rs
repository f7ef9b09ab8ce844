//! On-disk release layout and the `current`/`last_good` pointers.
//!
//! A [`Store`] owns a single base directory:
//!
//! ```text
//! <base_dir>/
//!   packages/              staged and final package files
//!   releases/<version>/    one directory per extracted release
//!   current   -> releases/<version>
//!   last_good -> releases/<version>
//! ```
//!
//! Pointers are symbolic links on Unix. Elsewhere they are small pointer
//! files holding the target path. Either way a pointer is replaced by
//! writing a temporary sibling and renaming it over the old one, so readers
//! observe the old target or the new one and never a missing pointer.

use crate::paths::lexical_clean_utf8;
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Base directory used when none is configured.
pub const DEFAULT_BASE_DIR: &str = "/config/caddy/waf";

const PACKAGES_DIRNAME: &str = "packages";
const RELEASES_DIRNAME: &str = "releases";
const TEMP_POINTER_SUFFIX: &str = ".tmp";
const ACTIVATION_LOCK_FILENAME: &str = ".activation.lock";
const UNKNOWN_VERSION: &str = "unknown";

/// One of the two release pointers kept in the base directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pointer {
    /// The release currently live.
    Current,
    /// The release live immediately before the last successful activation.
    LastGood,
}

impl Pointer {
    /// Both pointers, `current` first.
    pub const ALL: [Self; 2] = [Self::Current, Self::LastGood];

    /// File name of the pointer inside the base directory.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::LastGood => "last_good",
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Errors raised by store filesystem operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A pointer exists but could not be read.
    #[error("failed to read pointer {path}: {source}")]
    ReadPointer {
        /// Pointer path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A pointer target is not valid UTF-8.
    #[error("pointer {path} has a non UTF-8 target {target:?}")]
    NonUtf8Target {
        /// Pointer path.
        path: Utf8PathBuf,
        /// Raw target as read from disk.
        target: PathBuf,
    },

    /// The temporary pointer could not be written.
    #[error("failed to create temporary pointer {path}: {source}")]
    WritePointer {
        /// Temporary pointer path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The temporary pointer could not be renamed over the live one.
    #[error("failed to replace pointer {path}: {source}")]
    ReplacePointer {
        /// Pointer path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A pointer could not be removed.
    #[error("failed to clear pointer {path}: {source}")]
    ClearPointer {
        /// Pointer path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The activation lock file could not be opened or locked.
    #[error("failed to lock {path}: {source}")]
    Lock {
        /// Lock file path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A path handed to the store lies outside its base directory.
    #[error("path {path} is outside the store base directory {base_dir}")]
    OutsideBaseDir {
        /// Rejected path.
        path: Utf8PathBuf,
        /// Store base directory.
        base_dir: Utf8PathBuf,
    },
}

/// Pointer targets resolved for pinning decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPins {
    /// Existing release directories referenced by a pointer.
    pub paths: Vec<Utf8PathBuf>,
    /// Pointers whose target no longer exists.
    pub dangling: Vec<Pointer>,
}

impl ResolvedPins {
    /// Return true when `path` is pinned by a pointer.
    #[must_use]
    pub fn contains(&self, path: &Utf8Path) -> bool {
        let cleaned = lexical_clean_utf8(path);
        self.paths.iter().any(|pinned| *pinned == cleaned)
    }
}

/// Exclusive hold on a store's activation lock, released on drop.
///
/// Holds the store's in-process mutex and an advisory lock on
/// `<base_dir>/.activation.lock`, so pointer moves and release directory
/// changes are serialised across threads and processes.
#[derive(Debug)]
pub struct ActivationLock<'a> {
    file: File,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for ActivationLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::debug!("failed to release activation lock: {err}");
        }
    }
}

/// Filesystem layout for packages, releases, and release pointers.
///
/// Each store carries its own activation lock so independent stores (for
/// example in tests) never contend with each other.
#[derive(Debug)]
pub struct Store {
    base_dir: Utf8PathBuf,
    activation_lock: Mutex<()>,
}

impl Store {
    /// Create a store rooted at `base_dir`.
    ///
    /// A blank base directory falls back to [`DEFAULT_BASE_DIR`]. The path is
    /// normalised lexically; nothing is created on disk until
    /// [`Store::ensure_dirs`] runs.
    ///
    /// # Examples
    ///
    /// ```
    /// use rulegate::store::Store;
    ///
    /// let store = Store::new("/srv/waf/./");
    /// assert_eq!(store.release_dir("v4.0.0"), "/srv/waf/releases/v4.0.0");
    /// ```
    #[must_use]
    pub fn new(base_dir: impl Into<Utf8PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let base_dir = if base_dir.as_str().trim().is_empty() {
            Utf8PathBuf::from(DEFAULT_BASE_DIR)
        } else {
            lexical_clean_utf8(&base_dir)
        };
        Self {
            base_dir,
            activation_lock: Mutex::new(()),
        }
    }

    /// Create the base, packages, and releases directories.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CreateDir`] when a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        for directory in [self.base_dir.clone(), self.packages_dir(), self.releases_dir()] {
            fs::create_dir_all(&directory).map_err(|source| StoreError::CreateDir {
                path: directory.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Return the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }

    /// Return the package staging directory.
    #[must_use]
    pub fn packages_dir(&self) -> Utf8PathBuf {
        self.base_dir.join(PACKAGES_DIRNAME)
    }

    /// Return the directory holding one subdirectory per release.
    #[must_use]
    pub fn releases_dir(&self) -> Utf8PathBuf {
        self.base_dir.join(RELEASES_DIRNAME)
    }

    /// Return the directory for `version` after sanitising it.
    #[must_use]
    pub fn release_dir(&self, version: &str) -> Utf8PathBuf {
        self.releases_dir().join(sanitize_version(version))
    }

    /// Return the path of a package file, keeping only the final component
    /// of `file_name`.
    #[must_use]
    pub fn package_path(&self, file_name: &str) -> Utf8PathBuf {
        let base_name = Utf8Path::new(file_name)
            .file_name()
            .unwrap_or(UNKNOWN_VERSION);
        self.packages_dir().join(base_name)
    }

    /// Return the path of a pointer.
    #[must_use]
    pub fn pointer_path(&self, pointer: Pointer) -> Utf8PathBuf {
        self.base_dir.join(pointer.file_name())
    }

    /// Return the advisory lock file guarding activations across processes.
    #[must_use]
    pub fn activation_lock_path(&self) -> Utf8PathBuf {
        self.base_dir.join(ACTIVATION_LOCK_FILENAME)
    }

    /// Acquire the activation lock, blocking until every other holder in
    /// this process and in other processes has released it.
    ///
    /// Activation, retention, and publishing a release directory all run
    /// under this lock. A poisoned mutex is recovered: it guards `()`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CreateDir`] when the base directory cannot be
    /// created, or [`StoreError::Lock`] when the lock file cannot be opened
    /// or locked.
    pub fn lock_activation(&self) -> Result<ActivationLock<'_>, StoreError> {
        let guard = self
            .activation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        fs::create_dir_all(&self.base_dir).map_err(|source| StoreError::CreateDir {
            path: self.base_dir.clone(),
            source,
        })?;
        let path = self.activation_lock_path();
        let lock_error = |source| StoreError::Lock {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(lock_error)?;
        FileExt::lock_exclusive(&file).map_err(lock_error)?;
        Ok(ActivationLock {
            file,
            _guard: guard,
        })
    }

    /// Return true when a release directory exists for `version`.
    #[must_use]
    pub fn has_release(&self, version: &str) -> bool {
        self.release_dir(version).is_dir()
    }

    /// Resolve the target of `pointer`.
    ///
    /// Relative targets are resolved against the base directory. Returns
    /// `Ok(None)` when the pointer does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ReadPointer`] when the pointer exists but cannot
    /// be read, or [`StoreError::NonUtf8Target`] for a non UTF-8 target.
    pub fn pointer_target(&self, pointer: Pointer) -> Result<Option<Utf8PathBuf>, StoreError> {
        let path = self.pointer_path(pointer);
        let raw_target = match read_pointer(&path) {
            Ok(target) => target,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::ReadPointer { path, source }),
        };
        let target = Utf8PathBuf::try_from(raw_target).map_err(|err| StoreError::NonUtf8Target {
            path: path.clone(),
            target: err.into_path_buf(),
        })?;
        let resolved = if target.is_absolute() {
            target
        } else {
            self.base_dir.join(target)
        };
        Ok(Some(lexical_clean_utf8(&resolved)))
    }

    /// Resolve the target of the `current` pointer.
    ///
    /// Callers use this to reconcile their record of the active version with
    /// the filesystem after a crash.
    ///
    /// # Errors
    ///
    /// See [`Store::pointer_target`].
    pub fn current_target(&self) -> Result<Option<Utf8PathBuf>, StoreError> {
        self.pointer_target(Pointer::Current)
    }

    /// Point `pointer` at `target`, replacing any previous target atomically.
    ///
    /// A stale temporary pointer left by an interrupted attempt is removed
    /// first, so the operation is safe to retry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WritePointer`] or [`StoreError::ReplacePointer`]
    /// when the temporary pointer cannot be created or renamed.
    pub fn set_pointer(&self, pointer: Pointer, target: &Utf8Path) -> Result<(), StoreError> {
        let path = self.pointer_path(pointer);
        let target = lexical_clean_utf8(target);
        fs::create_dir_all(&self.base_dir).map_err(|source| StoreError::CreateDir {
            path: self.base_dir.clone(),
            source,
        })?;

        let temp_path = Utf8PathBuf::from(format!("{path}{TEMP_POINTER_SUFFIX}"));
        remove_if_present(&temp_path).map_err(|source| StoreError::WritePointer {
            path: temp_path.clone(),
            source,
        })?;
        write_pointer(&temp_path, &target).map_err(|source| StoreError::WritePointer {
            path: temp_path.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&temp_path, &path) {
            // The next attempt clears a leftover temporary pointer.
            if let Err(err) = remove_if_present(&temp_path) {
                log::debug!("failed to remove temporary pointer {temp_path}: {err}");
            }
            return Err(StoreError::ReplacePointer { path, source });
        }
        log::debug!("pointer {pointer} now targets {target}");
        Ok(())
    }

    /// Remove `pointer` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ClearPointer`] when removal fails for a reason
    /// other than the pointer being absent.
    pub fn clear_pointer(&self, pointer: Pointer) -> Result<(), StoreError> {
        let path = self.pointer_path(pointer);
        remove_if_present(&path).map_err(|source| StoreError::ClearPointer { path, source })?;
        log::debug!("pointer {pointer} cleared");
        Ok(())
    }

    /// Resolve both pointers for pinning decisions.
    ///
    /// Existing targets inside the base directory are returned as pinned
    /// paths. Targets that no longer exist are reported as dangling rather
    /// than failing, so retention can still proceed.
    ///
    /// # Errors
    ///
    /// Propagates [`Store::pointer_target`] failures.
    pub fn resolve_pins(&self) -> Result<ResolvedPins, StoreError> {
        let mut pins = ResolvedPins::default();
        for pointer in Pointer::ALL {
            let Some(target) = self.pointer_target(pointer)? else {
                continue;
            };
            if !target.exists() {
                pins.dangling.push(pointer);
                continue;
            }
            if self.contains(&target) && !pins.paths.contains(&target) {
                pins.paths.push(target);
            }
        }
        Ok(pins)
    }

    /// Return true when `path` lies inside the base directory.
    #[must_use]
    pub fn contains(&self, path: &Utf8Path) -> bool {
        let cleaned = lexical_clean_utf8(path);
        cleaned != self.base_dir && cleaned.starts_with(&self.base_dir)
    }

    /// Normalise `path` and require it to lie inside the base directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OutsideBaseDir`] otherwise.
    pub fn ensure_within(&self, path: &Utf8Path) -> Result<Utf8PathBuf, StoreError> {
        if self.contains(path) {
            Ok(lexical_clean_utf8(path))
        } else {
            Err(StoreError::OutsideBaseDir {
                path: path.to_path_buf(),
                base_dir: self.base_dir.clone(),
            })
        }
    }
}

/// Turn a release version into a safe directory name.
///
/// Path separators, `..` sequences, and whitespace become `_`. A blank
/// version becomes `unknown` and a bare `.` becomes `_`, so the result is
/// always a single normal path component.
///
/// # Examples
///
/// ```
/// use rulegate::store::sanitize_version;
///
/// assert_eq!(sanitize_version("v4.2.0"), "v4.2.0");
/// assert_eq!(sanitize_version("../../etc"), "____etc");
/// assert_eq!(sanitize_version("  "), "unknown");
/// ```
#[must_use]
pub fn sanitize_version(version: &str) -> String {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return UNKNOWN_VERSION.to_owned();
    }

    let mut sanitized = String::with_capacity(trimmed.len());
    let mut chars = trimmed.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '.' && chars.peek() == Some(&'.') {
            chars.next();
            sanitized.push('_');
        } else if ch == '/' || ch == '\\' || ch.is_whitespace() {
            sanitized.push('_');
        } else {
            sanitized.push(ch);
        }
    }

    if sanitized == "." {
        sanitized = "_".to_owned();
    }
    sanitized
}

fn remove_if_present(path: &Utf8Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn write_pointer(temp_path: &Utf8Path, target: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, temp_path)
}

#[cfg(not(unix))]
fn write_pointer(temp_path: &Utf8Path, target: &Utf8Path) -> io::Result<()> {
    use std::io::Write;

    let mut file = fs::File::create(temp_path)?;
    file.write_all(target.as_str().as_bytes())?;
    file.sync_all()
}

#[cfg(unix)]
fn read_pointer(path: &Utf8Path) -> io::Result<PathBuf> {
    fs::read_link(path)
}

#[cfg(not(unix))]
fn read_pointer(path: &Utf8Path) -> io::Result<PathBuf> {
    fs::read_to_string(path).map(|content| PathBuf::from(content.trim()))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
