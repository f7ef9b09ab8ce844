//! Atomic release activation with rollback.
//!
//! An activation moves `last_good` to the release currently live, points
//! `current` at the requested release, then asks the external config system
//! to adapt and load the candidate config. If either step fails, both
//! pointers are restored to their prior targets and the previous effective
//! config is reloaded exactly once.
//!
//! Activations on one [`Store`] are serialised by the store's in-process
//! mutex and, across processes, by an advisory lock on
//! `<base_dir>/.activation.lock`.

use crate::store::{Pointer, Store, StoreError};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use thiserror::Error;

/// Errors reported by the external config system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    /// The request did not complete in time.
    #[error("{endpoint} timed out")]
    Timeout {
        /// Endpoint that was called.
        endpoint: String,
    },

    /// The config system answered with a non-2xx status.
    #[error("{endpoint} returned status {status}: {body}")]
    Rejected {
        /// Endpoint that was called.
        endpoint: String,
        /// Response status.
        status: u16,
        /// Response body, trimmed.
        body: String,
    },

    /// The request failed below the HTTP layer.
    #[error("{endpoint} request failed: {reason}")]
    Transport {
        /// Endpoint that was called.
        endpoint: String,
        /// Client error message.
        reason: String,
    },
}

/// External config system that validates and applies proxy config text.
///
/// # Examples
///
/// ```
/// use rulegate::activation::{ConfigLoader, LoaderError};
///
/// struct AcceptAll;
///
/// impl ConfigLoader for AcceptAll {
///     fn adapt(&self, _config: &str) -> Result<(), LoaderError> { Ok(()) }
///     fn load(&self, _config: &str) -> Result<(), LoaderError> { Ok(()) }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait ConfigLoader {
    /// Validate `config` without applying it.
    ///
    /// # Errors
    ///
    /// Returns a [`LoaderError`] when the config is rejected or the call fails.
    fn adapt(&self, config: &str) -> Result<(), LoaderError>;

    /// Apply `config` as the live configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`LoaderError`] when the config is rejected or the call fails.
    fn load(&self, config: &str) -> Result<(), LoaderError>;
}

/// Config system step that failed during activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStep {
    /// Validating the candidate config.
    Adapt,
    /// Applying the candidate config.
    Load,
}

impl fmt::Display for ActivationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Adapt => "adapt",
            Self::Load => "load",
        })
    }
}

/// Failure while undoing a rejected activation.
#[derive(Debug, Error)]
pub enum RollbackError {
    /// A pointer could not be restored.
    #[error("failed to restore pointers: {0}")]
    Pointer(#[source] StoreError),

    /// The previous config could not be reloaded.
    #[error("failed to reload previous config: {0}")]
    Reload(#[source] LoaderError),
}

/// Errors raised by [`Activator::activate`].
#[derive(Debug, Error)]
pub enum ActivationError {
    /// The activation lock could not be taken.
    #[error("failed to take the activation lock: {source}")]
    Lock {
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// No extracted release exists for the version.
    #[error("release dir not found for {version}: {path}")]
    ReleaseNotFound {
        /// Requested version.
        version: String,
        /// Expected release directory.
        path: Utf8PathBuf,
    },

    /// The current pointers could not be read.
    #[error("failed to read release pointers: {source}")]
    ReadPointer {
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// A pointer could not be moved before the config system was called.
    #[error("failed to set {pointer}: {source}")]
    SwapPointer {
        /// Pointer being moved.
        pointer: Pointer,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// The config system rejected the candidate and the rollback succeeded.
    #[error("{step} failed: {source}")]
    Rejected {
        /// Step that failed.
        step: ActivationStep,
        /// Config system error.
        #[source]
        source: LoaderError,
    },

    /// The config system rejected the candidate and the rollback failed.
    #[error("{step} failed: {cause}; rollback failed: {rollback}; the live configuration may be inconsistent")]
    RollbackFailed {
        /// Step that failed.
        step: ActivationStep,
        /// Config system error that triggered the rollback.
        cause: LoaderError,
        /// Rollback failure.
        #[source]
        rollback: Box<RollbackError>,
    },
}

impl ActivationError {
    /// Return true when the store or live config may be left inconsistent.
    #[must_use]
    pub const fn may_be_inconsistent(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Return the config system error that triggered the failure, if any.
    #[must_use]
    pub const fn loader_error(&self) -> Option<&LoaderError> {
        match self {
            Self::Rejected { source, .. } => Some(source),
            Self::RollbackFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Inputs for a single activation.
#[derive(Debug, Clone, Copy)]
pub struct ActivationRequest<'a> {
    /// Version to activate. Sanitised before use as a directory name.
    pub version: &'a str,
    /// Config text to adapt and load.
    pub candidate_config: &'a str,
    /// Previous effective config reloaded on rollback, when known.
    pub previous_config: Option<&'a str>,
}

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationOutcome {
    /// Release directory now targeted by `current`.
    pub release_dir: Utf8PathBuf,
    /// Release directory `current` targeted before, now targeted by
    /// `last_good`.
    pub previous_target: Option<Utf8PathBuf>,
}

/// Performs activations against one store and config system.
pub struct Activator<'a> {
    store: &'a Store,
    loader: &'a dyn ConfigLoader,
}

impl<'a> Activator<'a> {
    /// Create an activator.
    #[must_use]
    pub fn new(store: &'a Store, loader: &'a dyn ConfigLoader) -> Self {
        Self { store, loader }
    }

    /// Activate `request.version`.
    ///
    /// On success `current` targets the new release and `last_good` the
    /// release that was live before (when there was one).
    ///
    /// # Errors
    ///
    /// Returns [`ActivationError::ReleaseNotFound`] when the release has not
    /// been extracted, [`ActivationError::Rejected`] when the config system
    /// refused the candidate and everything was rolled back, and
    /// [`ActivationError::RollbackFailed`] when the rollback itself failed.
    pub fn activate(
        &self,
        request: &ActivationRequest<'_>,
    ) -> Result<ActivationOutcome, ActivationError> {
        let _lock = self
            .store
            .lock_activation()
            .map_err(|source| ActivationError::Lock { source })?;

        let release_dir = self.store.release_dir(request.version);
        if !release_dir.is_dir() {
            return Err(ActivationError::ReleaseNotFound {
                version: request.version.to_owned(),
                path: release_dir,
            });
        }

        let snapshot = PointerSnapshot::capture(self.store)?;

        if let Some(previous) = &snapshot.current {
            self.store
                .set_pointer(Pointer::LastGood, previous)
                .map_err(|source| ActivationError::SwapPointer {
                    pointer: Pointer::LastGood,
                    source,
                })?;
        }
        if let Err(source) = self.store.set_pointer(Pointer::Current, &release_dir) {
            if let Err(err) = snapshot.restore(self.store, Pointer::LastGood) {
                log::warn!("failed to restore last_good after a failed swap: {err}");
            }
            return Err(ActivationError::SwapPointer {
                pointer: Pointer::Current,
                source,
            });
        }
        log::debug!("current now targets {release_dir}; calling adapt");

        if let Err(cause) = self.loader.adapt(request.candidate_config) {
            return Err(self.roll_back(&snapshot, request, ActivationStep::Adapt, cause));
        }
        log::debug!("candidate config adapted; calling load");

        if let Err(cause) = self.loader.load(request.candidate_config) {
            return Err(self.roll_back(&snapshot, request, ActivationStep::Load, cause));
        }

        log::info!("activated release {} at {release_dir}", request.version);
        Ok(ActivationOutcome {
            release_dir,
            previous_target: snapshot.current,
        })
    }

    fn roll_back(
        &self,
        snapshot: &PointerSnapshot,
        request: &ActivationRequest<'_>,
        step: ActivationStep,
        cause: LoaderError,
    ) -> ActivationError {
        log::warn!(
            "{step} failed for release {}: {cause}; rolling back",
            request.version
        );
        match self.restore(snapshot, request.previous_config) {
            Ok(()) => {
                log::warn!("rolled back release {}", request.version);
                ActivationError::Rejected {
                    step,
                    source: cause,
                }
            }
            Err(rollback) => ActivationError::RollbackFailed {
                step,
                cause,
                rollback: Box::new(rollback),
            },
        }
    }

    fn restore(
        &self,
        snapshot: &PointerSnapshot,
        previous_config: Option<&str>,
    ) -> Result<(), RollbackError> {
        let current = snapshot.restore(self.store, Pointer::Current);
        let last_good = snapshot.restore(self.store, Pointer::LastGood);
        current.and(last_good).map_err(RollbackError::Pointer)?;

        match previous_config {
            Some(config) => self.loader.load(config).map_err(RollbackError::Reload),
            None => {
                log::warn!("no previous config supplied; skipping reload");
                Ok(())
            }
        }
    }
}

/// Pointer targets captured before an activation touches them.
struct PointerSnapshot {
    current: Option<Utf8PathBuf>,
    last_good: Option<Utf8PathBuf>,
}

impl PointerSnapshot {
    fn capture(store: &Store) -> Result<Self, ActivationError> {
        let read = |pointer| {
            store
                .pointer_target(pointer)
                .map_err(|source| ActivationError::ReadPointer { source })
        };
        Ok(Self {
            current: read(Pointer::Current)?,
            last_good: read(Pointer::LastGood)?,
        })
    }

    fn target(&self, pointer: Pointer) -> Option<&Utf8Path> {
        match pointer {
            Pointer::Current => self.current.as_deref(),
            Pointer::LastGood => self.last_good.as_deref(),
        }
    }

    /// Put `pointer` back to its captured target, removing it if it was absent.
    fn restore(&self, store: &Store, pointer: Pointer) -> Result<(), StoreError> {
        match self.target(pointer) {
            Some(target) => store.set_pointer(pointer, target),
            None => store.clear_pointer(pointer),
        }
    }
}

#[cfg(test)]
#[path = "activation_tests.rs"]
mod tests;
