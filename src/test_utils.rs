//! Shared test utilities: package builders, a local package fetcher, and a
//! recording config loader.
//!
//! Builders write entry names verbatim into the archive, including unsafe
//! names such as `../evil` or `/etc/passwd`, so extraction guards can be
//! exercised against hostile packages.

#![allow(
    clippy::expect_used,
    clippy::missing_panics_doc,
    reason = "test support panics on fixture setup failure"
)]

use crate::activation::{ConfigLoader, LoaderError};
use crate::package::download::{FetchError, FetchOptions, FetchResult, PackageFetcher};
use camino::Utf8Path;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One entry of a test package.
#[derive(Debug, Clone, Copy)]
pub enum ArchiveEntry<'a> {
    /// Regular file with contents.
    File(&'a str, &'a [u8]),
    /// Directory.
    Dir(&'a str),
    /// Symbolic link pointing at a target.
    Symlink(&'a str, &'a str),
    /// Hard link pointing at another entry (tar only).
    HardLink(&'a str, &'a str),
    /// Named pipe (tar only).
    Fifo(&'a str),
}

/// Write a `.tar.gz` package containing `entries` to `path`.
pub fn write_tar_gz(path: &Path, entries: &[ArchiveEntry<'_>]) {
    let file = File::create(path).expect("create tar.gz");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(0);
        let (name, data): (&str, &[u8]) = match *entry {
            ArchiveEntry::File(name, contents) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(contents.len() as u64);
                (name, contents)
            }
            ArchiveEntry::Dir(name) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                (name, &[])
            }
            ArchiveEntry::Symlink(name, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_link_name(target).expect("link name");
                (name, &[])
            }
            ArchiveEntry::HardLink(name, target) => {
                header.set_entry_type(tar::EntryType::Link);
                header.set_link_name(target).expect("link name");
                (name, &[])
            }
            ArchiveEntry::Fifo(name) => {
                header.set_entry_type(tar::EntryType::Fifo);
                (name, &[])
            }
        };
        set_raw_name(&mut header, name);
        header.set_cksum();
        builder.append(&header, data).expect("append entry");
    }
    let encoder = builder.into_inner().expect("finish tar");
    encoder.finish().expect("finish gzip");
}

/// Store `name` without the validation `Header::set_path` applies.
fn set_raw_name(header: &mut tar::Header, name: &str) {
    let field = &mut header.as_old_mut().name;
    field.fill(0);
    let field_len = field.len();
    field
        .get_mut(..name.len())
        .filter(|_| name.len() < field_len)
        .expect("test entry name fits the tar header")
        .copy_from_slice(name.as_bytes());
}

/// Write a `.zip` package containing `entries` to `path`.
pub fn write_zip(path: &Path, entries: &[ArchiveEntry<'_>]) {
    let file = File::create(path).expect("create zip");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for entry in entries {
        match *entry {
            ArchiveEntry::File(name, contents) => {
                writer.start_file(name, options).expect("start file");
                writer.write_all(contents).expect("write file");
            }
            ArchiveEntry::Dir(name) => {
                writer.add_directory(name, options).expect("add directory");
            }
            ArchiveEntry::Symlink(name, target) => {
                writer.add_symlink(name, target, options).expect("add symlink");
            }
            ArchiveEntry::HardLink(..) | ArchiveEntry::Fifo(_) => {
                panic!("zip packages cannot hold {entry:?}");
            }
        }
    }
    writer.finish().expect("finish zip");
}

/// Compute a lowercase hex SHA-256 digest for `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// A config loader call recorded by [`RecordingLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderCall {
    /// `adapt` was called with this config.
    Adapt(String),
    /// `load` was called with this config.
    Load(String),
}

/// A [`ConfigLoader`] stub that records calls and fails on request.
#[derive(Debug, Default)]
pub struct RecordingLoader {
    calls: Mutex<Vec<LoaderCall>>,
    adapt_failure: Option<LoaderError>,
    load_failures: Vec<(String, LoaderError)>,
}

impl RecordingLoader {
    /// Create a loader that accepts every config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `adapt` call with `error`.
    #[must_use]
    pub fn failing_adapt(mut self, error: LoaderError) -> Self {
        self.adapt_failure = Some(error);
        self
    }

    /// Fail `load` calls whose config equals `config` with `error`.
    #[must_use]
    pub fn failing_load_of(mut self, config: impl Into<String>, error: LoaderError) -> Self {
        self.load_failures.push((config.into(), error));
        self
    }

    /// Return every recorded call in order.
    pub fn calls(&self) -> Vec<LoaderCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Count `load` calls made with `config`.
    pub fn load_count(&self, config: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, LoaderCall::Load(loaded) if loaded == config))
            .count()
    }

    fn record(&self, call: LoaderCall) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

impl ConfigLoader for RecordingLoader {
    fn adapt(&self, config: &str) -> Result<(), LoaderError> {
        self.record(LoaderCall::Adapt(config.to_owned()));
        self.adapt_failure.clone().map_or(Ok(()), Err)
    }

    fn load(&self, config: &str) -> Result<(), LoaderError> {
        self.record(LoaderCall::Load(config.to_owned()));
        self.load_failures
            .iter()
            .find(|(failing, _)| failing == config)
            .map_or(Ok(()), |(_, error)| Err(error.clone()))
    }
}

/// A loader rejection shaped like a Caddy admin API error.
#[must_use]
pub fn rejected(endpoint: &str) -> LoaderError {
    LoaderError::Rejected {
        endpoint: endpoint.to_owned(),
        status: 400,
        body: "adapting config using caddyfile: unrecognized directive".to_owned(),
    }
}

/// A [`PackageFetcher`] that serves one local package for every URL.
#[derive(Debug, Clone)]
pub struct LocalPackageFetcher {
    package: PathBuf,
}

impl LocalPackageFetcher {
    /// Serve the package at `package`.
    #[must_use]
    pub fn new(package: impl Into<PathBuf>) -> Self {
        Self {
            package: package.into(),
        }
    }
}

impl PackageFetcher for LocalPackageFetcher {
    fn fetch(
        &self,
        _url: &str,
        destination: &Utf8Path,
        _options: &FetchOptions,
    ) -> Result<FetchResult, FetchError> {
        let size_bytes = std::fs::copy(&self.package, destination).map_err(|source| FetchError::Io {
            path: destination.to_path_buf(),
            source,
        })?;
        Ok(FetchResult {
            saved_path: destination.to_path_buf(),
            size_bytes,
            status_code: 200,
        })
    }
}
