//! Deterministic destination paths and data-root layout
//!
//! Layout under the data root:
//!
//! ```text
//! <root>/downloads/YYYY-MM-DD/<prefix>__YYYYMMDD_HHMMSS__<tag>.<ext>
//! <root>/downloads/YYYY-MM-DD/last_download.txt
//! <root>/exports/YYYY-MM-DD/<prefix>__YYYYMMDD_HHMMSS__<tag>.<ext>
//! <root>/logs/<kind>_<session>.log
//! <root>/bin/                      (optional tool drop-in directory)
//! ```
//!
//! Dates are local dates. Directory creation treats "already exists" as
//! success, so concurrent operations can resolve into the same day folder.

use crate::error::{Error, Result};
use crate::types::OperationKind;
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Subdirectories [`PathResolver::repair_layout`] guarantees
pub const REQUIRED_DIRS: [&str; 4] = ["downloads", "exports", "logs", "bin"];

/// Name of the marker file holding the most recent acquired path
pub const MARKER_FILE_NAME: &str = "last_download.txt";

/// Maximum number of suffixes tried when a resolved path is already taken
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// A fully resolved output location
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPath {
    /// Day directory the file lives in
    pub directory: PathBuf,
    /// File name only
    pub filename: String,
    /// `directory.join(filename)`
    pub full_path: PathBuf,
}

/// Result of [`PathResolver::repair_layout`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayoutReport {
    /// Directories that were missing and have been created
    pub created: Vec<PathBuf>,
}

/// Computes every path the core writes, relative to one injected root
#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Resolver for the given data root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Data root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/logs`
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// `<root>/bin`
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// `<root>/{downloads|exports}/YYYY-MM-DD`
    pub fn day_dir(&self, kind: OperationKind, date: NaiveDate) -> PathBuf {
        self.root
            .join(kind.output_dir_name())
            .join(date.format("%Y-%m-%d").to_string())
    }

    /// `<root>/downloads/YYYY-MM-DD/last_download.txt`
    pub fn marker_path(&self, date: NaiveDate) -> PathBuf {
        self.day_dir(OperationKind::Download, date)
            .join(MARKER_FILE_NAME)
    }

    /// Compute the destination without touching the filesystem
    ///
    /// Identical inputs always yield identical paths; timestamps that differ
    /// by at least one second always yield different file names.
    pub fn plan(
        &self,
        kind: OperationKind,
        prefix: &str,
        tag: &str,
        extension: &str,
        now: DateTime<Local>,
    ) -> ResolvedPath {
        let directory = self.day_dir(kind, now.date_naive());
        let filename = format!(
            "{prefix}__{}__{tag}.{extension}",
            now.format("%Y%m%d_%H%M%S")
        );
        let full_path = directory.join(&filename);

        ResolvedPath {
            directory,
            filename,
            full_path,
        }
    }

    /// [`plan`](Self::plan) the destination and create its day directory
    pub fn resolve_destination(
        &self,
        kind: OperationKind,
        prefix: &str,
        tag: &str,
        extension: &str,
        now: DateTime<Local>,
    ) -> Result<ResolvedPath> {
        let resolved = self.plan(kind, prefix, tag, extension, now);
        ensure_dir(&resolved.directory)?;
        debug!(path = ?resolved.full_path, kind = kind.as_str(), "resolved destination");
        Ok(resolved)
    }

    /// Recreate any missing required subdirectory without touching existing files
    ///
    /// Meant to be called once at startup by the embedding application.
    pub fn repair_layout(&self) -> Result<LayoutReport> {
        let mut report = LayoutReport::default();
        ensure_dir(&self.root)?;

        for name in REQUIRED_DIRS {
            let dir = self.root.join(name);
            if dir.is_dir() {
                continue;
            }
            if dir.exists() {
                return Err(Error::Config {
                    message: format!("{} exists but is not a directory", dir.display()),
                    key: Some("data_root".to_string()),
                });
            }
            ensure_dir(&dir)?;
            report.created.push(dir);
        }

        if !report.created.is_empty() {
            info!(root = ?self.root, created = ?report.created, "repaired data root layout");
        }
        Ok(report)
    }
}

/// Create `path` and its parents; an already existing directory is success
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// `path` followed by its `stem (n).ext` siblings
fn candidates(path: &Path) -> Result<impl Iterator<Item = PathBuf>> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Other(format!("cannot extract file stem of {}", path.display())))?
        .to_string();
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_string);
    let parent = path
        .parent()
        .ok_or_else(|| {
            Error::Other(format!(
                "cannot extract parent directory of {}",
                path.display()
            ))
        })?
        .to_path_buf();

    let numbered = (1..=MAX_RENAME_ATTEMPTS).map(move |i| {
        let name = match &extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        parent.join(name)
    });
    Ok(std::iter::once(path.to_path_buf()).chain(numbered))
}

fn exhausted(path: &Path) -> Error {
    Error::Other(format!(
        "could not find a free name for {} after {} attempts",
        path.display(),
        MAX_RENAME_ATTEMPTS
    ))
}

/// Claim `path`, or the first free `stem (n).ext` sibling, by creating an empty file
///
/// Concurrent callers never receive the same path, even within the same second. The caller owns the
/// placeholder and must remove it if nothing is written.
pub fn reserve_path(path: &Path) -> Result<PathBuf> {
    for candidate in candidates(path)? {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(exhausted(path))
}
