//! Acquisition manager: remote download or local import into `downloads/`
//!
//! State machine:
//!
//! ```text
//! Idle -> Validating -> Downloading -> Extracting -> Resolved
//!                   \-> (local import skips Downloading)
//! any running state -> Cancelled | Failed
//! ```
//!
//! Split into focused submodules:
//! - [`commands`] - downloader and normalization command lines
//! - `task` - the per-operation stage sequence
//!
//! Source validation happens synchronously in [`AcquisitionManager::start`],
//! before a session log is opened or any process is spawned.

mod commands;
mod task;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use commands::{
    AUDIO_FORMAT_SELECTOR, build_download_command, build_normalize_command, is_format_miss,
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::operation::{OperationHandle, OperationMeta, Outcome};
use crate::paths::PathResolver;
use crate::process::ProcessRunner;
use crate::session_log::SessionLog;
use crate::tools::Toolchain;
use crate::types::{AcquisitionState, Event, OperationKind, SessionId, SourceReference};
use chrono::{Local, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 1000;

/// A resolved, published audio file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquiredFile {
    /// Final file under `downloads/YYYY-MM-DD/`
    pub file_path: PathBuf,
    /// Wall time of the whole operation
    pub duration: Duration,
}

/// Terminal outcome of a download or import
pub type DownloadOutcome = Outcome<AcquiredFile>;

/// Handle to a running download or import
pub type DownloadHandle = OperationHandle<AcquisitionState, AcquiredFile>;

/// Runs downloads and imports, one at a time
///
/// Cloning is cheap and clones share the active-operation slot, so a second
/// [`start`](Self::start) through any clone fails with
/// [`Error::AlreadyRunning`] while an operation is in flight.
#[derive(Clone)]
pub struct AcquisitionManager {
    pub(crate) config: Arc<Config>,
    pub(crate) paths: PathResolver,
    pub(crate) runner: ProcessRunner,
    pub(crate) tools: Arc<Toolchain>,
    source_pattern: Arc<Regex>,
    event_tx: broadcast::Sender<Event>,
    active: Arc<Mutex<Option<SessionId>>>,
}

impl AcquisitionManager {
    /// Manager for `config` using the already located `tools`
    pub fn new(config: Config, tools: Toolchain) -> Result<Self> {
        config.validate()?;
        let source_pattern =
            Regex::new(&config.download.source_pattern).map_err(|e| Error::Config {
                message: format!("source_pattern is not a valid regex: {e}"),
                key: Some("source_pattern".to_string()),
            })?;
        let (event_tx, _rx) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            paths: PathResolver::new(&config.data_root),
            runner: ProcessRunner::new(&config.process),
            config: Arc::new(config),
            tools: Arc::new(tools),
            source_pattern: Arc::new(source_pattern),
            event_tx,
            active: Arc::new(Mutex::new(None)),
        })
    }

    /// Subscribe to state, output and terminal events of every operation
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Session id of the operation currently in flight, if any
    pub fn active_session(&self) -> Option<SessionId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate `source` and start acquiring it in the background
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returned synchronously, before anything is spawned:
    /// - [`Error::AlreadyRunning`] if this manager already has an operation in flight
    /// - [`Error::InvalidSource`] if a URL does not match the configured source pattern
    /// - [`Error::SourceNotFound`] if a local file is missing or empty
    ///
    /// Failures after that are delivered by [`OperationHandle::wait`] as
    /// [`Error::DownloadFailure`].
    pub fn start(&self, source: SourceReference) -> Result<DownloadHandle> {
        let started = Local::now();
        let id = SessionId::generate(started);
        let slot = ActiveSlot::claim(&self.active, &id)?;

        self.validate_source(&source)?;

        let log = SessionLog::open(&self.paths.logs_dir(), OperationKind::Download, &id)?;
        let meta = OperationMeta {
            id: id.clone(),
            kind: OperationKind::Download,
            started_at: Utc::now(),
            log_path: log.path().to_path_buf(),
        };
        let cancel = CancellationToken::new();

        info!(session_id = %id, source = %source, "starting acquisition");

        let task = task::AcquisitionTask {
            manager: self.clone(),
            source,
            log,
            cancel: cancel.clone(),
            id,
            started,
            _slot: slot,
        };
        Ok(OperationHandle::spawn(meta, cancel, move |tracker| {
            task.run(tracker)
        }))
    }

    /// Check a source reference without starting anything
    pub fn validate_source(&self, source: &SourceReference) -> Result<()> {
        match source {
            SourceReference::Remote(url) => {
                let invalid = |reason: &str| Error::InvalidSource {
                    source_ref: url.to_string(),
                    reason: reason.to_string(),
                };
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(invalid("only http and https URLs are accepted"));
                }
                if url.host_str().is_none_or(str::is_empty) {
                    return Err(invalid("URL has no host"));
                }
                if !self.source_pattern.is_match(url.as_str()) {
                    return Err(invalid("URL does not match the accepted source pattern"));
                }
                Ok(())
            }
            SourceReference::Local(path) => validate_local_file(path),
        }
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}

pub(crate) fn validate_local_file(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(Error::SourceNotFound(path.to_path_buf())),
    }
}

/// Occupies the manager's single operation slot until dropped
pub(crate) struct ActiveSlot {
    active: Arc<Mutex<Option<SessionId>>>,
}

impl ActiveSlot {
    fn claim(active: &Arc<Mutex<Option<SessionId>>>, id: &SessionId) -> Result<Self> {
        let mut current = active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = current.as_ref() {
            return Err(Error::AlreadyRunning {
                session_id: running.to_string(),
            });
        }
        *current = Some(id.clone());
        Ok(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
