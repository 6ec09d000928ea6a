//! Export pipeline: source audio + edits + profile -> finished file in `exports/`
//!
//! State machine:
//!
//! ```text
//! Idle -> Preparing -> Transcoding -> Succeeded
//! any running state -> Cancelled | Failed
//! ```
//!
//! Session log stages, in order: `export_clicked`,
//! `precheck_audio_loaded_result`, `wav_export_start`, `wav_worker_fetch_test`,
//! `wav_blob_ready`, `backend_ffmpeg_start` (plus one record per transcoder
//! output line), `backend_ffmpeg_exit`, then `export_success` or
//! `export_failure`.
//!
//! Exports do not share a slot: any number may run concurrently, each with its
//! own session log and output file.

mod task;
mod transcode;


pub use transcode::{
    audio_codec_args, audio_filter_chain, black_video_source, build_transcode_command,
};

use crate::config::Config;
use crate::edit::EditDescriptor;
use crate::error::{Error, Result};
use crate::operation::{OperationHandle, OperationMeta, Outcome};
use crate::paths::PathResolver;
use crate::process::ProcessRunner;
use crate::session_log::SessionLog;
use crate::tools::Toolchain;
use crate::types::{Event, ExportProfile, ExportState, SessionId, Stage};
use chrono::{Local, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 1000;

/// A published export
#[derive(Clone, Debug, PartialEq)]
pub struct ExportedFile {
    /// Output file under `exports/YYYY-MM-DD/`
    pub file_path: PathBuf,
    /// Profile the file was produced with
    pub profile: ExportProfile,
    /// Wall time of the whole operation
    pub duration: Duration,
}

/// Terminal outcome of an export
pub type ExportOutcome = Outcome<ExportedFile>;

/// Handle to a running export
pub type ExportHandle = OperationHandle<ExportState, ExportedFile>;

/// Builds and runs transcoder invocations for exports
#[derive(Clone)]
pub struct ExportPipeline {
    pub(crate) config: Arc<Config>,
    pub(crate) paths: PathResolver,
    pub(crate) runner: ProcessRunner,
    pub(crate) tools: Arc<Toolchain>,
    event_tx: broadcast::Sender<Event>,
}

impl ExportPipeline {
    /// Pipeline for `config` using the already located `tools`
    pub fn new(config: Config, tools: Toolchain) -> Result<Self> {
        config.validate()?;
        let (event_tx, _rx) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            paths: PathResolver::new(&config.data_root),
            runner: ProcessRunner::new(&config.process),
            config: Arc::new(config),
            tools: Arc::new(tools),
            event_tx,
        })
    }

    /// Subscribe to state, output and terminal events of every export
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Start exporting `source` with `edits` into `destination_root/exports/YYYY-MM-DD/`
    ///
    /// The session log goes to `<data_root>/logs/`. `edits` has already been
    /// validated by construction and is not checked again. Must be called
    /// from within a tokio runtime.
    ///
    /// Calling this twice with identical arguments produces two distinct files.
    ///
    /// # Errors
    ///
    /// [`Error::SourceNotFound`] is returned synchronously, after
    /// `export_clicked` and `precheck_audio_loaded_result` have been logged,
    /// when `source` is missing or empty. Later failures are delivered by
    /// [`OperationHandle::wait`] as [`Error::TranscodeFailure`].
    pub fn export(
        &self,
        source: &Path,
        edits: EditDescriptor,
        profile: ExportProfile,
        destination_root: &Path,
    ) -> Result<ExportHandle> {
        let started = Local::now();
        let id = SessionId::generate(started);
        let kind = profile.kind();
        let log = SessionLog::open(&self.paths.logs_dir(), kind, &id)?;

        log.record(
            Stage::ExportClicked,
            json!({
                "source": source,
                "profile": profile,
                "tag": profile.tag(),
                "edits": edits,
                "destination_root": destination_root,
            }),
        );

        let source_bytes = std::fs::metadata(source)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len());
        log.record(
            Stage::PrecheckAudioLoadedResult,
            json!({
                "loaded": source_bytes.is_some_and(|b| b > 0),
                "bytes": source_bytes,
            }),
        );
        if !source_bytes.is_some_and(|b| b > 0) {
            let error = Error::SourceNotFound(source.to_path_buf());
            log.record(
                Stage::ExportFailure,
                json!({
                    "code": error.code(),
                    "error": error.to_string(),
                    "last_stage": Stage::PrecheckAudioLoadedResult,
                }),
            );
            warn!(session_id = %id, ?source, "export source missing or empty");
            return Err(error);
        }

        let meta = OperationMeta {
            id: id.clone(),
            kind,
            started_at: Utc::now(),
            log_path: log.path().to_path_buf(),
        };
        let cancel = CancellationToken::new();

        info!(session_id = %id, ?source, tag = %profile.tag(), "starting export");

        let task = task::ExportTask {
            pipeline: self.clone(),
            source: source.to_path_buf(),
            edits,
            profile,
            destination: PathResolver::new(destination_root),
            log,
            cancel: cancel.clone(),
            id,
            started,
        };
        Ok(OperationHandle::spawn(meta, cancel, move |tracker| {
            task.run(tracker)
        }))
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}
