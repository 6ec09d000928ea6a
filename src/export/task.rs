//! Stage sequence of one export

use super::transcode::{audio_filter_chain, build_transcode_command};
use super::{ExportOutcome, ExportPipeline, ExportedFile};
use crate::edit::EditDescriptor;
use crate::error::{Error, ErrorReport, Result};
use crate::operation::{Outcome, StateTracker};
use crate::paths::{PathResolver, reserve_path};
use crate::process::LogTap;
use crate::session_log::SessionLog;
use crate::types::{Event, ExportProfile, ExportState, OutputStream, SessionId, Stage};
use chrono::{DateTime, Local};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes read from the source to prove it is readable
const READ_PROBE_BYTES: usize = 4096;

pub(super) struct ExportTask {
    pub(super) pipeline: ExportPipeline,
    pub(super) source: PathBuf,
    pub(super) edits: EditDescriptor,
    pub(super) profile: ExportProfile,
    pub(super) destination: PathResolver,
    pub(super) log: SessionLog,
    pub(super) cancel: CancellationToken,
    pub(super) id: SessionId,
    pub(super) started: DateTime<Local>,
}

impl ExportTask {
    pub(super) async fn run(self, tracker: StateTracker<ExportState>) -> Result<ExportOutcome> {
        let clock = Instant::now();
        let mut output = None;
        let result = self.execute(&tracker, &mut output, clock).await;

        match result {
            Ok(Outcome::Completed(file)) => {
                self.log.record(
                    Stage::ExportSuccess,
                    json!({
                        "path": file.file_path,
                        "duration_ms": file.duration.as_millis() as u64,
                    }),
                );
                self.transition(&tracker, ExportState::Succeeded);
                info!(session_id = %self.id, path = ?file.file_path, "export succeeded");
                self.pipeline.emit_event(Event::Finished {
                    id: self.id.clone(),
                    kind: self.profile.kind(),
                    path: file.file_path.clone(),
                });
                Ok(Outcome::Completed(file))
            }
            Ok(Outcome::Cancelled) => {
                discard(output.as_deref()).await;
                self.log.record(
                    Stage::ExportFailure,
                    json!({ "cancelled": true, "state": tracker.get() }),
                );
                self.transition(&tracker, ExportState::Cancelled);
                info!(session_id = %self.id, "export cancelled");
                self.pipeline.emit_event(Event::Cancelled {
                    id: self.id.clone(),
                    kind: self.profile.kind(),
                });
                Ok(Outcome::Cancelled)
            }
            Err(cause) => {
                let last_stage = self
                    .log
                    .last_stage()
                    .unwrap_or_else(|| Stage::ExportClicked.to_string());
                discard(output.as_deref()).await;

                let error = if matches!(cause, Error::TranscodeFailure { .. }) {
                    cause
                } else {
                    Error::TranscodeFailure {
                        last_stage: last_stage.clone(),
                        reason: cause.to_string(),
                        last_lines: cause.last_lines().to_vec(),
                        log_path: self.log.path().to_path_buf(),
                    }
                };
                let report = ErrorReport::from(&error);
                self.log.record(
                    Stage::ExportFailure,
                    json!({
                        "code": report.code,
                        "error": report.message,
                        "last_stage": report.stage,
                        "last_lines": error.last_lines(),
                    }),
                );
                self.transition(&tracker, ExportState::Failed);
                warn!(session_id = %self.id, %last_stage, error = %error, "export failed");

                self.pipeline.emit_event(Event::Failed {
                    id: self.id.clone(),
                    kind: self.profile.kind(),
                    stage: report.stage.unwrap_or(last_stage),
                    error: report.message,
                    log_path: self.log.path().to_path_buf(),
                });
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        tracker: &StateTracker<ExportState>,
        output: &mut Option<PathBuf>,
        clock: Instant,
    ) -> Result<ExportOutcome> {
        self.transition(tracker, ExportState::Preparing);
        self.log.record(
            Stage::WavExportStart,
            json!({
                "kind": self.profile.kind(),
                "clip_duration": self.edits.clip_duration(),
            }),
        );

        let probed = probe_source(&self.source).await?;
        self.log.record(
            Stage::WavWorkerFetchTest,
            json!({ "ok": true, "bytes_read": probed }),
        );

        let settings = &self.pipeline.config.export;
        let resolved = self.destination.resolve_destination(
            self.profile.kind(),
            &settings.file_prefix,
            &self.profile.tag(),
            self.profile.extension(),
            self.started,
        )?;
        let target = reserve_path(&resolved.full_path)?;
        *output = Some(target.clone());

        let command = build_transcode_command(
            &self.pipeline.tools.transcoder,
            &self.source,
            &self.edits,
            self.profile,
            &target,
            settings.audio_bitrate_kbps,
        );
        self.log.record(
            Stage::WavBlobReady,
            json!({
                "output": target,
                "filter": audio_filter_chain(&self.edits),
                "trim_start": self.edits.trim_start(),
                "trim_end": self.edits.trim_end(),
            }),
        );

        if self.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        self.transition(tracker, ExportState::Transcoding);
        self.log.record(
            Stage::BackendFfmpegStart,
            json!({
                "program": command.program(),
                "args": command.display_args(),
            }),
        );

        let result = self
            .pipeline
            .runner
            .run(
                &command,
                Some(LogTap {
                    log: &self.log,
                    stage: Stage::BackendFfmpegStart,
                }),
                |stream, line| self.forward_output(stream, line),
                &self.cancel,
            )
            .await;

        let exit = match result {
            Ok(exit) => exit,
            Err(e) => {
                let exit_code = match &e {
                    Error::ProcessFailure { exit_code, .. } => *exit_code,
                    _ => None,
                };
                self.log.record(
                    Stage::BackendFfmpegExit,
                    json!({
                        "exit_code": exit_code,
                        "error": e.to_string(),
                        "last_lines": e.last_lines(),
                    }),
                );
                return Err(self.failure(&e));
            }
        };

        if exit.is_cancelled() {
            self.log.record(
                Stage::BackendFfmpegExit,
                json!({ "cancelled": true, "duration_ms": exit.duration().as_millis() as u64 }),
            );
            return Ok(Outcome::Cancelled);
        }

        let bytes = tokio::fs::metadata(&target)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        self.log.record(
            Stage::BackendFfmpegExit,
            json!({
                "exit_code": 0,
                "duration_ms": exit.duration().as_millis() as u64,
                "output_bytes": bytes,
            }),
        );
        if bytes == 0 {
            return Err(Error::TranscodeFailure {
                last_stage: Stage::BackendFfmpegExit.to_string(),
                reason: format!("{} is missing or empty", target.display()),
                last_lines: Vec::new(),
                log_path: self.log.path().to_path_buf(),
            });
        }

        Ok(Outcome::Completed(ExportedFile {
            file_path: target,
            profile: self.profile,
            duration: clock.elapsed(),
        }))
    }

    /// Attach the current stage to a transcoder-level error
    fn failure(&self, cause: &Error) -> Error {
        Error::TranscodeFailure {
            last_stage: self
                .log
                .last_stage()
                .unwrap_or_else(|| Stage::BackendFfmpegExit.to_string()),
            reason: cause.to_string(),
            last_lines: cause.last_lines().to_vec(),
            log_path: self.log.path().to_path_buf(),
        }
    }

    fn transition(&self, tracker: &StateTracker<ExportState>, state: ExportState) {
        tracker.set(state);
        debug!(session_id = %self.id, ?state, "export state");
        self.pipeline.emit_event(Event::Export {
            id: self.id.clone(),
            state,
        });
    }

    fn forward_output(&self, stream: OutputStream, line: &str) {
        self.pipeline.emit_event(Event::Output {
            id: self.id.clone(),
            stream,
            line: line.to_string(),
        });
    }
}

/// Read the head of the source to prove it is still there and readable
async fn probe_source(source: &Path) -> Result<usize> {
    let mut file = tokio::fs::File::open(source).await?;
    let mut buf = vec![0u8; READ_PROBE_BYTES];
    let read = file.read(&mut buf).await?;
    if read == 0 {
        return Err(Error::SourceNotFound(source.to_path_buf()));
    }
    Ok(read)
}

/// Best-effort removal of a partial output; it is never published
async fn discard(output: Option<&Path>) {
    let Some(path) = output else {
        return;
    };
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(?path, "removed partial export"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(?path, error = %e, "could not remove partial export"),
    }
}
