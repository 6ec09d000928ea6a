//! Stage sequence of one acquisition
//!
//! Every path out of [`AcquisitionTask::run`] writes exactly one terminal
//! session log record (`download_success` or `download_failure`) and one
//! terminal [`Event`].

use super::commands::{
    build_download_command, build_normalize_command, is_format_miss, is_scratch_file,
};
use super::{AUDIO_FORMAT_SELECTOR, AcquiredFile, AcquisitionManager, ActiveSlot, DownloadOutcome};
use crate::error::{Error, ErrorReport, Result};
use crate::operation::{Outcome, StateTracker};
use crate::paths::{MARKER_FILE_NAME, reserve_path};
use crate::process::LogTap;
use crate::session_log::SessionLog;
use crate::types::{
    AcquisitionState, AudioContainer, Event, OperationKind, OutputStream, SessionId,
    SourceReference, Stage,
};
use chrono::{DateTime, Local};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// File name tag of remote downloads
const REMOTE_TAG: &str = "bestaudio";
/// File name tag of local imports
const IMPORT_TAG: &str = "import";
/// Appended to the reserved stem for the downloader's own files, which must
/// not collide with the placeholder under `--no-overwrites`
const DOWNLOAD_STEM_SUFFIX: &str = ".dl";

pub(super) struct AcquisitionTask {
    pub(super) manager: AcquisitionManager,
    pub(super) source: SourceReference,
    pub(super) log: SessionLog,
    pub(super) cancel: CancellationToken,
    pub(super) id: SessionId,
    pub(super) started: DateTime<Local>,
    pub(super) _slot: ActiveSlot,
}

/// Files this operation may have left behind: everything named `<stem>.*` in `directory`
#[derive(Default)]
struct Scratch {
    location: Option<(PathBuf, String)>,
}

impl AcquisitionTask {
    pub(super) async fn run(
        self,
        tracker: StateTracker<AcquisitionState>,
    ) -> Result<DownloadOutcome> {
        let clock = Instant::now();
        let mut scratch = Scratch::default();
        let result = self.execute(&tracker, &mut scratch, clock).await;

        match result {
            Ok(Outcome::Completed(file)) => {
                self.log.record(
                    Stage::DownloadSuccess,
                    json!({
                        "path": file.file_path,
                        "duration_ms": file.duration.as_millis() as u64,
                    }),
                );
                self.transition(&tracker, AcquisitionState::Resolved);
                info!(session_id = %self.id, path = ?file.file_path, "acquisition resolved");
                self.manager.emit_event(Event::Finished {
                    id: self.id.clone(),
                    kind: OperationKind::Download,
                    path: file.file_path.clone(),
                });
                Ok(Outcome::Completed(file))
            }
            Ok(Outcome::Cancelled) => {
                let interrupted = tracker.get();
                remove_scratch(&scratch).await;
                self.log.record(
                    Stage::DownloadFailure,
                    json!({ "cancelled": true, "state": interrupted }),
                );
                self.transition(&tracker, AcquisitionState::Cancelled);
                info!(session_id = %self.id, ?interrupted, "acquisition cancelled");
                self.manager.emit_event(Event::Cancelled {
                    id: self.id.clone(),
                    kind: OperationKind::Download,
                });
                Ok(Outcome::Cancelled)
            }
            Err(cause) => {
                let last_stage = self
                    .log
                    .last_stage()
                    .unwrap_or_else(|| Stage::DownloadStart.to_string());
                remove_scratch(&scratch).await;
                let report = ErrorReport::from(&cause);
                self.log.record(
                    Stage::DownloadFailure,
                    json!({
                        "code": report.code,
                        "error": report.message,
                        "last_stage": last_stage,
                        "last_lines": cause.last_lines(),
                    }),
                );
                self.transition(&tracker, AcquisitionState::Failed);
                warn!(session_id = %self.id, %last_stage, error = %cause, "acquisition failed");

                let error = Error::DownloadFailure {
                    last_stage,
                    log_path: self.log.path().to_path_buf(),
                    source: Box::new(cause),
                };
                self.manager.emit_event(Event::Failed {
                    id: self.id.clone(),
                    kind: OperationKind::Download,
                    stage: error.last_stage().unwrap_or_default().to_string(),
                    error: error.to_string(),
                    log_path: self.log.path().to_path_buf(),
                });
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        tracker: &StateTracker<AcquisitionState>,
        scratch: &mut Scratch,
        clock: Instant,
    ) -> Result<DownloadOutcome> {
        self.transition(tracker, AcquisitionState::Validating);
        let settings = &self.manager.config.download;
        let container = settings.audio_container;

        let (origin, tag) = match &self.source {
            SourceReference::Remote(_) => ("remote", REMOTE_TAG),
            SourceReference::Local(_) => ("local", IMPORT_TAG),
        };
        self.log.record(
            Stage::DownloadStart,
            json!({ "source": self.source.to_string(), "origin": origin }),
        );

        let resolved = self.manager.paths.resolve_destination(
            OperationKind::Download,
            &settings.file_prefix,
            tag,
            container.extension(),
            self.started,
        )?;
        // Claimed on disk so no other operation, on any manager, gets this stem
        let target = reserve_path(&resolved.full_path)?;
        let stem = target
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Other(format!("unusable destination {}", target.display())))?
            .to_string();
        scratch.location = Some((resolved.directory.clone(), stem.clone()));

        let produced = match &self.source {
            SourceReference::Remote(url) => {
                self.log.record(
                    Stage::FormatSelected,
                    json!({
                        "format": AUDIO_FORMAT_SELECTOR,
                        "playlist": settings.allow_playlist,
                        "container": container.extension(),
                    }),
                );
                let download_stem = format!("{stem}{DOWNLOAD_STEM_SUFFIX}");
                let command = build_download_command(
                    &self.manager.tools.downloader,
                    url.as_str(),
                    &resolved.directory,
                    &download_stem,
                    settings.allow_playlist,
                );

                self.transition(tracker, AcquisitionState::Downloading);
                let exit = self
                    .manager
                    .runner
                    .run(
                        &command,
                        Some(LogTap {
                            log: &self.log,
                            stage: Stage::DownloadProgress,
                        }),
                        |stream, line| self.forward_output(stream, line),
                        &self.cancel,
                    )
                    .await
                    .map_err(|e| match e {
                        Error::ProcessFailure { ref last_lines, .. } if is_format_miss(last_lines) => {
                            Error::FormatUnavailable {
                                url: url.to_string(),
                            }
                        }
                        other => other,
                    })?;
                if exit.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }

                find_download(&resolved.directory, &download_stem).await?
            }
            SourceReference::Local(path) => {
                super::validate_local_file(path)?;
                self.log.record(
                    Stage::FormatSelected,
                    json!({
                        "container": container.extension(),
                        "source_extension": path.extension().map(|e| e.to_string_lossy()),
                    }),
                );
                path.clone()
            }
        };

        if self.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        self.transition(tracker, AcquisitionState::Extracting);
        if self.extract(&produced, &target, container).await?.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let size = tokio::fs::metadata(&target)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            return Err(Error::Other(format!(
                "acquired file {} is missing or empty",
                target.display()
            )));
        }

        if self.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let marker = self.manager.paths.marker_path(self.started.date_naive());
        write_marker(&marker, &target, &self.id).await?;

        Ok(Outcome::Completed(AcquiredFile {
            file_path: target,
            duration: clock.elapsed(),
        }))
    }

    /// Bring `produced` into `container` at `target`
    async fn extract(
        &self,
        produced: &Path,
        target: &Path,
        container: AudioContainer,
    ) -> Result<Outcome<()>> {
        let produced_container = produced
            .extension()
            .and_then(|e| e.to_str())
            .and_then(AudioContainer::from_extension);
        let is_import = matches!(self.source, SourceReference::Local(_));

        if produced_container == Some(container) {
            self.log.record(
                Stage::ExtractStart,
                json!({ "input": produced, "output": target, "mode": "copy" }),
            );
            // Both replace the reserved placeholder
            if is_import {
                tokio::fs::copy(produced, target).await?;
            } else {
                tokio::fs::rename(produced, target).await?;
            }
            self.log
                .record(Stage::ExtractExit, json!({ "mode": "copy", "exit_code": 0 }));
            return Ok(Outcome::Completed(()));
        }

        let command = build_normalize_command(
            &self.manager.tools.transcoder,
            produced,
            target,
            container,
            self.manager.config.export.audio_bitrate_kbps,
        );
        self.log.record(
            Stage::ExtractStart,
            json!({
                "input": produced,
                "output": target,
                "mode": "transcode",
                "args": command.display_args(),
            }),
        );

        let result = self
            .manager
            .runner
            .run(
                &command,
                Some(LogTap {
                    log: &self.log,
                    stage: Stage::ExtractStart,
                }),
                |stream, line| self.forward_output(stream, line),
                &self.cancel,
            )
            .await;

        match result {
            Ok(exit) if exit.is_cancelled() => {
                self.log.record(
                    Stage::ExtractExit,
                    json!({ "cancelled": true, "duration_ms": exit.duration().as_millis() as u64 }),
                );
                Ok(Outcome::Cancelled)
            }
            Ok(exit) => {
                self.log.record(
                    Stage::ExtractExit,
                    json!({ "exit_code": 0, "duration_ms": exit.duration().as_millis() as u64 }),
                );
                if !is_import && let Err(e) = tokio::fs::remove_file(produced).await {
                    debug!(path = ?produced, error = %e, "could not remove pre-normalization file");
                }
                Ok(Outcome::Completed(()))
            }
            Err(e) => {
                let exit_code = match &e {
                    Error::ProcessFailure { exit_code, .. } => *exit_code,
                    _ => None,
                };
                self.log.record(
                    Stage::ExtractExit,
                    json!({ "exit_code": exit_code, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    fn transition(&self, tracker: &StateTracker<AcquisitionState>, state: AcquisitionState) {
        tracker.set(state);
        debug!(session_id = %self.id, ?state, "acquisition state");
        self.manager.emit_event(Event::Acquisition {
            id: self.id.clone(),
            state,
        });
    }

    fn forward_output(&self, stream: OutputStream, line: &str) {
        self.manager.emit_event(Event::Output {
            id: self.id.clone(),
            stream,
            line: line.to_string(),
        });
    }
}

/// The file the downloader wrote for `stem`, ignoring its scratch files
async fn find_download(directory: &Path, stem: &str) -> Result<PathBuf> {
    let mut found = owned_files(directory, stem)
        .await?
        .into_iter()
        .filter(|p| !is_scratch_file(p))
        .collect::<Vec<_>>();
    found.sort();

    found.into_iter().next().ok_or_else(|| {
        Error::Other(format!(
            "downloader exited successfully but wrote no {stem}.* file in {}",
            directory.display()
        ))
    })
}

/// Every `<stem>.*` file in `directory`
async fn owned_files(directory: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{stem}.");
    let mut entries = tokio::fs::read_dir(directory).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(&prefix)
            && entry.file_type().await?.is_file()
        {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// Best-effort removal of partial output; never published, so failures are only logged
async fn remove_scratch(scratch: &Scratch) {
    let Some((directory, stem)) = &scratch.location else {
        return;
    };
    let files = match owned_files(directory, stem).await {
        Ok(files) => files,
        Err(e) => {
            debug!(?directory, error = %e, "could not scan for partial output");
            return;
        }
    };
    for file in files {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => debug!(path = ?file, "removed partial output"),
            Err(e) => debug!(path = ?file, error = %e, "could not remove partial output"),
        }
    }
}

/// Overwrite the marker with the absolute path of `target`
///
/// Written through a sibling temp file and a rename so readers never see a
/// half-written line.
async fn write_marker(marker: &Path, target: &Path, id: &SessionId) -> Result<()> {
    let absolute = std::path::absolute(target)?;
    let mut line = absolute.to_string_lossy().into_owned();
    line.push('\n');

    let staging = marker.with_file_name(format!(".{MARKER_FILE_NAME}.{id}.tmp"));
    tokio::fs::write(&staging, line).await?;
    tokio::fs::rename(&staging, marker).await?;
    debug!(?marker, path = ?absolute, "updated last download marker");
    Ok(())
}
