//! Error types for clipforge
//!
//! This module provides the error taxonomy shared by every subsystem:
//! - Source and validation errors, rejected before any process spawns
//! - Process-boundary errors carrying the exit code and the tail of captured output
//! - Operation-level failures carrying the last reached session-log stage
//! - A serializable [`ErrorReport`] for the UI collaborator
//!
//! Cancellation is deliberately absent here: a cancelled operation resolves to
//! an outcome value, not an error.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for clipforge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for clipforge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "source_pattern")
        key: Option<String>,
    },

    /// The source URL or file does not match what the acquisition manager accepts
    #[error("invalid source {source_ref}: {reason}")]
    InvalidSource {
        /// The rejected URL or path, as given
        source_ref: String,
        /// Why the source was rejected
        reason: String,
    },

    /// The downloader could not satisfy the audio-only format selection
    #[error("no audio-only format available for {url}")]
    FormatUnavailable {
        /// The URL whose formats were inspected
        url: String,
    },

    /// Another download is already running on this manager
    #[error("an operation is already running (session {session_id})")]
    AlreadyRunning {
        /// Session id of the running operation
        session_id: String,
    },

    /// External tool exited with a non-zero status
    #[error("{program} exited with {}", describe_exit(.exit_code))]
    ProcessFailure {
        /// The program that was run
        program: String,
        /// Exit code (None when terminated by a signal)
        exit_code: Option<i32>,
        /// Last lines of combined stdout/stderr output
        last_lines: Vec<String>,
    },

    /// External tool produced no output for longer than the configured stall timeout
    #[error("{program} produced no output for {idle:?}")]
    Stalled {
        /// The program that was terminated
        program: String,
        /// How long the process was silent before termination
        idle: Duration,
    },

    /// Export failed after the session log was opened (non-zero exit, empty output, I/O)
    #[error("transcode failed at stage {last_stage}: {reason}")]
    TranscodeFailure {
        /// Last stage written to the session log before the failure was recorded
        last_stage: String,
        /// What went wrong, in one line
        reason: String,
        /// Last lines of transcoder output
        last_lines: Vec<String>,
        /// Session log holding the full record
        log_path: PathBuf,
    },

    /// Download or import failed after the session log was opened
    #[error("download failed at stage {last_stage}: {source}")]
    DownloadFailure {
        /// Last stage written to the session log before the failure was recorded
        last_stage: String,
        /// Session log holding the full record
        log_path: PathBuf,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Edit parameters are outside their domain bounds
    #[error("invalid edit parameters: {0}")]
    Validation(#[from] ValidationError),

    /// A required external tool could not be located
    #[error("required tool `{tool}` not found")]
    ToolMissing {
        /// Tool name (e.g., "ffmpeg")
        tool: String,
    },

    /// The source file for an export or import does not exist or is empty
    #[error("source file not found or empty: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Edit descriptor bound violations
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    /// A parameter is NaN or infinite
    #[error("{field} must be a finite number")]
    NotFinite {
        /// Offending parameter name
        field: String,
    },

    /// Trim start or end is negative
    #[error("{field} must not be negative (got {value})")]
    Negative {
        /// Offending parameter name
        field: String,
        /// The rejected value
        value: f64,
    },

    /// Trim start lies after trim end
    #[error("trim start {trim_start}s is after trim end {trim_end}s")]
    TrimOrder {
        /// Requested trim start in seconds
        trim_start: f64,
        /// Requested trim end in seconds
        trim_end: f64,
    },

    /// Trim end lies beyond the known source duration
    #[error("trim end {trim_end}s exceeds source duration {source_duration}s")]
    TrimBeyondSource {
        /// Requested trim end in seconds
        trim_end: f64,
        /// Known source duration in seconds
        source_duration: f64,
    },

    /// Volume outside [0.0, 2.0]
    #[error("volume {volume} is outside [{min}, {max}]")]
    VolumeOutOfRange {
        /// The rejected volume
        volume: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// Fade length outside [0, 5] seconds
    #[error("{field} {value}s is outside [0, {max}]s")]
    FadeOutOfRange {
        /// Offending parameter name
        field: String,
        /// The rejected value
        value: f64,
        /// Upper bound in seconds
        max: f64,
    },

    /// Fade-in and fade-out together exceed the trimmed clip
    #[error("fades total {total}s but the clip is only {clip}s long")]
    FadesExceedClip {
        /// fade_in + fade_out in seconds
        total: f64,
        /// trim_end - trim_start in seconds
        clip: f64,
    },
}

impl Error {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidSource { .. } => "invalid_source",
            Error::FormatUnavailable { .. } => "format_unavailable",
            Error::AlreadyRunning { .. } => "already_running",
            Error::ProcessFailure { .. } => "process_failure",
            Error::Stalled { .. } => "stalled",
            Error::TranscodeFailure { .. } => "transcode_failure",
            // Report the cause, not the wrapper
            Error::DownloadFailure { source, .. } => source.code(),
            Error::Validation(_) => "validation_error",
            Error::ToolMissing { .. } => "tool_missing",
            Error::SourceNotFound(_) => "source_not_found",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Last session-log stage attached to this error, if it was raised inside an operation
    pub fn last_stage(&self) -> Option<&str> {
        match self {
            Error::TranscodeFailure { last_stage, .. } | Error::DownloadFailure { last_stage, .. } => {
                Some(last_stage)
            }
            _ => None,
        }
    }

    /// Tail of external tool output carried by this error (empty if none)
    pub fn last_lines(&self) -> &[String] {
        match self {
            Error::ProcessFailure { last_lines, .. } | Error::TranscodeFailure { last_lines, .. } => {
                last_lines
            }
            Error::DownloadFailure { source, .. } => source.last_lines(),
            _ => &[],
        }
    }

    /// Innermost cause, unwrapping operation-level wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::DownloadFailure { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Failure summary handed to the UI collaborator
///
/// Carries everything needed to show "what broke and where to look" without
/// exposing raw process output as the primary message.
///
/// # Example JSON
///
/// ```json
/// {
///   "code": "transcode_failure",
///   "message": "transcode failed at stage backend_ffmpeg_exit: ffmpeg exited with exit code 1",
///   "stage": "backend_ffmpeg_exit",
///   "log_path": "/data/logs/export_audio_20261017T101500-1a2b3c4d.log"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Last reached session-log stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Session log to point the user at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl From<&Error> for ErrorReport {
    fn from(error: &Error) -> Self {
        let log_path = match error {
            Error::TranscodeFailure { log_path, .. } | Error::DownloadFailure { log_path, .. } => {
                Some(log_path.clone())
            }
            _ => None,
        };

        ErrorReport {
            code: error.code().to_string(),
            message: error.to_string(),
            stage: error.last_stage().map(str::to_string),
            log_path,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn process_failure() -> Error {
        Error::ProcessFailure {
            program: "yt-dlp".into(),
            exit_code: Some(1),
            last_lines: vec!["ERROR: unable to download".into()],
        }
    }

    #[test]
    fn process_failure_message_includes_exit_code() {
        assert_eq!(process_failure().to_string(), "yt-dlp exited with exit code 1");

        let signalled = Error::ProcessFailure {
            program: "ffmpeg".into(),
            exit_code: None,
            last_lines: vec![],
        };
        assert!(signalled.to_string().contains("terminated by signal"));
    }

    #[test]
    fn download_failure_reports_cause_code_and_stage() {
        let err = Error::DownloadFailure {
            last_stage: "download_progress".into(),
            log_path: PathBuf::from("/tmp/logs/download_x.log"),
            source: Box::new(Error::FormatUnavailable {
                url: "https://example.com/a".into(),
            }),
        };

        assert_eq!(err.code(), "format_unavailable");
        assert_eq!(err.last_stage(), Some("download_progress"));
        assert!(matches!(err.root(), Error::FormatUnavailable { .. }));
    }

    #[test]
    fn last_lines_reach_through_download_wrapper() {
        let err = Error::DownloadFailure {
            last_stage: "download_progress".into(),
            log_path: PathBuf::from("/tmp/x.log"),
            source: Box::new(process_failure()),
        };
        assert_eq!(err.last_lines(), ["ERROR: unable to download".to_string()]);
    }

    #[test]
    fn report_from_transcode_failure_carries_stage_and_log() {
        let err = Error::TranscodeFailure {
            last_stage: "backend_ffmpeg_exit".into(),
            reason: "ffmpeg exited with exit code 1".into(),
            last_lines: vec!["Invalid argument".into()],
            log_path: PathBuf::from("/data/logs/export_audio_1.log"),
        };

        let report = ErrorReport::from(&err);
        assert_eq!(report.code, "transcode_failure");
        assert_eq!(report.stage.as_deref(), Some("backend_ffmpeg_exit"));
        assert_eq!(
            report.message,
            "transcode failed at stage backend_ffmpeg_exit: ffmpeg exited with exit code 1"
        );
        assert_eq!(
            report.log_path,
            Some(PathBuf::from("/data/logs/export_audio_1.log"))
        );
    }

    #[test]
    fn report_without_stage_omits_optional_fields() {
        let err = Error::ToolMissing {
            tool: "ffmpeg".into(),
        };
        let json = serde_json::to_value(ErrorReport::from(&err)).unwrap();

        assert_eq!(json["code"], "tool_missing");
        assert!(json.get("stage").is_none());
        assert!(json.get("log_path").is_none());
    }

    #[test]
    fn validation_error_converts_into_error() {
        let err: Error = ValidationError::TrimOrder {
            trim_start: 5.0,
            trim_end: 1.0,
        }
        .into();
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("trim start 5s is after trim end 1s"));
    }
}
