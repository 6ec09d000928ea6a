//! Core types for clipforge

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

use crate::error::{Error, Result};

/// Unique identifier for one operation's session
///
/// Formatted as `YYYYMMDDTHHMMSS-xxxxxxxx` (local start time plus 32 random
/// bits) so log files sort chronologically and never collide in practice.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id for an operation starting at `now`
    pub fn generate(now: DateTime<Local>) -> Self {
        let suffix: u32 = rand::thread_rng().r#gen();
        Self(format!("{}-{:08x}", now.format("%Y%m%dT%H%M%S"), suffix))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of work an operation performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Remote download or local import into `downloads/`
    Download,
    /// Audio-only export into `exports/`
    ExportAudio,
    /// Black-screen video export into `exports/`
    ExportVideo,
}

impl OperationKind {
    /// Name used in log filenames (`logs/<kind>_<session>.log`)
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Download => "download",
            OperationKind::ExportAudio => "export_audio",
            OperationKind::ExportVideo => "export_video",
        }
    }

    /// Top-level directory under the data root that receives this kind's output
    pub fn output_dir_name(&self) -> &'static str {
        match self {
            OperationKind::Download => "downloads",
            OperationKind::ExportAudio | OperationKind::ExportVideo => "exports",
        }
    }
}

/// Coarse operation status shared by all operation kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created, not yet running
    Pending,
    /// Child process work in progress
    Running,
    /// Stopped at the user's request
    Cancelled,
    /// Finished with a published result
    Succeeded,
    /// Finished with an error
    Failed,
}

impl Status {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Cancelled | Status::Succeeded | Status::Failed)
    }
}

/// Acquisition state machine
///
/// `Idle -> Validating -> Downloading -> Extracting -> Resolved | Cancelled | Failed`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// Not started
    Idle,
    /// Checking the source reference
    Validating,
    /// Downloader running
    Downloading,
    /// Normalizing the acquired file into the target container
    Extracting,
    /// Final path resolved and published
    Resolved,
    /// Stopped at the user's request
    Cancelled,
    /// Stopped on error
    Failed,
}

impl AcquisitionState {
    /// Map to the shared [`Status`]
    pub fn status(&self) -> Status {
        match self {
            AcquisitionState::Idle => Status::Pending,
            AcquisitionState::Validating
            | AcquisitionState::Downloading
            | AcquisitionState::Extracting => Status::Running,
            AcquisitionState::Resolved => Status::Succeeded,
            AcquisitionState::Cancelled => Status::Cancelled,
            AcquisitionState::Failed => Status::Failed,
        }
    }
}

/// Export state machine
///
/// `Idle -> Preparing -> Transcoding -> Succeeded | Cancelled | Failed`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    /// Not started
    Idle,
    /// Resolving destination and building transcoder arguments
    Preparing,
    /// Transcoder running
    Transcoding,
    /// Output file published
    Succeeded,
    /// Stopped at the user's request
    Cancelled,
    /// Stopped on error
    Failed,
}

impl ExportState {
    /// Map to the shared [`Status`]
    pub fn status(&self) -> Status {
        match self {
            ExportState::Idle => Status::Pending,
            ExportState::Preparing | ExportState::Transcoding => Status::Running,
            ExportState::Succeeded => Status::Succeeded,
            ExportState::Cancelled => Status::Cancelled,
            ExportState::Failed => Status::Failed,
        }
    }
}

/// Session log stage vocabulary
///
/// The session logger accepts any string; the managers only ever write these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Export requested
    ExportClicked,
    /// Source file presence/size check
    PrecheckAudioLoadedResult,
    /// Export preparation started
    WavExportStart,
    /// Source file readability probe
    WavWorkerFetchTest,
    /// Transcoder parameter set and destination ready
    WavBlobReady,
    /// Transcoder spawned; its output lines are logged under this stage
    BackendFfmpegStart,
    /// Transcoder exited
    BackendFfmpegExit,
    /// Export published
    ExportSuccess,
    /// Export failed
    ExportFailure,
    /// Download requested
    DownloadStart,
    /// Downloader format selection fixed
    FormatSelected,
    /// Downloader running; its output lines are logged under this stage
    DownloadProgress,
    /// Normalization pass started; transcoder output is logged under this stage
    ExtractStart,
    /// Normalization pass finished
    ExtractExit,
    /// Download published
    DownloadSuccess,
    /// Download failed or was cancelled
    DownloadFailure,
}

impl Stage {
    /// Wire name written to the session log
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ExportClicked => "export_clicked",
            Stage::PrecheckAudioLoadedResult => "precheck_audio_loaded_result",
            Stage::WavExportStart => "wav_export_start",
            Stage::WavWorkerFetchTest => "wav_worker_fetch_test",
            Stage::WavBlobReady => "wav_blob_ready",
            Stage::BackendFfmpegStart => "backend_ffmpeg_start",
            Stage::BackendFfmpegExit => "backend_ffmpeg_exit",
            Stage::ExportSuccess => "export_success",
            Stage::ExportFailure => "export_failure",
            Stage::DownloadStart => "download_start",
            Stage::FormatSelected => "format_selected",
            Stage::DownloadProgress => "download_progress",
            Stage::ExtractStart => "extract_start",
            Stage::ExtractExit => "extract_exit",
            Stage::DownloadSuccess => "download_success",
            Stage::DownloadFailure => "download_failure",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where acquired audio comes from
///
/// Exactly one of URL or local file: the enum makes the other impossible.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SourceReference {
    /// Remote page or media URL handed to the downloader
    Remote(Url),
    /// Local file imported through the transcoder
    Local(PathBuf),
}

impl SourceReference {
    /// Parse a user-supplied string: `http(s)://` becomes [`SourceReference::Remote`],
    /// anything else is treated as a local path
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidSource {
                source_ref: input.to_string(),
                reason: "empty source".to_string(),
            });
        }

        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(trimmed).map_err(|e| Error::InvalidSource {
                source_ref: trimmed.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(SourceReference::Remote(url));
        }

        Ok(SourceReference::Local(PathBuf::from(trimmed)))
    }
}

impl std::fmt::Display for SourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceReference::Remote(url) => write!(f, "{url}"),
            SourceReference::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Audio container produced by downloads and audio exports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioContainer {
    /// AAC in an MPEG-4 container
    M4a,
    /// 16-bit PCM WAV
    Wav,
}

impl AudioContainer {
    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            AudioContainer::M4a => "m4a",
            AudioContainer::Wav => "wav",
        }
    }

    /// Match a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "m4a" => Some(AudioContainer::M4a),
            "wav" => Some(AudioContainer::Wav),
            _ => None,
        }
    }
}

/// Width of the black-screen video profile
pub const VIDEO_WIDTH: u32 = 1080;
/// Height of the black-screen video profile
pub const VIDEO_HEIGHT: u32 = 1920;
/// Frame rate of the black-screen video profile
pub const VIDEO_FPS: u32 = 30;

/// Export target
///
/// Video parameters are constants of the profile and never derived from the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "container", rename_all = "snake_case")]
pub enum ExportProfile {
    /// Audio-only file
    Audio(AudioContainer),
    /// Black 1080x1920 30fps H.264 video with AAC audio in MP4
    BlackScreenVideo,
}

impl ExportProfile {
    /// Operation kind this profile produces
    pub fn kind(&self) -> OperationKind {
        match self {
            ExportProfile::Audio(_) => OperationKind::ExportAudio,
            ExportProfile::BlackScreenVideo => OperationKind::ExportVideo,
        }
    }

    /// Tag embedded between the timestamp and the extension of the output name
    pub fn tag(&self) -> String {
        match self {
            ExportProfile::Audio(_) => "audio".to_string(),
            ExportProfile::BlackScreenVideo => {
                format!("{VIDEO_WIDTH}x{VIDEO_HEIGHT}_{VIDEO_FPS}fps__black")
            }
        }
    }

    /// Output file extension
    pub fn extension(&self) -> &'static str {
        match self {
            ExportProfile::Audio(container) => container.extension(),
            ExportProfile::BlackScreenVideo => "mp4",
        }
    }
}

/// Snapshot of one operation, as shown to the UI collaborator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    /// Session id (also names the session log)
    pub id: SessionId,
    /// What the operation does
    pub kind: OperationKind,
    /// When the operation was created
    pub started_at: DateTime<Utc>,
    /// Current status
    pub status: Status,
    /// Session log path
    pub log_path: PathBuf,
}

/// Which output stream a child process line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl OutputStream {
    /// Lowercase stream name
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Event emitted during operation lifecycles
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Acquisition state changed
    Acquisition {
        /// Session id
        id: SessionId,
        /// New state
        state: AcquisitionState,
    },

    /// Export state changed
    Export {
        /// Session id
        id: SessionId,
        /// New state
        state: ExportState,
    },

    /// Child process produced a line (liveness signal for watchdogs)
    Output {
        /// Session id
        id: SessionId,
        /// Stream the line came from
        stream: OutputStream,
        /// The line, without trailing newline
        line: String,
    },

    /// Operation finished with a published file
    Finished {
        /// Session id
        id: SessionId,
        /// Operation kind
        kind: OperationKind,
        /// Published file
        path: PathBuf,
    },

    /// Operation was cancelled
    Cancelled {
        /// Session id
        id: SessionId,
        /// Operation kind
        kind: OperationKind,
    },

    /// Operation failed
    Failed {
        /// Session id
        id: SessionId,
        /// Operation kind
        kind: OperationKind,
        /// Last stage written before the failure
        stage: String,
        /// Error message
        error: String,
        /// Session log to inspect
        log_path: PathBuf,
    },
}
