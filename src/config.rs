//! Configuration types for clipforge

use crate::error::{Error, Result};
use crate::types::AudioContainer;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// External tool paths (downloader, transcoder)
///
/// Groups settings for external binaries.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the downloader executable (auto-detected if None)
    #[serde(default)]
    pub downloader_path: Option<PathBuf>,

    /// Path to the transcoder executable (auto-detected if None)
    #[serde(default)]
    pub transcoder_path: Option<PathBuf>,

    /// Downloader executable name used for auto-detection (default: "yt-dlp")
    #[serde(default = "default_downloader_name")]
    pub downloader_name: String,

    /// Transcoder executable name used for auto-detection (default: "ffmpeg")
    #[serde(default = "default_transcoder_name")]
    pub transcoder_name: String,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            downloader_path: None,
            transcoder_path: None,
            downloader_name: default_downloader_name(),
            transcoder_name: default_transcoder_name(),
            search_path: true,
        }
    }
}

/// Download behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Regular expression a source URL must match (default: any http(s) URL with a path)
    #[serde(default = "default_source_pattern")]
    pub source_pattern: String,

    /// Allow the downloader to expand playlists / multi-video pages (default: false)
    #[serde(default)]
    pub allow_playlist: bool,

    /// Container every acquired file is normalized to (default: m4a)
    #[serde(default = "default_download_container")]
    pub audio_container: AudioContainer,

    /// Filename prefix for acquired files (default: "download")
    #[serde(default = "default_download_prefix")]
    pub file_prefix: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            source_pattern: default_source_pattern(),
            allow_playlist: false,
            audio_container: default_download_container(),
            file_prefix: default_download_prefix(),
        }
    }
}

/// Export behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Filename prefix for exported files (default: "export")
    #[serde(default = "default_export_prefix")]
    pub file_prefix: String,

    /// AAC bitrate in kbit/s for m4a and video exports (default: 192)
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            file_prefix: default_export_prefix(),
            audio_bitrate_kbps: default_audio_bitrate(),
        }
    }
}

/// Child process supervision settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Number of trailing output lines kept for failure reports (default: 20)
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Terminate a child that stays silent this long (None = never, the default)
    #[serde(default)]
    pub stall_timeout: Option<Duration>,

    /// Time between the polite termination signal and a hard kill (default: 2s)
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
            stall_timeout: None,
            terminate_grace: default_terminate_grace(),
        }
    }
}

/// Main configuration for clipforge
///
/// Fields are organized into logical sub-configs:
/// - [`tools`](ToolsConfig) - external binary paths
/// - [`download`](DownloadConfig) - source validation and acquisition output
/// - [`export`](ExportConfig) - export naming and encoder settings
/// - [`process`](ProcessConfig) - child process supervision
///
/// The app-data root is injected here and never read from ambient state, so
/// tests can point the whole core at a temporary directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// App-data root holding `downloads/`, `exports/`, `logs/` and `bin/`
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// External tool paths
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Download settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Export settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Process supervision settings
    #[serde(default)]
    pub process: ProcessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            tools: ToolsConfig::default(),
            download: DownloadConfig::default(),
            export: ExportConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration rooted at `data_root`
    pub fn with_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = regex::Regex::new(&self.download.source_pattern) {
            return Err(Error::Config {
                message: format!("source_pattern is not a valid regex: {e}"),
                key: Some("source_pattern".to_string()),
            });
        }

        for (key, prefix) in [
            ("download.file_prefix", &self.download.file_prefix),
            ("export.file_prefix", &self.export.file_prefix),
        ] {
            if prefix.is_empty() || prefix.contains(['/', '\\', '%']) || prefix.contains("__") {
                return Err(Error::Config {
                    message: format!("invalid file prefix {prefix:?}"),
                    key: Some(key.to_string()),
                });
            }
        }

        if self.export.audio_bitrate_kbps == 0 {
            return Err(Error::Config {
                message: "audio bitrate must be positive".to_string(),
                key: Some("export.audio_bitrate_kbps".to_string()),
            });
        }

        Ok(())
    }
}

// Default value functions
fn default_data_root() -> PathBuf {
    PathBuf::from("clipforge-data")
}

fn default_downloader_name() -> String {
    "yt-dlp".to_string()
}

fn default_transcoder_name() -> String {
    "ffmpeg".to_string()
}

fn default_true() -> bool {
    true
}

fn default_source_pattern() -> String {
    r"^https?://[^\s/]+/\S+$".to_string()
}

fn default_download_container() -> AudioContainer {
    AudioContainer::M4a
}

fn default_download_prefix() -> String {
    "download".to_string()
}

fn default_export_prefix() -> String {
    "export".to_string()
}

fn default_audio_bitrate() -> u32 {
    192
}

fn default_tail_lines() -> usize {
    20
}

fn default_terminate_grace() -> Duration {
    Duration::from_secs(2)
}
