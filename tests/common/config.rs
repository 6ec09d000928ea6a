//! Test harness: temp data root plus fake tools

use super::fixtures::{
    FakeDownloader, FakeTranscoder, downloader_script, install_script, transcoder_script,
};
use clipforge::{AcquisitionManager, Config, ExportPipeline, Toolchain};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Generous upper bound for any single operation in tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// A throwaway data root with fake tools installed outside it
pub struct Harness {
    /// Owns every file the test creates
    pub temp: TempDir,
    /// Data root handed to the core
    pub root: PathBuf,
    /// Fake tool locations
    pub tools: Toolchain,
    /// Arguments of the last downloader invocation, one per line
    pub downloader_args: PathBuf,
    /// Arguments of the last transcoder invocation, one per line
    pub transcoder_args: PathBuf,
}

impl Harness {
    pub fn new(downloader: FakeDownloader, transcoder: FakeTranscoder) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("data");
        let tool_dir = temp.path().join("tools");
        let downloader_args = temp.path().join("downloader.args");
        let transcoder_args = temp.path().join("transcoder.args");

        let tools = Toolchain {
            downloader: install_script(
                &tool_dir.join("yt-dlp"),
                &downloader_script(downloader, &downloader_args),
            ),
            transcoder: install_script(
                &tool_dir.join("ffmpeg"),
                &transcoder_script(transcoder, &transcoder_args),
            ),
        };

        Self {
            temp,
            root,
            tools,
            downloader_args,
            transcoder_args,
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::with_root(&self.root);
        config.tools.search_path = false;
        config.process.terminate_grace = Duration::from_millis(500);
        config
    }

    pub fn acquisition(&self) -> AcquisitionManager {
        AcquisitionManager::new(self.config(), self.tools.clone()).unwrap()
    }

    pub fn exports(&self) -> ExportPipeline {
        ExportPipeline::new(self.config(), self.tools.clone()).unwrap()
    }

    /// Directory for source files, outside the data root
    pub fn inbox(&self) -> PathBuf {
        self.temp.path().join("inbox")
    }

    pub fn recorded_args(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
