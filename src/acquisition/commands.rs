//! Downloader and normalization command lines

use crate::command::ToolCommand;
use crate::export::audio_codec_args;
use crate::types::AudioContainer;
use std::ffi::OsString;
use std::path::Path;

/// Format selector handed to the downloader: one best audio-only stream, no fallback chain
pub const AUDIO_FORMAT_SELECTOR: &str = "bestaudio";

/// Downloader message printed when the format selector matches nothing
const FORMAT_MISS_MARKER: &str = "requested format is not available";

/// Downloader invocation writing to `<directory>/<stem>.<ext>`
///
/// The extension is left to the downloader (`%(ext)s`) so the produced
/// container is never rewritten behind our back.
pub fn build_download_command(
    downloader: &Path,
    url: &str,
    directory: &Path,
    stem: &str,
    allow_playlist: bool,
) -> ToolCommand {
    let mut template = OsString::from(directory.join(stem).as_os_str());
    template.push(".%(ext)s");

    ToolCommand::new(downloader)
        .opt("-f", AUDIO_FORMAT_SELECTOR)
        .arg(if allow_playlist {
            "--yes-playlist"
        } else {
            "--no-playlist"
        })
        .arg("--newline")
        .arg("--no-mtime")
        .arg("--no-overwrites")
        .opt("-o", template)
        .arg("--")
        .arg(url)
}

/// Transcoder pass converting `input` into `container` at `output`
pub fn build_normalize_command(
    transcoder: &Path,
    input: &Path,
    output: &Path,
    container: AudioContainer,
    bitrate_kbps: u32,
) -> ToolCommand {
    ToolCommand::new(transcoder)
        .args(["-hide_banner", "-nostdin", "-y"])
        .opt("-i", input)
        .arg("-vn")
        .args(audio_codec_args(container, bitrate_kbps))
        .arg(output)
}

/// Whether the downloader's output tail reports a format selection miss
pub fn is_format_miss(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|line| line.to_ascii_lowercase().contains(FORMAT_MISS_MARKER))
}

/// Whether a directory entry is a downloader scratch file rather than output
pub(super) fn is_scratch_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("part" | "ytdl" | "temp")
    )
}
