//! Transcoder argument construction
//!
//! The edit is realized entirely by the transcoder, in this order:
//!
//! 1. trim: input seek (`-ss`) plus duration (`-t`), so the decoded stream
//!    starts at zero on the trimmed timeline
//! 2. gain: `volume=<multiplier>`
//! 3. fades: `afade` windows positioned on the trimmed timeline
//!
//! The video profile adds a synthetic black source; its size, rate and codecs
//! are constants of the profile.

use crate::command::ToolCommand;
use crate::edit::EditDescriptor;
use crate::types::{AudioContainer, ExportProfile, VIDEO_FPS, VIDEO_HEIGHT, VIDEO_WIDTH};
use std::path::Path;

/// Seconds rendered with millisecond precision
fn secs(value: f64) -> String {
    format!("{value:.3}")
}

/// Audio encoder arguments for `container`
pub fn audio_codec_args(container: AudioContainer, bitrate_kbps: u32) -> Vec<String> {
    match container {
        AudioContainer::M4a => vec![
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{bitrate_kbps}k"),
        ],
        AudioContainer::Wav => vec!["-c:a".to_string(), "pcm_s16le".to_string()],
    }
}

/// `-af` filter chain: gain first, then the fade envelopes
pub fn audio_filter_chain(edit: &EditDescriptor) -> String {
    let mut filters = vec![format!("volume={:.3}", edit.volume())];
    if edit.fade_in() > 0.0 {
        filters.push(format!("afade=t=in:st=0:d={}", secs(edit.fade_in())));
    }
    if edit.fade_out() > 0.0 {
        filters.push(format!(
            "afade=t=out:st={}:d={}",
            secs(edit.fade_out_start()),
            secs(edit.fade_out())
        ));
    }
    filters.join(",")
}

/// Lavfi source description of the black video track
pub fn black_video_source() -> String {
    format!("color=c=black:s={VIDEO_WIDTH}x{VIDEO_HEIGHT}:r={VIDEO_FPS}")
}

/// Full transcoder invocation for one export
///
/// Progress is requested on stdout as `key=value` lines; they are only used
/// as a liveness signal.
pub fn build_transcode_command(
    transcoder: &Path,
    source: &Path,
    edit: &EditDescriptor,
    profile: ExportProfile,
    output: &Path,
    bitrate_kbps: u32,
) -> ToolCommand {
    let duration = secs(edit.clip_duration());

    let command = ToolCommand::new(transcoder)
        .args(["-hide_banner", "-nostdin", "-y"])
        .args(["-progress", "pipe:1", "-nostats"])
        .opt("-ss", secs(edit.trim_start()))
        .opt("-t", &duration)
        .opt("-i", source);

    let command = match profile {
        ExportProfile::Audio(container) => command
            .arg("-vn")
            .opt("-af", audio_filter_chain(edit))
            .args(audio_codec_args(container, bitrate_kbps)),
        ExportProfile::BlackScreenVideo => command
            .opt("-f", "lavfi")
            .opt("-i", black_video_source())
            .opt("-map", "1:v:0")
            .opt("-map", "0:a:0")
            .opt("-af", audio_filter_chain(edit))
            .opt("-c:v", "libx264")
            .opt("-tune", "stillimage")
            .opt("-pix_fmt", "yuv420p")
            .opt("-r", VIDEO_FPS.to_string())
            .args(audio_codec_args(AudioContainer::M4a, bitrate_kbps))
            .arg("-shortest")
            .opt("-t", &duration)
            .opt("-movflags", "+faststart"),
    };

    command.arg(output)
}
