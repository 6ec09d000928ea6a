//! Fake external tools
//!
//! Each fake is a small `/bin/sh` script written into the test's temp dir.
//! Behavior is baked into the script text rather than read from environment
//! variables, so tests can run in parallel.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Bytes every fake writes into the files it "produces"
pub const FAKE_MEDIA: &str = "fake media payload\n";

/// How the fake downloader behaves
#[derive(Clone, Copy, Debug)]
pub enum FakeDownloader {
    /// Print progress and write `<template>` with the given extension
    Succeed(&'static str),
    /// Fail the way yt-dlp does when `-f` matches nothing
    FormatMiss,
    /// Fail with a generic network error
    NetworkError,
    /// Print one progress line, leave a `.part` file, then sleep until killed
    Hang,
}

/// How the fake transcoder behaves
#[derive(Clone, Copy, Debug)]
pub enum FakeTranscoder {
    /// Print progress and write the output file
    Succeed,
    /// Exit 1 after printing an error
    Fail,
    /// Exit 0 leaving a zero-byte output file
    EmptyOutput,
    /// Print progress, start writing the output, then sleep until killed
    Hang,
}

/// Shell snippet that records every argument (one per line) and the script's pid
fn record_args(args_file: &Path) -> String {
    format!(
        "printf '%s\\n' \"$@\" > '{args}'\necho $$ > '{pid}'\n",
        args = args_file.display(),
        pid = pid_file(args_file).display()
    )
}

/// Where a fake writes its pid, next to its args file
pub fn pid_file(args_file: &Path) -> PathBuf {
    args_file.with_extension("pid")
}

pub fn downloader_script(mode: FakeDownloader, args_file: &Path) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&record_args(args_file));
    script.push_str(
        r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "[generic] Extracting URL"
"#,
    );

    let body = match mode {
        FakeDownloader::Succeed(ext) => format!(
            r#"file=$(printf '%s' "$out" | sed 's/%(ext)s$/{ext}/')
echo "[download] Destination: $file"
echo "[download]  50.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
printf '{FAKE_MEDIA}' > "$file"
echo "[download] 100% of 1.00MiB in 00:00:01"
"#
        ),
        FakeDownloader::FormatMiss => {
            "echo 'ERROR: [generic] video123: Requested format is not available. Use --list-formats for a list of available formats' >&2\nexit 1\n".to_string()
        }
        FakeDownloader::NetworkError => {
            "echo 'ERROR: Unable to download webpage: HTTP Error 503' >&2\nexit 1\n".to_string()
        }
        FakeDownloader::Hang => r#"part=$(printf '%s' "$out" | sed 's/%(ext)s$/webm.part/')
printf 'partial' > "$part"
echo "[download]   1.0% of 1.00MiB at 10.00KiB/s ETA 01:40"
exec sleep 30
"#
        .to_string(),
    };
    script.push_str(&body);
    script
}

pub fn transcoder_script(mode: FakeTranscoder, args_file: &Path) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&record_args(args_file));
    script.push_str("for last; do :; done\n");
    script.push_str("echo 'frame=0'\necho 'progress=continue'\n");

    let body = match mode {
        FakeTranscoder::Succeed => {
            format!("printf '{FAKE_MEDIA}' > \"$last\"\necho 'progress=end'\n")
        }
        FakeTranscoder::Fail => {
            "echo 'Error opening output file: Invalid argument' >&2\nexit 1\n".to_string()
        }
        FakeTranscoder::EmptyOutput => ": > \"$last\"\necho 'progress=end'\n".to_string(),
        FakeTranscoder::Hang => "printf 'part' > \"$last\"\nexec sleep 30\n".to_string(),
    };
    script.push_str(&body);
    script
}

/// Write an executable script at `path`
pub fn install_script(path: &Path, script: &str) -> PathBuf {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, script).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// Write a non-empty source audio file
pub fn write_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(&path, b"RIFF\x24\x00\x00\x00WAVEfmt fake source audio").unwrap();
    path
}
