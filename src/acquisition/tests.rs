use super::*;
use crate::types::AudioContainer;
use std::ffi::OsStr;

fn manager_in(root: &Path) -> AcquisitionManager {
    let tools = Toolchain {
        downloader: PathBuf::from("/opt/tools/yt-dlp"),
        transcoder: PathBuf::from("/opt/tools/ffmpeg"),
    };
    AcquisitionManager::new(Config::with_root(root), tools).unwrap()
}

fn remote(url: &str) -> SourceReference {
    SourceReference::parse(url).unwrap()
}

#[test]
fn download_command_selects_single_audio_stream_without_playlist() {
    let cmd = build_download_command(
        Path::new("/opt/tools/yt-dlp"),
        "https://example.com/video123",
        Path::new("/data/downloads/2026-10-17"),
        "download__20261017_101500__bestaudio",
        false,
    );

    assert_eq!(cmd.value_of("-f"), Some(OsStr::new("bestaudio")));
    assert!(cmd.has_arg("--no-playlist"));
    assert!(!cmd.has_arg("--yes-playlist"));
    assert!(cmd.has_arg("--newline"));
    assert_eq!(
        cmd.value_of("-o"),
        Some(OsStr::new(
            "/data/downloads/2026-10-17/download__20261017_101500__bestaudio.%(ext)s"
        ))
    );

    let args = cmd.display_args();
    assert_eq!(args[args.len() - 2], "--");
    assert_eq!(args[args.len() - 1], "https://example.com/video123");
}

#[test]
fn playlist_override_is_explicit() {
    let cmd = build_download_command(
        Path::new("yt-dlp"),
        "https://example.com/list",
        Path::new("/d"),
        "s",
        true,
    );
    assert!(cmd.has_arg("--yes-playlist"));
    assert!(!cmd.has_arg("--no-playlist"));
}

#[test]
fn format_selector_has_no_fallback_chain() {
    assert!(!AUDIO_FORMAT_SELECTOR.contains('/'));
}

#[test]
fn normalize_command_targets_requested_container() {
    let m4a = build_normalize_command(
        Path::new("ffmpeg"),
        Path::new("/d/a.webm"),
        Path::new("/d/a.m4a"),
        AudioContainer::M4a,
        192,
    );
    assert_eq!(m4a.value_of("-i"), Some(OsStr::new("/d/a.webm")));
    assert_eq!(m4a.value_of("-c:a"), Some(OsStr::new("aac")));
    assert_eq!(m4a.value_of("-b:a"), Some(OsStr::new("192k")));
    assert!(m4a.has_arg("-vn"));
    assert_eq!(m4a.display_args().last().map(String::as_str), Some("/d/a.m4a"));

    let wav = build_normalize_command(
        Path::new("ffmpeg"),
        Path::new("/d/a.webm"),
        Path::new("/d/a.wav"),
        AudioContainer::Wav,
        192,
    );
    assert_eq!(wav.value_of("-c:a"), Some(OsStr::new("pcm_s16le")));
    assert!(!wav.has_arg("-b:a"));
}

#[test]
fn format_miss_is_detected_in_output_tail() {
    let tail = vec![
        "[youtube] abc: Downloading webpage".to_string(),
        "ERROR: [youtube] abc: Requested format is not available. Use --list-formats".to_string(),
    ];
    assert!(is_format_miss(&tail));
    assert!(!is_format_miss(&["ERROR: HTTP Error 403".to_string()]));
}

#[test]
fn accepts_well_formed_media_url() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path());

    assert!(
        manager
            .validate_source(&remote("https://example.com/video123"))
            .is_ok()
    );
}

#[test]
fn rejects_urls_outside_source_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path());

    for url in ["https://example.com", "https://example.com/"] {
        assert!(
            matches!(
                manager.validate_source(&remote(url)),
                Err(Error::InvalidSource { .. })
            ),
            "{url} should be rejected"
        );
    }

    let ftp = SourceReference::Remote(url::Url::parse("ftp://example.com/file").unwrap());
    assert!(matches!(
        manager.validate_source(&ftp),
        Err(Error::InvalidSource { .. })
    ));
}

#[test]
fn custom_source_pattern_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::with_root(dir.path());
    config.download.source_pattern = r"^https://media\.example\.org/".to_string();
    let manager = AcquisitionManager::new(
        config,
        Toolchain {
            downloader: PathBuf::from("yt-dlp"),
            transcoder: PathBuf::from("ffmpeg"),
        },
    )
    .unwrap();

    assert!(
        manager
            .validate_source(&remote("https://media.example.org/track/1"))
            .is_ok()
    );
    assert!(
        manager
            .validate_source(&remote("https://example.com/video123"))
            .is_err()
    );
}

#[test]
fn local_source_must_exist_and_be_non_empty() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path());

    let missing = dir.path().join("missing.wav");
    assert!(matches!(
        manager.validate_source(&SourceReference::Local(missing)),
        Err(Error::SourceNotFound(_))
    ));

    let empty = dir.path().join("empty.wav");
    std::fs::write(&empty, b"").unwrap();
    assert!(matches!(
        manager.validate_source(&SourceReference::Local(empty)),
        Err(Error::SourceNotFound(_))
    ));

    let real = dir.path().join("take.wav");
    std::fs::write(&real, b"RIFF....WAVE").unwrap();
    assert!(
        manager
            .validate_source(&SourceReference::Local(real))
            .is_ok()
    );
}

#[test]
fn invalid_source_pattern_is_a_config_error() {
    let mut config = Config::with_root("/tmp/unused");
    config.download.source_pattern = "(unclosed".to_string();

    let result = AcquisitionManager::new(
        config,
        Toolchain {
            downloader: PathBuf::from("yt-dlp"),
            transcoder: PathBuf::from("ffmpeg"),
        },
    );
    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test]
async fn invalid_source_opens_no_session_log_and_frees_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path());

    let err = manager.start(remote("https://example.com/")).unwrap_err();
    assert!(matches!(err, Error::InvalidSource { .. }));
    assert!(!dir.path().join("logs").exists());
    assert!(manager.active_session().is_none());
}

#[test]
fn slot_rejects_second_claim_until_released() {
    let active = Arc::new(Mutex::new(None));
    let first = SessionId::generate(Local::now());
    let second = SessionId::generate(Local::now());

    let slot = ActiveSlot::claim(&active, &first).unwrap();
    match ActiveSlot::claim(&active, &second) {
        Err(Error::AlreadyRunning { session_id }) => assert_eq!(session_id, first.as_str()),
        other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
    }

    drop(slot);
    assert!(ActiveSlot::claim(&active, &second).is_ok());
}
