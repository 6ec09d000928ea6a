//! Append-only JSON-lines session logs
//!
//! One file per operation at `logs/<kind>_<session>.log`. Every
//! [`SessionLog::emit`] writes one complete line with a single `write_all`
//! and flushes it, so a process killed mid-operation leaves every earlier
//! line intact and parseable.
//!
//! The logger does not validate stage names; callers use [`Stage`].

use crate::error::{Error, Result};
use crate::paths::ensure_dir;
use crate::types::{OperationKind, SessionId, Stage};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{trace, warn};

/// Keys written by the logger itself; payload fields with these names are dropped
const RESERVED_KEYS: [&str; 4] = ["stage", "ts", "mono_ms", "session_id"];

/// Open session log for one operation
///
/// Closing is tied to `Drop`: the file is flushed and synced when the log
/// goes out of scope, including on early returns and panics in the owner.
#[derive(Debug)]
pub struct SessionLog {
    id: SessionId,
    path: PathBuf,
    file: Mutex<File>,
    opened: Instant,
    last_stage: Mutex<Option<String>>,
}

/// Path of the session log for `kind`/`id` under `logs_dir`
pub fn log_path(logs_dir: &Path, kind: OperationKind, id: &SessionId) -> PathBuf {
    logs_dir.join(format!("{}_{}.log", kind.as_str(), id))
}

impl SessionLog {
    /// Open (creating if needed) the session log in `logs_dir`
    pub fn open(logs_dir: &Path, kind: OperationKind, id: &SessionId) -> Result<Self> {
        ensure_dir(logs_dir)?;
        let path = log_path(logs_dir, kind, id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        trace!(session_id = %id, ?path, "opened session log");

        Ok(Self {
            id: id.clone(),
            path,
            file: Mutex::new(file),
            opened: Instant::now(),
            last_stage: Mutex::new(None),
        })
    }

    /// Append one record
    ///
    /// Object payloads are merged into the record; any other JSON value is
    /// stored under `data`.
    pub fn emit(&self, stage: &str, payload: Value) -> Result<()> {
        *self
            .last_stage
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(stage.to_string());

        let mut record = Map::new();
        record.insert("stage".into(), Value::from(stage));
        record.insert("ts".into(), Value::from(Utc::now().timestamp_millis()));
        record.insert(
            "mono_ms".into(),
            Value::from(u64::try_from(self.opened.elapsed().as_millis()).unwrap_or(u64::MAX)),
        );
        record.insert("session_id".into(), Value::from(self.id.as_str()));
        match payload {
            Value::Object(fields) => {
                for (key, value) in fields {
                    if !RESERVED_KEYS.contains(&key.as_str()) {
                        record.insert(key, value);
                    }
                }
            }
            Value::Null => {}
            other => {
                record.insert("data".into(), other);
            }
        }

        let mut line = serde_json::to_string(&Value::Object(record))?;
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// [`emit`](Self::emit) a vocabulary stage, downgrading write failures to a warning
    ///
    /// Used on operation paths where a full disk must not mask the real outcome.
    pub fn record(&self, stage: Stage, payload: Value) {
        if let Err(e) = self.emit(stage.as_str(), payload) {
            warn!(
                session_id = %self.id,
                stage = stage.as_str(),
                error = %e,
                "failed to write session log record"
            );
        }
    }

    /// Last stage passed to [`emit`](Self::emit)
    pub fn last_stage(&self) -> Option<String> {
        self.last_stage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Session this log belongs to
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        let file = self.file.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.flush().and_then(|()| file.sync_all()) {
            warn!(path = ?self.path, error = %e, "failed to sync session log on close");
        }
    }
}

/// One parsed session log record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Stage name
    pub stage: String,
    /// Wall-clock milliseconds since the Unix epoch
    pub ts: i64,
    /// Monotonic milliseconds since the log was opened
    pub mono_ms: u64,
    /// Owning session
    pub session_id: String,
    /// Remaining payload fields
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Parse a session log line by line
///
/// A trailing line without a newline that fails to parse is treated as a
/// write cut short by a crash and skipped. Any other malformed line is an error.
pub fn read_events(path: &Path) -> Result<Vec<LogEvent>> {
    let raw = std::fs::read(path)?;
    let complete = raw.ends_with(b"\n");
    let lines: Vec<&[u8]> = raw
        .split(|b| *b == b'\n')
        .filter(|l| !l.trim_ascii().is_empty())
        .collect();

    // Bytes, not str: a cut inside a multi-byte character must only cost the last line
    let mut events = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_slice::<LogEvent>(line) {
            Ok(event) => events.push(event),
            Err(_) if index + 1 == lines.len() && !complete => {
                trace!(?path, "skipping truncated trailing session log line");
            }
            Err(e) => return Err(Error::Serialization(e)),
        }
    }
    Ok(events)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use serde_json::json;

    fn open_log(dir: &Path) -> SessionLog {
        let id = SessionId::generate(Local::now());
        SessionLog::open(&dir.join("logs"), OperationKind::ExportAudio, &id).unwrap()
    }

    #[test]
    fn open_creates_logs_dir_and_names_file_by_kind_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        let name = log.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("export_audio_"));
        assert!(name.ends_with(".log"));
        assert!(log.path().exists());
    }

    #[test]
    fn emit_appends_one_parseable_line_per_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        log.emit("export_clicked", json!({"profile": "m4a"})).unwrap();
        log.emit("backend_ffmpeg_start", json!({"args": ["-y"]}))
            .unwrap();
        log.emit("export_success", Value::Null).unwrap();

        let events = read_events(log.path()).unwrap();
        let stages: Vec<_> = events.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(
            stages,
            ["export_clicked", "backend_ffmpeg_start", "export_success"]
        );
        assert_eq!(events[0].payload["profile"], "m4a");
        assert_eq!(events[0].session_id, log.session_id().as_str());
        assert!(events[0].mono_ms <= events[2].mono_ms);
        assert_eq!(log.last_stage().as_deref(), Some("export_success"));
    }

    #[test]
    fn payload_cannot_override_reserved_fields() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        log.emit("wav_blob_ready", json!({"stage": "forged", "ts": -1, "bytes": 10}))
            .unwrap();

        let events = read_events(log.path()).unwrap();
        assert_eq!(events[0].stage, "wav_blob_ready");
        assert!(events[0].ts > 0);
        assert_eq!(events[0].payload["bytes"], 10);
    }

    #[test]
    fn scalar_payload_is_nested_under_data() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        log.emit("download_progress", json!("[download] 42.0%"))
            .unwrap();

        let events = read_events(log.path()).unwrap();
        assert_eq!(events[0].payload["data"], "[download] 42.0%");
    }

    #[test]
    fn reopening_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let id = SessionId::generate(Local::now());

        {
            let log = SessionLog::open(&logs, OperationKind::Download, &id).unwrap();
            log.emit("download_start", Value::Null).unwrap();
        }
        let log = SessionLog::open(&logs, OperationKind::Download, &id).unwrap();
        log.emit("download_success", Value::Null).unwrap();

        assert_eq!(read_events(log.path()).unwrap().len(), 2);
    }

    #[test]
    fn truncated_last_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        log.emit("export_clicked", Value::Null).unwrap();
        log.emit("backend_ffmpeg_start", Value::Null).unwrap();

        // Simulate a kill in the middle of a write
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(br#"{"stage":"backend_ffmpeg_ex"#).unwrap();

        let events = read_events(log.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].stage, "backend_ffmpeg_start");
    }

    #[test]
    fn record_cut_inside_a_multibyte_character_keeps_earlier_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        log.emit("download_progress", json!({ "line": "café" })).unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{\"stage\":\"download_progress\",\"line\":\"caf\xC3")
            .unwrap();

        let events = read_events(log.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["line"], "café");
    }

    #[test]
    fn malformed_line_in_the_middle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.log");
        std::fs::write(
            &path,
            "{\"stage\":\"a\",\"ts\":1,\"mono_ms\":0,\"session_id\":\"s\"}\nnot json\n",
        )
        .unwrap();

        assert!(matches!(read_events(&path), Err(Error::Serialization(_))));
    }
}
