//! Assertions and waiting helpers shared by the integration tests

use clipforge::{Event, LogEvent, OperationHandle, OperationState, SessionId, read_events};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use walkdir::WalkDir;

/// Wait until the handle reports `target`; false if the operation ended first or the timeout hit
pub async fn wait_for_state<S: OperationState, T: Send + 'static>(
    handle: &mut OperationHandle<S, T>,
    target: S,
    timeout: Duration,
) -> bool {
    if handle.state() == target {
        return true;
    }
    let result = tokio::time::timeout(timeout, async {
        while let Some(state) = handle.changed().await {
            if state == target {
                return true;
            }
        }
        false
    })
    .await;

    result.unwrap_or(false)
}

/// Drain events for `id` until its terminal event arrives (or the timeout hits)
pub async fn collect_events_for(
    events: &mut broadcast::Receiver<Event>,
    id: &SessionId,
    timeout: Duration,
) -> Vec<Event> {
    let mut collected = Vec::new();

    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let (event_id, terminal) = match &event {
                Event::Acquisition { id, .. } | Event::Export { id, .. } | Event::Output { id, .. } => {
                    (id, false)
                }
                Event::Finished { id, .. }
                | Event::Cancelled { id, .. }
                | Event::Failed { id, .. } => (id, true),
            };
            if event_id != id {
                continue;
            }
            collected.push(event);
            if terminal {
                break;
            }
        }
    })
    .await;

    collected
}

/// Stage names of a session log, in order
pub fn stages(log: &Path) -> Vec<String> {
    read_events(log)
        .unwrap()
        .into_iter()
        .map(|e: LogEvent| e.stage)
        .collect()
}

/// Assert that `expected` stages appear in this relative order
pub fn assert_stage_order(log: &Path, expected: &[&str]) {
    let all = stages(log);
    let mut cursor = 0;
    for stage in expected {
        match all[cursor..].iter().position(|s| s == stage) {
            Some(offset) => cursor += offset + 1,
            None => panic!("stage {stage} missing or out of order in {all:?}"),
        }
    }
}

/// Every regular file under `dir`, recursively
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut files: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Assert that `path` exists and is not empty
pub fn assert_non_empty_file(path: &Path) {
    let meta = std::fs::metadata(path)
        .unwrap_or_else(|e| panic!("expected {} to exist: {e}", path.display()));
    assert!(meta.len() > 0, "expected {} to be non-empty", path.display());
}

/// Whether a process with this pid still exists
pub fn pid_alive(pid: i32) -> bool {
    // Signal 0 only checks for existence
    unsafe { libc::kill(pid, 0) == 0 }
}
