//! Supervised child processes
//!
//! [`ProcessRunner::run`] spawns one external tool, streams every stdout and
//! stderr line to a callback (and optionally to a [`SessionLog`]) as it
//! arrives, and guarantees the child is gone before returning:
//!
//! - normal exit: the child has been reaped
//! - cancellation: the process group gets SIGTERM, then SIGKILL after the grace period
//! - stall timeout: same as cancellation, but reported as [`Error::Stalled`]
//! - the future is dropped by the caller: a guard kills the process group
//!
//! Cancellation is an outcome ([`ExitResult::Cancelled`]), not an error.

use crate::command::ToolCommand;
use crate::config::ProcessConfig;
use crate::error::{Error, Result};
use crate::session_log::SessionLog;
use crate::types::{OutputStream, Stage};
use serde_json::json;
use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How a supervised run ended, when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitResult {
    /// The process exited with status zero
    Completed {
        /// Exit code (always 0)
        exit_code: i32,
        /// Wall time from spawn to exit
        duration: Duration,
    },
    /// The cancel token fired and the process was terminated
    Cancelled {
        /// Wall time from spawn to confirmed termination
        duration: Duration,
    },
}

impl ExitResult {
    /// Whether the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExitResult::Cancelled { .. })
    }

    /// Wall time of the run
    pub fn duration(&self) -> Duration {
        match self {
            ExitResult::Completed { duration, .. } | ExitResult::Cancelled { duration } => {
                *duration
            }
        }
    }
}

/// Session log plus the stage output lines are recorded under
#[derive(Clone, Copy, Debug)]
pub struct LogTap<'a> {
    /// Target log
    pub log: &'a SessionLog,
    /// Stage every output line is recorded under
    pub stage: Stage,
}

/// Why the output loop stopped early
enum Interrupt {
    Cancelled,
    Stalled(Duration),
}

/// Spawns and supervises external tools
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    tail_lines: usize,
    stall_timeout: Option<Duration>,
    terminate_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(&ProcessConfig::default())
    }
}

impl ProcessRunner {
    /// Runner using the given supervision settings
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            tail_lines: config.tail_lines.max(1),
            stall_timeout: config.stall_timeout,
            terminate_grace: config.terminate_grace,
        }
    }

    /// Run `command` to completion or cancellation
    ///
    /// `on_line` is called synchronously for each line in arrival order; each
    /// stream is individually ordered. When `tap` is set, each line is also
    /// appended to the session log under `tap.stage` before `on_line` runs.
    ///
    /// # Errors
    ///
    /// - [`Error::ToolMissing`] if the program cannot be found
    /// - [`Error::ProcessFailure`] on non-zero exit, with the last output lines
    /// - [`Error::Stalled`] if a stall timeout is configured and exceeded
    pub async fn run<F>(
        &self,
        command: &ToolCommand,
        tap: Option<LogTap<'_>>,
        mut on_line: F,
        cancel: &CancellationToken,
    ) -> Result<ExitResult>
    where
        F: FnMut(OutputStream, &str),
    {
        let program = command.program_name();
        let started = Instant::now();

        let mut cmd = command.to_tokio();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = spawn_with_retry(&mut cmd).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::ToolMissing {
                tool: program.clone(),
            },
            _ => Error::Io(e),
        })?;
        let mut guard = GroupGuard::new(child.id());

        debug!(program = %program, pid = ?child.id(), args = ?command.display_args(), "spawned child process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other(format!("{program}: stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other(format!("{program}: stderr was not captured")))?;
        let mut out = BufReader::new(stdout).split(b'\n');
        let mut err = BufReader::new(stderr).split(b'\n');
        let (mut out_open, mut err_open) = (true, true);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(self.tail_lines);
        let mut last_activity = Instant::now();

        let mut deliver = |stream: OutputStream, raw: Vec<u8>, tail: &mut VecDeque<String>| {
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches('\r');
            trace!(program = %program, stream = stream.as_str(), line, "child output");
            if let Some(tap) = tap {
                tap.log.record(
                    tap.stage,
                    json!({ "stream": stream.as_str(), "line": line }),
                );
            }
            on_line(stream, line);
            if tail.len() == self.tail_lines {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        };

        let interrupt = loop {
            if !out_open && !err_open {
                break None;
            }

            let deadline = self.stall_timeout.map(|t| last_activity + t);
            let stall = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break Some(Interrupt::Cancelled),
                _ = stall => break Some(Interrupt::Stalled(last_activity.elapsed())),
                segment = out.next_segment(), if out_open => match segment {
                    Ok(Some(raw)) => {
                        last_activity = Instant::now();
                        deliver(OutputStream::Stdout, raw, &mut tail);
                    }
                    Ok(None) => out_open = false,
                    Err(e) => {
                        warn!(program = %program, error = %e, "stopped reading stdout");
                        out_open = false;
                    }
                },
                segment = err.next_segment(), if err_open => match segment {
                    Ok(Some(raw)) => {
                        last_activity = Instant::now();
                        deliver(OutputStream::Stderr, raw, &mut tail);
                    }
                    Ok(None) => err_open = false,
                    Err(e) => {
                        warn!(program = %program, error = %e, "stopped reading stderr");
                        err_open = false;
                    }
                },
            }
        };

        match interrupt {
            Some(Interrupt::Cancelled) => {
                self.terminate(&mut child, &mut guard).await;
                debug!(program = %program, "child process cancelled");
                return Ok(ExitResult::Cancelled {
                    duration: started.elapsed(),
                });
            }
            Some(Interrupt::Stalled(idle)) => {
                self.terminate(&mut child, &mut guard).await;
                warn!(program = %program, ?idle, "child process stalled, terminated");
                return Err(Error::Stalled { program, idle });
            }
            None => {}
        }

        // Both pipes are closed; the child may still be shutting down
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status?,
            None => {
                self.terminate(&mut child, &mut guard).await;
                return Ok(ExitResult::Cancelled {
                    duration: started.elapsed(),
                });
            }
        };
        guard.disarm();

        let duration = started.elapsed();
        debug!(program = %program, code = ?status.code(), ?duration, "child process exited");

        if status.success() {
            Ok(ExitResult::Completed {
                exit_code: 0,
                duration,
            })
        } else {
            Err(Error::ProcessFailure {
                program,
                exit_code: status.code(),
                last_lines: tail.into_iter().collect(),
            })
        }
    }

    /// Polite signal, grace period, then hard kill; returns once the child is reaped
    async fn terminate(&self, child: &mut Child, guard: &mut GroupGuard) {
        guard.signal(Signal::Terminate);
        #[cfg(not(unix))]
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "start_kill failed");
        }

        match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "failed waiting for terminated child"),
            Err(_) => {
                debug!("child ignored termination signal, killing");
                guard.signal(Signal::Kill);
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill child process");
                }
            }
        }

        // Sweep any grandchildren left in the group
        guard.signal(Signal::Kill);
        guard.disarm();
    }
}

/// Spawn attempts made while the executable is still open for writing elsewhere
const SPAWN_ATTEMPTS: u32 = 5;

/// Spawn, retrying briefly on ETXTBSY (a tool binary that was just written,
/// e.g. dropped into `bin/`, can still be held open by a concurrent fork)
async fn spawn_with_retry(cmd: &mut tokio::process::Command) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                trace!(attempt, "executable busy, retrying spawn");
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Terminate,
    Kill,
}

/// Kills the child's process group if the run is abandoned before the child is reaped
struct GroupGuard {
    pid: Option<u32>,
    armed: bool,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        let Some(pid) = self.pid.filter(|_| self.armed) else {
            return;
        };
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: killpg has no memory-safety preconditions; the group was
        // created for this child via process_group(0), so pgid == child pid.
        let rc = unsafe { libc::killpg(pgid, signo) };
        if rc != 0 {
            trace!(pgid, signo, error = %io::Error::last_os_error(), "killpg failed");
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) {}
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.signal(Signal::Kill);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("/bin/sh").arg("-c").arg(script)
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(&ProcessConfig {
            tail_lines: 3,
            stall_timeout: None,
            terminate_grace: Duration::from_millis(500),
        })
    }

    fn pid_alive(pid: i32) -> bool {
        // Signal 0 only checks for existence
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[tokio::test]
    async fn streams_lines_in_order_and_reports_success() {
        let mut seen = Vec::new();
        let result = runner()
            .run(
                &sh("echo one; echo two; echo oops >&2"),
                None,
                |stream, line| seen.push((stream, line.to_string())),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(result, ExitResult::Completed { exit_code: 0, .. }));
        let stdout: Vec<_> = seen
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, ["one", "two"]);
        assert!(seen.contains(&(OutputStream::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_exit_code_and_tail() {
        let err = runner()
            .run(
                &sh("for i in 1 2 3 4 5; do echo line$i; done; exit 3"),
                None,
                |_, _| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::ProcessFailure {
                exit_code,
                last_lines,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(last_lines, ["line3", "line4", "line5"]);
            }
            other => panic!("expected process failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_tool_missing() {
        let err = runner()
            .run(
                &ToolCommand::new("/nonexistent/clipforge-tool-xyz"),
                None,
                |_, _| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ToolMissing { ref tool } if tool == "clipforge-tool-xyz"));
    }

    #[tokio::test]
    async fn cancellation_terminates_process_and_is_not_an_error() {
        let cancel = CancellationToken::new();
        let mut pid = None;

        let trigger = cancel.clone();
        let result = runner()
            .run(
                &sh("echo $$; exec sleep 30"),
                None,
                |_, line| {
                    pid = line.trim().parse::<i32>().ok();
                    trigger.cancel();
                },
                &cancel,
            )
            .await
            .unwrap();

        assert!(result.is_cancelled());
        assert!(result.duration() < Duration::from_secs(10));
        let pid = pid.expect("child printed its pid");
        assert!(!pid_alive(pid), "child {pid} still running after cancel");
    }

    #[tokio::test]
    async fn cancellation_kills_process_ignoring_sigterm() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result = runner()
            .run(
                &sh("trap '' TERM; echo ready; while true; do sleep 1; done"),
                None,
                |_, _| trigger.cancel(),
                &cancel,
            )
            .await
            .unwrap();

        assert!(result.is_cancelled());
    }

    #[tokio::test]
    async fn stall_timeout_terminates_silent_process() {
        let runner = ProcessRunner::new(&ProcessConfig {
            tail_lines: 5,
            stall_timeout: Some(Duration::from_millis(200)),
            terminate_grace: Duration::from_millis(200),
        });

        let err = runner
            .run(
                &sh("echo start; exec sleep 30"),
                None,
                |_, _| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Stalled { .. }));
    }

    #[tokio::test]
    async fn lines_are_tapped_into_session_log() {
        use crate::session_log::{SessionLog, read_events};
        use crate::types::{OperationKind, SessionId};

        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::open(
            dir.path(),
            OperationKind::Download,
            &SessionId::generate(chrono::Local::now()),
        )
        .unwrap();

        runner()
            .run(
                &sh("echo '[download]  50.0%'; echo done"),
                Some(LogTap {
                    log: &log,
                    stage: Stage::DownloadProgress,
                }),
                |_, _| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = read_events(log.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.stage == "download_progress"));
        assert_eq!(events[0].payload["line"], "[download]  50.0%");
        assert_eq!(events[0].payload["stream"], "stdout");
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_delivered_lossily() {
        let mut lines = Vec::new();
        runner()
            .run(
                &sh(r"printf 'caf\351\n'"),
                None,
                |_, line| lines.push(line.to_string()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("caf"));
    }
}
