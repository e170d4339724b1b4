// src/process.rs

//! Cancellable external process execution
//!
//! Actions that shell out (patch, package-manager frontends, ecosystem
//! installers) go through [`run_command`]:
//!
//! - stdin is nullified so a prompting tool cannot hang the install
//! - stdout and stderr are drained on reader threads into one combined
//!   buffer, preserving interleaving closely enough for diagnostics
//! - the child is placed in its own process group; when the cancellation
//!   token trips, the whole group receives SIGKILL so grandchildren spawned
//!   by build scripts do not outlive the install
//! - background processes still holding the output pipes after the child
//!   exits are killed after a short grace period, or at once on cancel
//! - a non-zero exit becomes [`Error::CommandFailed`] carrying the output

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io::{ErrorKind, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often the cancellation token is polled while a child runs
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long leftover group members may hold the output pipes after the child exits
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// Combined output is truncated to this many bytes in error messages
const MAX_ERROR_OUTPUT: usize = 16 * 1024;

/// Result of a successful command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// stdout and stderr interleaved in arrival order
    pub output: String,
}

/// Render a command for logs and error messages
pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn drain<R: Read + Send + 'static>(mut source: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; 4096];
        loop {
            match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut out) = sink.lock() {
                        out.extend_from_slice(&buffer[..n]);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn group_of(child: &Child) -> Pid {
    Pid::from_raw(child.id() as i32)
}

fn kill_group(child: &mut Child) {
    let pgid = group_of(child);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg({}) failed: {}, falling back to kill", pgid, e);
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn join_all(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let _ = reader.join();
    }
}

/// Run a command to completion, honoring cancellation
pub fn run_command(mut cmd: Command, cancel: &CancelToken) -> Result<CommandOutput> {
    let description = describe(&cmd);
    cancel.check()?;
    debug!("Running: {}", description);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            Error::ToolNotFound(cmd.get_program().to_string_lossy().into_owned())
        } else {
            Error::IoError(format!("Failed to spawn '{}': {}", description, e))
        }
    })?;

    let combined = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(drain(stdout, Arc::clone(&combined)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(drain(stderr, Arc::clone(&combined)));
    }

    let status = loop {
        if cancel.is_cancelled() {
            warn!("Cancelling '{}' and its process group", description);
            kill_group(&mut child);
            join_all(readers);
            return Err(Error::Cancelled);
        }

        match child.wait_timeout(POLL_INTERVAL) {
            Ok(Some(status)) => break status,
            Ok(None) => continue,
            Err(e) => {
                kill_group(&mut child);
                return Err(Error::IoError(format!(
                    "Failed waiting for '{}': {}",
                    description, e
                )));
            }
        }
    };

    // Processes the child left behind in its group can keep the pipes open
    let pgid = group_of(&child);
    let exited = Instant::now();
    while readers.iter().any(|r| !r.is_finished()) {
        if cancel.is_cancelled() {
            warn!("Cancelling processes left behind by '{}'", description);
            let _ = killpg(pgid, Signal::SIGKILL);
            join_all(readers);
            return Err(Error::Cancelled);
        }
        if exited.elapsed() >= PIPE_GRACE {
            warn!("'{}' left processes holding its output open, killing them", description);
            let _ = killpg(pgid, Signal::SIGKILL);
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    join_all(readers);

    let output = combined
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();

    if status.success() {
        Ok(CommandOutput { status, output })
    } else {
        let status_text = match status.code() {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        Err(Error::CommandFailed {
            command: description,
            status: status_text,
            output: truncate_output(&output),
        })
    }
}

fn truncate_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= MAX_ERROR_OUTPUT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - MAX_ERROR_OUTPUT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_combined_output() {
        let out = run_command(sh("echo out; echo err >&2"), &CancelToken::new()).unwrap();
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[test]
    fn test_failure_carries_output() {
        let err = run_command(sh("echo boom >&2; exit 3"), &CancelToken::new()).unwrap_err();
        match err {
            Error::CommandFailed { status, output, .. } => {
                assert_eq!(status, "exit code 3");
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program() {
        let err = run_command(
            Command::new("tsuku-definitely-not-a-real-binary"),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[test]
    fn test_cancellation_kills_process_group() {
        let token = CancelToken::with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        // The background sleep would hold the pipes open if only the shell died
        let err = run_command(sh("sleep 30 & sleep 30"), &token).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancellation_after_exit_stops_waiting_on_pipes() {
        let token = CancelToken::with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        // The shell exits at once; the sleep inherits stdout
        let err = run_command(sh("sleep 600 & echo started"), &token).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < PIPE_GRACE);
    }

    #[test]
    fn test_leftover_background_process_is_reaped() {
        let started = Instant::now();
        let out = run_command(sh("sleep 600 & echo started"), &CancelToken::new()).unwrap();
        assert!(out.output.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_already_cancelled_never_spawns() {
        let token = CancelToken::new();
        token.cancel();
        let err = run_command(sh("exit 0"), &token).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_truncate_output() {
        let long = "x".repeat(MAX_ERROR_OUTPUT + 10);
        let truncated = truncate_output(&long);
        assert!(truncated.starts_with("..."));
        assert_eq!(truncated.len(), MAX_ERROR_OUTPUT + 3);
    }
}
