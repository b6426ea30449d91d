//! Subprocess helpers shared by the jobs and the archive client.

use std::process::Stdio;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sentinel_common::{Error, Result};

/// Run a command to completion.
///
/// Cancellation kills the child; a non-zero exit is an error.
pub async fn exec(cancel: &CancellationToken, command: &[String]) -> Result<()> {
    if command.is_empty() {
        return Err(Error::InvalidInput("no command specified".to_string()));
    }

    info!(command = ?command, "executing command");

    let child = Command::new(&command[0])
        .args(&command[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Subprocess(format!("failed to spawn {}: {e}", command[0])))?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    };

    if !output.status.success() {
        warn!(
            command = ?command,
            exit_code = output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "command finished with non-zero exit code"
        );

        return Err(Error::Subprocess(format!(
            "command execution failed: {}",
            command[0]
        )));
    }

    Ok(())
}

/// Handle resolving to a streamed command's terminal status.
pub struct ExitHandle(oneshot::Receiver<Result<()>>);

impl ExitHandle {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<()>>) -> Self {
        Self(receiver)
    }

    /// Wait for the command to finish and return its terminal error, if any.
    pub async fn wait(self) -> Result<()> {
        self.0
            .await
            .unwrap_or_else(|_| Err(Error::Subprocess("command monitor vanished".to_string())))
    }
}

/// A running command exposing its stdout as a byte stream.
///
/// The reader side is consumed by whoever drains the stream; the exit handle
/// reports the terminal status once the process is gone. Both sides are
/// released on cancellation.
pub struct ExecStream {
    /// Stdout of the running command.
    pub output: ChildStdout,
    /// Resolves when the command exits.
    pub exit: ExitHandle,
}

/// Spawn a command and stream its stdout.
pub async fn exec_with_output(
    cancel: CancellationToken,
    command: &[String],
) -> Result<ExecStream> {
    if command.is_empty() {
        return Err(Error::InvalidInput("no command specified".to_string()));
    }

    info!(command = ?command, "executing command with output");

    let mut child = Command::new(&command[0])
        .args(&command[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Subprocess(format!("failed to spawn {}: {e}", command[0])))?;

    let output = child.stdout.take().expect("stdout is piped");
    let name = command[0].clone();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = tokio::select! {
            // wait_with_output drains the piped stderr alongside the wait.
            output = child.wait_with_output() => match output {
                Ok(output) if output.status.success() => Ok(()),
                Ok(output) => {
                    warn!(
                        command = %name,
                        exit_code = output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "command finished with non-zero exit code"
                    );
                    Err(Error::Subprocess(format!("command execution failed: {name}")))
                }
                Err(e) => Err(e.into()),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        let _ = tx.send(result);
    });

    Ok(ExecStream {
        output,
        exit: ExitHandle::new(rx),
    })
}

fn command_line_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#""((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|(\S+)"#).expect("valid regex")
    })
}

/// Split a label value into an argument vector, honoring quotes.
pub fn split_command_line(input: &str) -> Vec<String> {
    let mut result = Vec::new();
    for capture in command_line_regex().captures_iter(input) {
        if let Some(quoted) = capture.get(1) {
            result.push(unescape(quoted.as_str()));
        } else if let Some(quoted) = capture.get(2) {
            result.push(unescape(quoted.as_str()));
        } else if let Some(bare) = capture.get(3) {
            result.push(bare.as_str().to_string());
        }
    }

    result
}

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\'", "'")
}

fn archive_name_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new("[^_a-zA-Z0-9]+").expect("valid regex"))
}

/// Archive name for `base` at the current time.
pub fn archive_name(base: &str) -> String {
    archive_name_at(base, Utc::now())
}

/// Archive name for `base` at `at`: normalized base plus a timestamp.
pub fn archive_name_at(base: &str, at: DateTime<Utc>) -> String {
    let normalized = archive_name_regex().replace_all(base, "_");
    format!("{}-{}", normalized, at.format("%Y%m%d%H%M%S"))
}
