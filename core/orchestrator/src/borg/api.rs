//! Low-level archive-tool invocation: exit codes, stderr parsing, env.

use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_common::{Error as CommonError, Result};

/// Byte source piped into an archive's stdin.
pub type InputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Exit codes of the archive tool under its modern code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success,
    Warning,
    Error,
    RepositoryDoesNotExist,
    RepositoryIsInvalid,
    PasscommandFailure,
    PassphraseWrong,
    ConnectionClosed,
    ConnectionClosedWithHint,
    Other(i32),
}

impl ReturnCode {
    /// Map a raw process exit code.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ReturnCode::Success,
            1 => ReturnCode::Warning,
            2 => ReturnCode::Error,
            13 => ReturnCode::RepositoryDoesNotExist,
            15 => ReturnCode::RepositoryIsInvalid,
            51 => ReturnCode::PasscommandFailure,
            52 => ReturnCode::PassphraseWrong,
            80 => ReturnCode::ConnectionClosed,
            81 => ReturnCode::ConnectionClosedWithHint,
            other => ReturnCode::Other(other),
        }
    }

    /// Whether the caller can act on this code without giving up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReturnCode::RepositoryDoesNotExist
                | ReturnCode::RepositoryIsInvalid
                | ReturnCode::PassphraseWrong
        )
    }
}

/// Structured error from an archive-tool invocation.
#[derive(Debug, Error)]
pub enum BorgError {
    /// The tool ran and exited with a non-success code.
    #[error("{message}")]
    Command {
        code: ReturnCode,
        message: String,
        /// Message of a matching hint log line, when one was emitted.
        hint: Option<String>,
    },

    /// The tool could not be spawned or produced unreadable output.
    #[error("failed to run borg: {0}")]
    Io(String),

    /// Cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl BorgError {
    /// The exit code, for errors that carry one.
    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            BorgError::Command { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the underlying code is in the recoverable set.
    pub fn is_recoverable(&self) -> bool {
        self.return_code()
            .map(|code| code.is_recoverable())
            .unwrap_or(false)
    }
}

impl From<BorgError> for CommonError {
    fn from(value: BorgError) -> Self {
        match value {
            BorgError::Cancelled => CommonError::Cancelled,
            other => CommonError::Subprocess(other.to_string()),
        }
    }
}

/// One parsed stderr line of the archive tool.
///
/// The tool is always invoked with `--log-json`; stderr carries one JSON
/// object per line whose `type` field selects the shape. Unknown lines are
/// dropped after a debug trace.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogLine {
    ArchiveProgress {
        #[serde(default)]
        original_size: u64,
        #[serde(default)]
        compressed_size: u64,
        #[serde(default)]
        deduplicated_size: u64,
        #[serde(default)]
        nfiles: u64,
        path: Option<String>,
        time: Option<f64>,
    },
    LogMessage {
        levelname: Option<String>,
        name: Option<String>,
        message: Option<String>,
        msgid: Option<String>,
        time: Option<f64>,
    },
    FileStatus {
        status: Option<String>,
        path: Option<String>,
    },
    ProgressMessage {
        operation: Option<u64>,
        msgid: Option<String>,
        #[serde(default)]
        finished: bool,
        message: Option<String>,
        time: Option<f64>,
    },
    ProgressPercent {
        operation: Option<u64>,
        msgid: Option<String>,
        #[serde(default)]
        finished: bool,
        message: Option<String>,
        current: Option<u64>,
        total: Option<u64>,
        time: Option<f64>,
    },
}

impl LogLine {
    /// Message text for lines that carry one.
    pub fn message(&self) -> Option<&str> {
        match self {
            LogLine::LogMessage { message, .. }
            | LogLine::ProgressMessage { message, .. }
            | LogLine::ProgressPercent { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

/// Parse stderr into log lines, dropping anything unrecognized.
pub fn parse_log_lines(stderr: &[u8]) -> Vec<LogLine> {
    let mut result = Vec::new();

    for line in stderr.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }

        match serde_json::from_slice::<LogLine>(line) {
            Ok(parsed) => result.push(parsed),
            Err(e) => {
                debug!(
                    line = %String::from_utf8_lossy(line),
                    error = %e,
                    "unknown log message line"
                );
            }
        }
    }

    result
}

/// Forward parsed tool messages into the local log.
pub fn log_messages(lines: &[LogLine]) {
    for line in lines {
        if let LogLine::LogMessage {
            levelname, message, ..
        } = line
        {
            let Some(message) = message.as_deref().filter(|m| !m.is_empty()) else {
                continue;
            };

            match levelname.as_deref() {
                Some("ERROR") | Some("CRITICAL") => warn!("[BORG] {message}"),
                Some("WARNING") => warn!("[BORG] {message}"),
                _ => info!("[BORG] {message}"),
            }
        }
    }
}

/// Turn an exit code plus its log lines into a result.
pub fn handle_return_code(code: ReturnCode, lines: &[LogLine]) -> std::result::Result<(), BorgError> {
    let command_error = |message: &str, hint: Option<String>| BorgError::Command {
        code,
        message: message.to_string(),
        hint,
    };

    match code {
        ReturnCode::Success => Ok(()),
        ReturnCode::Warning => {
            log_messages(lines);
            Ok(())
        }
        ReturnCode::Error => {
            log_messages(lines);
            Err(command_error("borg command failed, check log", None))
        }
        ReturnCode::RepositoryDoesNotExist => {
            Err(command_error("configured repository does not exist", None))
        }
        ReturnCode::RepositoryIsInvalid => Err(command_error(
            "configured location doesn't point to a valid repository",
            None,
        )),
        ReturnCode::PasscommandFailure => {
            log_messages(lines);
            Err(command_error("borg passcommand failed, check log", None))
        }
        ReturnCode::PassphraseWrong => {
            Err(command_error("configured passphrase is wrong", None))
        }
        ReturnCode::ConnectionClosed => {
            log_messages(lines);
            Err(command_error("borg connection closed, check log", None))
        }
        ReturnCode::ConnectionClosedWithHint => {
            let hint = lines.iter().find_map(|line| match line {
                LogLine::LogMessage {
                    msgid: Some(msgid),
                    message: Some(message),
                    ..
                } if msgid == "ConnectionClosedWithHint" => Some(message.clone()),
                _ => None,
            });

            match hint {
                Some(hint) => Err(command_error(&hint.clone(), Some(hint))),
                None => {
                    log_messages(lines);
                    Err(command_error("borg connection closed, check log", None))
                }
            }
        }
        ReturnCode::Other(raw) => {
            log_messages(lines);
            Err(command_error(&format!("unknown return code: {raw}"), None))
        }
    }
}

/// Outcome of one tool invocation.
pub struct RunOutcome {
    pub code: ReturnCode,
    pub lines: Vec<LogLine>,
    pub stdout: Vec<u8>,
}

/// Spawns the archive tool. Abstracted so the client can be exercised
/// without the binary.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    /// Run `borg --log-json <args>` with `env`, optionally piping `input`
    /// into stdin.
    async fn run(
        &self,
        cancel: &CancellationToken,
        args: Vec<String>,
        env: HashMap<String, String>,
        input: Option<InputStream>,
    ) -> std::result::Result<RunOutcome, BorgError>;

    /// Raw `borg --version` output.
    async fn version_output(&self) -> std::result::Result<String, BorgError>;
}

/// The real subprocess runner.
pub struct ProcessRunner;

fn log_env(env: &HashMap<String, String>) {
    for (key, value) in env {
        if key.to_lowercase().contains("pass") {
            debug!("env: {key} = ******");
        } else {
            debug!("env: {key} = {value}");
        }
    }
}

#[async_trait::async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        args: Vec<String>,
        env: HashMap<String, String>,
        input: Option<InputStream>,
    ) -> std::result::Result<RunOutcome, BorgError> {
        let mut final_args = vec!["--log-json".to_string()];
        final_args.extend(args);

        debug!(command = ?final_args, "command: borg");
        log_env(&env);

        let mut command = Command::new("borg");
        command
            .args(&final_args)
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if input.is_some() {
            debug!("providing data to stdin");
            command.stdin(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .map_err(|e| BorgError::Io(format!("failed to spawn borg: {e}")))?;

        let feeder = input.map(|mut input| {
            let mut stdin = child.stdin.take().expect("stdin is piped");
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut input, &mut stdin).await {
                    debug!(error = %e, "stdin feed ended early");
                }
                // stdin drops here, closing the pipe.
            })
        });

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| BorgError::Io(e.to_string()))?
            }
            _ = cancel.cancelled() => {
                debug!("borg invocation cancelled");
                return Err(BorgError::Cancelled);
            }
        };

        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let raw_code = output.status.code().unwrap_or(-1);
        debug!(exit_code = raw_code, "command exited");

        Ok(RunOutcome {
            code: ReturnCode::from_exit_code(raw_code),
            lines: parse_log_lines(&output.stderr),
            stdout: output.stdout,
        })
    }

    async fn version_output(&self) -> std::result::Result<String, BorgError> {
        let output = Command::new("borg")
            .arg("--version")
            .output()
            .await
            .map_err(|e| BorgError::Io(format!("failed to get borg version: {e}")))?;

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Decode a `--json` stdout payload.
pub fn decode_output<T: serde::de::DeserializeOwned>(stdout: &[u8]) -> Result<T> {
    serde_json::from_slice(stdout)
        .map_err(|e| CommonError::Serialization(format!("borg output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(ReturnCode::from_exit_code(0), ReturnCode::Success);
        assert_eq!(ReturnCode::from_exit_code(1), ReturnCode::Warning);
        assert_eq!(ReturnCode::from_exit_code(2), ReturnCode::Error);
        assert_eq!(
            ReturnCode::from_exit_code(13),
            ReturnCode::RepositoryDoesNotExist
        );
        assert_eq!(ReturnCode::from_exit_code(52), ReturnCode::PassphraseWrong);
        assert_eq!(ReturnCode::from_exit_code(99), ReturnCode::Other(99));
    }

    #[test]
    fn test_recoverable_codes() {
        assert!(ReturnCode::RepositoryDoesNotExist.is_recoverable());
        assert!(ReturnCode::RepositoryIsInvalid.is_recoverable());
        assert!(ReturnCode::PassphraseWrong.is_recoverable());
        assert!(!ReturnCode::Error.is_recoverable());
        assert!(!ReturnCode::Success.is_recoverable());
    }

    #[test]
    fn test_parse_known_log_lines() {
        let stderr = concat!(
            r#"{"type": "log_message", "levelname": "WARNING", "name": "borg.archiver", "message": "stale lock"}"#,
            "\n",
            r#"{"type": "archive_progress", "original_size": 100, "compressed_size": 50, "deduplicated_size": 10, "nfiles": 3}"#,
            "\n",
            r#"{"type": "file_status", "status": "A", "path": "/etc/passwd"}"#,
            "\n",
            r#"{"type": "progress_percent", "operation": 1, "msgid": "cache.sync", "finished": false, "current": 5, "total": 10}"#,
            "\n",
            "not json at all\n",
            r#"{"type": "something_new", "whatever": true}"#,
        )
        .as_bytes();

        let lines = parse_log_lines(stderr);
        assert_eq!(lines.len(), 4);
        assert!(matches!(lines[0], LogLine::LogMessage { .. }));
        assert!(matches!(lines[1], LogLine::ArchiveProgress { .. }));
        assert!(matches!(lines[2], LogLine::FileStatus { .. }));
        assert!(matches!(lines[3], LogLine::ProgressPercent { .. }));
    }

    #[test]
    fn test_success_and_warning_surface_as_success() {
        assert!(handle_return_code(ReturnCode::Success, &[]).is_ok());
        assert!(handle_return_code(ReturnCode::Warning, &[]).is_ok());
    }

    #[test]
    fn test_error_codes_become_structured_errors() {
        let err = handle_return_code(ReturnCode::RepositoryDoesNotExist, &[]).unwrap_err();
        assert_eq!(
            err.return_code(),
            Some(ReturnCode::RepositoryDoesNotExist)
        );
        assert!(err.is_recoverable());

        let err = handle_return_code(ReturnCode::Error, &[]).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_connection_closed_hint_is_carried() {
        let lines = parse_log_lines(
            br#"{"type": "log_message", "levelname": "ERROR", "msgid": "ConnectionClosedWithHint", "message": "Broken pipe (is borg installed remotely?)"}"#,
        );

        let err = handle_return_code(ReturnCode::ConnectionClosedWithHint, &lines).unwrap_err();
        match err {
            BorgError::Command { hint, message, .. } => {
                assert_eq!(
                    hint.as_deref(),
                    Some("Broken pipe (is borg installed remotely?)")
                );
                assert!(message.contains("Broken pipe"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
