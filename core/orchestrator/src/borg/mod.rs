//! Archive-tool client.
//!
//! Thin wrapper over the `borg` binary: version probe at construction,
//! repository info/init, archive creation from paths or streamed input, and
//! compaction. Every invocation runs with the modern exit-code set and JSON
//! logging.

pub mod api;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use semver::Version;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;

use api::{
    decode_output, handle_return_code, BorgError, InputStream, ProcessRunner, ReturnCode, Runner,
};

fn supported_version_min() -> Version {
    Version::new(1, 2, 5)
}

fn supported_version_upper() -> Version {
    Version::new(2, 0, 0)
}

/// `borg info --json` payload, reduced to the fields the orchestrator reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfoOutput {
    #[serde(default)]
    pub repository: RepositoryInfo,
}

/// Repository section of [`InfoOutput`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryInfo {
    #[serde(default)]
    pub id: String,
    pub location: Option<String>,
}

/// `borg create --json` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateOutput {
    pub archive: Option<ArchiveOutput>,
}

/// Archive section of [`CreateOutput`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveOutput {
    #[serde(default)]
    pub name: String,
    pub duration: Option<f64>,
    pub stats: Option<ArchiveStats>,
}

/// Size statistics of a created archive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveStats {
    #[serde(default)]
    pub original_size: u64,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default)]
    pub deduplicated_size: u64,
    #[serde(default)]
    pub nfiles: u64,
}

/// Client for the archive tool, shareable across jobs.
pub struct BorgClient {
    config: RwLock<Config>,
    runner: Arc<dyn Runner>,
}

type BorgResult<T> = std::result::Result<T, BorgError>;

impl BorgClient {
    /// Construct a client, probing the installed tool version.
    ///
    /// # Errors
    /// - The binary is missing or its version is outside `>= 1.2.5, < 2.0.0`
    pub async fn connect(config: Config) -> BorgResult<Self> {
        let client = Self::with_runner(config, Arc::new(ProcessRunner));

        let version = client.version().await?;
        if version < supported_version_min() || version >= supported_version_upper() {
            return Err(BorgError::Io(format!(
                "unsupported borg version (must be >= {} and < {}): {version}",
                supported_version_min(),
                supported_version_upper()
            )));
        }

        info!(version = %version, "borg version");

        Ok(client)
    }

    /// Construct with a specific runner; used by tests.
    pub(crate) fn with_runner(config: Config, runner: Arc<dyn Runner>) -> Self {
        Self {
            config: RwLock::new(config),
            runner,
        }
    }

    /// Swap in a reloaded configuration.
    pub async fn set_config(&self, config: Config) {
        *self.config.write().await = config;
    }

    /// Installed tool version.
    pub async fn version(&self) -> BorgResult<Version> {
        debug!("determining borg version");

        let output = self.runner.version_output().await?;
        let mut split = output.split_whitespace();
        let (Some(_), Some(raw), None) = (split.next(), split.next(), split.next()) else {
            return Err(BorgError::Io(format!(
                "failed to parse borg version: {output}"
            )));
        };

        Version::parse(raw).map_err(|e| BorgError::Io(format!("failed to parse borg version: {e}")))
    }

    /// Repository information.
    pub async fn info(&self, cancel: &CancellationToken) -> BorgResult<InfoOutput> {
        let (mut args, env) = self.base_invocation(&["info", "--json"]).await;
        args.push(self.location().await);

        let outcome = self.runner.run(cancel, args, env, None).await?;
        handle_return_code(outcome.code, &outcome.lines)?;

        decode_output(&outcome.stdout).map_err(|e| BorgError::Io(e.to_string()))
    }

    /// Initialize the repository.
    ///
    /// Encryption mode is `keyfile` when a passphrase source is configured,
    /// `none` otherwise. Repeating this on an existing repository fails with
    /// a deterministic non-success code.
    pub async fn init(&self, cancel: &CancellationToken) -> BorgResult<()> {
        let encrypted = self.config.read().await.encryption.is_some();

        let mut base = vec!["init", "--make-parent-dirs"];
        base.push(if encrypted {
            "--encryption=keyfile"
        } else {
            "--encryption=none"
        });

        let (mut args, env) = self.base_invocation(&base).await;
        let location = self.location().await;
        info!(location = %location, "initializing repository");
        args.push(location);

        let outcome = self.runner.run(cancel, args, env, None).await?;
        handle_return_code(outcome.code, &outcome.lines)?;

        Ok(())
    }

    /// Create an archive from host paths.
    pub async fn create_with_paths(
        &self,
        cancel: &CancellationToken,
        archive_name: &str,
        paths: &[String],
    ) -> BorgResult<CreateOutput> {
        for path in paths {
            if !Path::new(path).is_absolute() {
                return Err(BorgError::Io(format!("path {path} is not an absolute path")));
            }
        }

        let (mut args, env) = self
            .base_invocation(&["create", "--json", "--compression", "zlib,6"])
            .await;
        args.push(format!("{}::{archive_name}", self.location().await));
        args.extend(paths.iter().cloned());

        info!(archive = archive_name, ?paths, "creating archive");

        let outcome = self.runner.run(cancel, args, env, None).await?;
        handle_return_code(outcome.code, &outcome.lines)?;

        decode_output(&outcome.stdout).map_err(|e| BorgError::Io(e.to_string()))
    }

    /// Create an archive from a byte stream piped into stdin.
    ///
    /// The archive is judged solely by the tool's exit code; whether the
    /// producing process succeeded is the caller's concern.
    pub async fn create_with_input(
        &self,
        cancel: &CancellationToken,
        archive_name: &str,
        input: InputStream,
    ) -> BorgResult<CreateOutput> {
        let (mut args, env) = self
            .base_invocation(&["create", "--json", "--compression", "zlib,6"])
            .await;
        args.push(format!("{}::{archive_name}", self.location().await));
        args.push("-".to_string());

        info!(archive = archive_name, "creating archive from input");

        let outcome = self.runner.run(cancel, args, env, Some(input)).await?;
        handle_return_code(outcome.code, &outcome.lines)?;

        decode_output(&outcome.stdout).map_err(|e| BorgError::Io(e.to_string()))
    }

    /// Compact the repository.
    pub async fn compact(&self, cancel: &CancellationToken) -> BorgResult<()> {
        let (mut args, env) = self.base_invocation(&["compact"]).await;
        let location = self.location().await;
        info!(location = %location, "compacting repository");
        args.push(location);

        let outcome = self.runner.run(cancel, args, env, None).await?;
        handle_return_code(outcome.code, &outcome.lines)?;

        Ok(())
    }

    /// Probe the repository, initializing it when it does not exist yet.
    ///
    /// A recoverable repository-does-not-exist answer triggers `init`
    /// followed by one `info` retry; anything else is passed through.
    pub async fn ensure_repository(&self, cancel: &CancellationToken) -> BorgResult<InfoOutput> {
        match self.info(cancel).await {
            Ok(info) => Ok(info),
            Err(e)
                if e.is_recoverable()
                    && e.return_code() == Some(ReturnCode::RepositoryDoesNotExist) =>
            {
                info!("borg repository does not exist");
                self.init(cancel).await?;
                self.info(cancel).await
            }
            Err(e) => Err(e),
        }
    }

    async fn location(&self) -> String {
        self.config.read().await.repo.location.clone()
    }

    async fn base_invocation(&self, base: &[&str]) -> (Vec<String>, HashMap<String, String>) {
        let config = self.config.read().await;

        let mut args: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        if let Some(identity_file) = &config.repo.identity_file {
            debug!(identity_file = %identity_file, "using identity file");
            args.push("--rsh".to_string());
            args.push(format!("ssh -i {identity_file}"));
        }

        let mut env = HashMap::from([
            ("LANG".to_string(), "en_US.UTF-8".to_string()),
            ("LC_CTYPE".to_string(), "en_US.UTF-8".to_string()),
            ("BORG_EXIT_CODES".to_string(), "modern".to_string()),
        ]);

        if let Some(encryption) = &config.encryption {
            if let Some(command) = &encryption.secret_command {
                env.insert("BORG_PASSCOMMAND".to_string(), command.clone());
            } else if let Some(secret) = &encryption.secret {
                env.insert("BORG_PASSPHRASE".to_string(), secret.clone());
            }
        }

        (args, env)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use api::RunOutcome;
    use std::sync::Mutex;

    struct ScriptedRunner {
        version: String,
        // Queue of (expected subcommand, outcome producer).
        outcomes: Mutex<Vec<RunOutcome>>,
        invocations: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(outcomes: Vec<RunOutcome>) -> Self {
            Self {
                version: "borg 1.2.8".to_string(),
                outcomes: Mutex::new(outcomes),
                invocations: Mutex::new(Vec::new()),
            }
        }

        fn invocations(&self) -> Vec<Vec<String>> {
            self.invocations.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Runner for ScriptedRunner {
        async fn run(
            &self,
            _cancel: &CancellationToken,
            args: Vec<String>,
            _env: HashMap<String, String>,
            _input: Option<InputStream>,
        ) -> Result<RunOutcome, BorgError> {
            self.invocations.lock().unwrap().push(args);

            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                panic!("unexpected borg invocation");
            }
            Ok(outcomes.remove(0))
        }

        async fn version_output(&self) -> Result<String, BorgError> {
            Ok(self.version.clone())
        }
    }

    fn outcome(code: ReturnCode, stdout: &str) -> RunOutcome {
        RunOutcome {
            code,
            lines: Vec::new(),
            stdout: stdout.as_bytes().to_vec(),
        }
    }

    fn sample_config() -> Config {
        let file = {
            use std::io::Write;
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(
                br#"
[Repo]
Location = "/srv/repo"

[Encryption]
Secret = "hunter2"
"#,
            )
            .unwrap();
            file
        };

        crate::config::load_config(file.path()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_repository_triggers_init_and_retry() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            outcome(ReturnCode::RepositoryDoesNotExist, ""),
            outcome(ReturnCode::Success, "{}"),
            outcome(
                ReturnCode::Success,
                r#"{"repository": {"id": "abc123", "location": "/srv/repo"}}"#,
            ),
        ]));

        let client = BorgClient::with_runner(sample_config(), runner.clone());
        let cancel = CancellationToken::new();

        let info = client.ensure_repository(&cancel).await.unwrap();
        assert_eq!(info.repository.id, "abc123");

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 3);
        assert_eq!(invocations[0][0], "info");
        assert_eq!(invocations[1][0], "init");
        assert!(invocations[1].contains(&"--make-parent-dirs".to_string()));
        assert!(invocations[1].contains(&"--encryption=keyfile".to_string()));
        assert_eq!(invocations[2][0], "info");
    }

    #[tokio::test]
    async fn test_unrecoverable_info_error_is_passed_through() {
        let runner = Arc::new(ScriptedRunner::new(vec![outcome(ReturnCode::Error, "")]));
        let client = BorgClient::with_runner(sample_config(), runner);
        let cancel = CancellationToken::new();

        let err = client.ensure_repository(&cancel).await.unwrap_err();
        assert_eq!(err.return_code(), Some(ReturnCode::Error));
    }

    #[tokio::test]
    async fn test_init_on_existing_repository_fails_deterministically() {
        // Re-initialization answers with a stable non-success code.
        let runner = Arc::new(ScriptedRunner::new(vec![outcome(ReturnCode::Error, "")]));
        let client = BorgClient::with_runner(sample_config(), runner);
        let cancel = CancellationToken::new();

        let err = client.init(&cancel).await.unwrap_err();
        assert_eq!(err.return_code(), Some(ReturnCode::Error));
    }

    #[tokio::test]
    async fn test_create_with_paths_requires_absolute_paths() {
        let runner = Arc::new(ScriptedRunner::new(Vec::new()));
        let client = BorgClient::with_runner(sample_config(), runner);
        let cancel = CancellationToken::new();

        let err = client
            .create_with_paths(&cancel, "etc-20250101000000", &["relative/path".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not an absolute path"));
    }

    #[tokio::test]
    async fn test_create_with_paths_builds_archive_argument() {
        let runner = Arc::new(ScriptedRunner::new(vec![outcome(
            ReturnCode::Success,
            r#"{"archive": {"name": "etc-20250101000000"}}"#,
        )]));
        let client = BorgClient::with_runner(sample_config(), runner.clone());
        let cancel = CancellationToken::new();

        let output = client
            .create_with_paths(&cancel, "etc-20250101000000", &["/etc".to_string()])
            .await
            .unwrap();
        assert_eq!(output.archive.unwrap().name, "etc-20250101000000");

        let invocation = &runner.invocations()[0];
        assert!(invocation.contains(&"/srv/repo::etc-20250101000000".to_string()));
        assert!(invocation.contains(&"zlib,6".to_string()));
    }

    #[tokio::test]
    async fn test_version_parsing() {
        let runner = Arc::new(ScriptedRunner::new(Vec::new()));
        let client = BorgClient::with_runner(sample_config(), runner);

        let version = client.version().await.unwrap();
        assert_eq!(version, Version::new(1, 2, 8));
    }
}
