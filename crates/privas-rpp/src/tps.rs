//! How the RPP reaches the Third-Party Server.

use std::{
    path::{Path, PathBuf},
    process::Output,
};

use privas::{
    artifacts::{RESULTS, RESULTS_COMPLETE, SessionFiles, TPS_INPUTS, TPS_STATUS},
    crypto::PublicKey,
    session_id::SessionId,
    tps::{JobState, JobStatus},
};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TpsConfig;

/// The operations the session state machine needs from the TPS.
pub trait TpsLink: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The SPKI PEM of the TPS key, handed to Clients.
    fn public_key(&self) -> impl Future<Output = Result<String, Self::Error>> + Send;

    /// Copies the job inputs of `session` to the TPS.
    ///
    /// Implementations must transfer the `client.data.complete` marker last.
    fn upload(
        &self,
        session: &SessionId,
        files: &SessionFiles,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Starts the job of `session`, after [`TpsLink::upload`].
    fn launch(&self, session: &SessionId) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// The current `tps.status` of `session`.
    fn status(
        &self,
        session: &SessionId,
    ) -> impl Future<Output = Result<JobStatus, Self::Error>> + Send;

    /// The encrypted results of `session`, once its job is done.
    fn fetch_results(
        &self,
        session: &SessionId,
    ) -> impl Future<Output = Result<Vec<u8>, Self::Error>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum CommandTpsError {
    #[error("unable to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to run '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' failed ({status}): {stderr}")]
    Command {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("the TPS key is not a valid public key: {0}")]
    InvalidKey(String),
    #[error("invalid TPS status: {0}")]
    InvalidStatus(String),
    #[error("the results of session {0} are not complete")]
    ResultsNotReady(SessionId),
}

/// A TPS whose session directories are reachable from the RPP (e.g. through a shared mount)
/// and whose jobs are started with the configured shell commands.
///
/// Commands may use the placeholders `{session}`, `{dir}` (the TPS session directory),
/// `{address}` and `{user}`.
#[derive(Debug, Clone)]
pub struct CommandTps {
    config: TpsConfig,
}

impl CommandTps {
    pub fn new(config: TpsConfig) -> Self {
        Self { config }
    }

    /// The TPS side directory of `session`.
    pub fn session_files(&self, session: &SessionId) -> SessionFiles {
        SessionFiles::new(self.config.session_dir.join(session.as_str()))
    }

    fn expand(&self, template: &str, session: Option<&SessionId>) -> String {
        let mut command = template
            .replace("{address}", &self.config.address)
            .replace("{user}", &self.config.user);
        if let Some(session) = session {
            let dir = self.session_files(session);
            command = command
                .replace("{session}", session.as_str())
                .replace("{dir}", &dir.dir().display().to_string());
        }
        command
    }

    async fn run(&self, command: String) -> Result<Output, CommandTpsError> {
        debug!(%command, "running TPS command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandTpsError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(CommandTpsError::Command {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CommandTpsError + '_ {
    move |source| CommandTpsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl TpsLink for CommandTps {
    type Error = CommandTpsError;

    async fn public_key(&self) -> Result<String, Self::Error> {
        let output = self
            .run(self.expand(&self.config.get_key_command, None))
            .await?;
        let pem = String::from_utf8_lossy(&output.stdout).trim().to_string();
        PublicKey::decode(&pem).map_err(|err| CommandTpsError::InvalidKey(err.to_string()))?;
        Ok(pem)
    }

    async fn upload(&self, session: &SessionId, files: &SessionFiles) -> Result<(), Self::Error> {
        let remote = self.session_files(session);
        tokio::fs::create_dir_all(remote.dir())
            .await
            .map_err(io_error(remote.dir()))?;
        let initial = format!("{}\n", JobStatus::new(JobState::Pending));
        let status_path = remote.path(TPS_STATUS);
        tokio::fs::write(&status_path, initial)
            .await
            .map_err(io_error(&status_path))?;
        for name in TPS_INPUTS {
            let target = remote.path(name);
            tokio::fs::copy(files.path(name), &target)
                .await
                .map_err(io_error(&target))?;
        }
        info!(%session, dir = %remote.dir().display(), "session uploaded to the TPS");
        Ok(())
    }

    async fn launch(&self, session: &SessionId) -> Result<(), Self::Error> {
        self.run(self.expand(&self.config.launch_command, Some(session)))
            .await?;
        info!(%session, tps = %self.config.name, "TPS job launched");
        Ok(())
    }

    async fn status(&self, session: &SessionId) -> Result<JobStatus, Self::Error> {
        let path = self.session_files(session).path(TPS_STATUS);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(io_error(&path))?;
        text.parse().map_err(CommandTpsError::InvalidStatus)
    }

    async fn fetch_results(&self, session: &SessionId) -> Result<Vec<u8>, Self::Error> {
        let remote = self.session_files(session);
        if !remote.exists(RESULTS_COMPLETE).await {
            return Err(CommandTpsError::ResultsNotReady(session.clone()));
        }
        let path = remote.path(RESULTS);
        tokio::fs::read(&path).await.map_err(io_error(&path))
    }
}

#[cfg(test)]
mod tests {
    use privas::artifacts::{CLIENT_DATA_COMPLETE, RPP_GENOTYPES};

    use super::*;

    fn tps(dir: &Path, launch: &str) -> CommandTps {
        CommandTps::new(TpsConfig {
            name: "test TPS".to_string(),
            address: "localhost".to_string(),
            user: "privas".to_string(),
            launch_command: launch.to_string(),
            get_key_command: "false".to_string(),
            session_dir: dir.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn upload_launch_and_poll() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(local.path());
        for name in TPS_INPUTS {
            files.write(name, name.as_bytes()).await.unwrap();
        }
        let tps = tps(remote.path(), "printf 'RUNNING\\t{user}@{address}\\n' > {dir}/tps.status");
        let session = SessionId::generate();

        tps.upload(&session, &files).await.unwrap();
        let uploaded = tps.session_files(&session);
        assert!(uploaded.exists(CLIENT_DATA_COMPLETE).await);
        assert_eq!(uploaded.read(RPP_GENOTYPES).await.unwrap(), RPP_GENOTYPES.as_bytes());
        assert_eq!(
            tps.status(&session).await.unwrap(),
            JobStatus::new(JobState::Pending)
        );

        tps.launch(&session).await.unwrap();
        assert_eq!(
            tps.status(&session).await.unwrap(),
            JobStatus {
                state: JobState::Running,
                detail: Some("privas@localhost".to_string()),
            }
        );
        assert!(matches!(
            tps.fetch_results(&session).await,
            Err(CommandTpsError::ResultsNotReady(_))
        ));
        uploaded.write(RESULTS, b"sealed").await.unwrap();
        uploaded.mark_complete(RESULTS_COMPLETE).await.unwrap();
        assert_eq!(tps.fetch_results(&session).await.unwrap(), b"sealed");
    }

    #[tokio::test]
    async fn failing_commands_report_stderr() {
        let remote = tempfile::tempdir().unwrap();
        let tps = tps(remote.path(), "echo unreachable >&2; exit 3");
        let err = tps.launch(&SessionId::generate()).await.unwrap_err();
        assert!(matches!(err, CommandTpsError::Command { ref stderr, .. } if stderr == "unreachable"));
        assert!(tps.public_key().await.is_err());
        assert!(matches!(
            tps.status(&SessionId::generate()).await,
            Err(CommandTpsError::Io { .. })
        ));
    }
}
