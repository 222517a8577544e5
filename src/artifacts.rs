//! Fixed file names inside a session directory, shared by the RPP and the TPS.
//!
//! Data files are always written before their `.complete` marker. Consumers poll for the
//! marker and never infer completion from the data file alone.

use std::{
    io,
    path::{Path, PathBuf},
};

use crate::status::SessionStatus;

pub const SESSION_PARAMS: &str = "session.params";
pub const RPP_STATUS: &str = "rpp.status";
pub const TPS_STATUS: &str = "tps.status";
pub const AES_KEY: &str = "aes.key.enc";
pub const ALGORITHM: &str = "algorithm.txt";
pub const CLIENT_GENOTYPES: &str = "client.genotypes.enc";
pub const CLIENT_EXCLUDED: &str = "client.excluded.enc";
pub const CLIENT_DATA_COMPLETE: &str = "client.data.complete";
pub const RPP_GENOTYPES: &str = "rpp.genotypes";
pub const RPP_GENOTYPES_COMPLETE: &str = "rpp.genotypes.complete";
pub const RPP_EXCLUDED: &str = "rpp.excluded";
pub const RESULTS: &str = "results.enc";
pub const RESULTS_COMPLETE: &str = "results.complete";

/// The files the TPS needs to run a job.
pub const TPS_INPUTS: [&str; 7] = [
    AES_KEY,
    ALGORITHM,
    CLIENT_GENOTYPES,
    CLIENT_EXCLUDED,
    RPP_GENOTYPES,
    RPP_EXCLUDED,
    CLIENT_DATA_COMPLETE,
];

/// Paths of one session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    dir: PathBuf,
}

impl SessionFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The path of the artifact `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Whether the artifact `name` exists.
    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path(name)).await.unwrap_or(false)
    }

    /// Writes `contents` to `name`.
    pub async fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> io::Result<()> {
        tokio::fs::write(self.path(name), contents).await
    }

    /// Reads the artifact `name`.
    pub async fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path(name)).await
    }

    /// Creates the (empty) marker `name`, after the data it marks was written.
    pub async fn mark_complete(&self, name: &str) -> io::Result<()> {
        tokio::fs::write(self.path(name), b"").await
    }

    /// Replaces the status file `name` with `status`.
    ///
    /// The line is written to a temporary file first and renamed, a reader never sees a
    /// partially written status.
    pub async fn write_status(&self, name: &str, status: &SessionStatus) -> io::Result<()> {
        let tmp = self.path(&format!("{name}.tmp"));
        tokio::fs::write(&tmp, format!("{status}\n")).await?;
        tokio::fs::rename(tmp, self.path(name)).await
    }

    /// Reads the status file `name`, `None` if it is missing or unreadable.
    pub async fn read_status(&self, name: &str) -> Option<SessionStatus> {
        let text = tokio::fs::read_to_string(self.path(name)).await.ok()?;
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::status::State;

    use super::*;

    #[tokio::test]
    async fn status_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path());
        assert_eq!(files.read_status(RPP_STATUS).await, None);
        let status = SessionStatus::with_detail(State::TpsRunning, "job 42");
        files.write_status(RPP_STATUS, &status).await.unwrap();
        let restored = files.read_status(RPP_STATUS).await.unwrap();
        assert!(restored.same_as(&status));
        assert!(!files.exists(&format!("{RPP_STATUS}.tmp")).await);
    }

    #[tokio::test]
    async fn markers() {
        let dir = tempfile::tempdir().unwrap();
        let files = SessionFiles::new(dir.path());
        files.write(RPP_GENOTYPES, b"h1\tg1\t0,1\n").await.unwrap();
        assert!(files.exists(RPP_GENOTYPES).await);
        assert!(!files.exists(RPP_GENOTYPES_COMPLETE).await);
        files.mark_complete(RPP_GENOTYPES_COMPLETE).await.unwrap();
        assert!(files.exists(RPP_GENOTYPES_COMPLETE).await);
        assert_eq!(files.read(RPP_GENOTYPES).await.unwrap(), b"h1\tg1\t0,1\n");
    }
}
