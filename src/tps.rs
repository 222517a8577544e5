//! The job run by the Third-Party Server on one session directory.
//!
//! The TPS decrypts the Client's data with the AES key it alone can unwrap, merges both
//! exclusion lists, drops the excluded variants from both matrices and hands them to an
//! [`AssociationTest`]. Results are encrypted for the Client and written before their marker.

use std::{collections::BTreeSet, fmt, str::FromStr};

use tracing::{info, warn};

use crate::{
    artifacts::{
        AES_KEY, ALGORITHM, CLIENT_EXCLUDED, CLIENT_GENOTYPES, RESULTS, RESULTS_COMPLETE,
        RPP_EXCLUDED, RPP_GENOTYPES, SessionFiles, TPS_STATUS,
    },
    crypto::{AesKey, CryptoError, PrivateKey, decrypt_aes, decrypt_rsa, encrypt_aes},
    extractor::{ExtractError, HashedRow, read_exclusions, read_hashed_rows},
};

/// Errors of a TPS job.
#[derive(Debug, thiserror::Error)]
pub enum TpsError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// A session artifact could not be read or written.
    #[error("unable to access {name}")]
    Artifact {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// The association test failed.
    #[error("association test failed: {0}")]
    Test(String),
    /// A results blob could not be parsed.
    #[error("invalid results line {line}: {reason}")]
    InvalidResults { line: usize, reason: String },
}

/// The progress of a job, as reported in `tps.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Error,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Error => "ERROR",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "DONE" => Ok(JobState::Done),
            "ERROR" => Ok(JobState::Error),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// One line of `tps.status`: `STATE[<TAB>detail]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub detail: Option<String>,
}

impl JobStatus {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            detail: None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}\t{}", self.state, detail.replace(['\n', '\t'], " ")),
            None => write!(f, "{}", self.state),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.lines().next().unwrap_or_default();
        let (state, detail) = match line.split_once('\t') {
            Some((state, detail)) => (state, Some(detail.trim().to_string())),
            None => (line, None),
        };
        Ok(Self {
            state: state.parse()?,
            detail: detail.filter(|d| !d.is_empty()),
        })
    }
}

/// The p-value of one (hashed) gene.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneScore {
    pub gene: String,
    pub p_value: f64,
    /// Additional columns reported by the test, passed through untouched.
    pub extra: Vec<String>,
}

/// Writes scores as `geneHash<TAB>pValue[<TAB>extra...]` lines.
pub fn write_results(scores: &[GeneScore]) -> Vec<u8> {
    let mut out = String::new();
    for score in scores {
        out.push_str(&score.gene);
        out.push('\t');
        out.push_str(&score.p_value.to_string());
        for extra in &score.extra {
            out.push('\t');
            out.push_str(extra);
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// Parses the output of [`write_results`].
pub fn parse_results(blob: &[u8]) -> Result<Vec<GeneScore>, TpsError> {
    let text = String::from_utf8_lossy(blob);
    let mut scores = vec![];
    for (i, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let invalid = |reason: &str| TpsError::InvalidResults {
            line: i + 1,
            reason: reason.to_string(),
        };
        let mut fields = line.split('\t');
        let gene = fields.next().unwrap_or_default();
        let p_value = fields
            .next()
            .ok_or_else(|| invalid("missing p-value"))?
            .parse()
            .map_err(|_| invalid("invalid p-value"))?;
        scores.push(GeneScore {
            gene: gene.to_string(),
            p_value,
            extra: fields.map(str::to_string).collect(),
        });
    }
    Ok(scores)
}

/// The statistical test, an external collaborator.
pub trait AssociationTest {
    /// Computes one score per gene from the Client (cases) and RPP (controls) matrices.
    fn run(
        &self,
        algorithm: &str,
        client: &[HashedRow],
        rpp: &[HashedRow],
    ) -> Result<Vec<GeneScore>, String>;
}

/// Runs the association test of one session directory.
pub struct TpsJob<'a, T> {
    files: SessionFiles,
    key: &'a PrivateKey,
    test: T,
}

impl<'a, T: AssociationTest> TpsJob<'a, T> {
    pub fn new(files: SessionFiles, key: &'a PrivateKey, test: T) -> Self {
        Self { files, key, test }
    }

    /// Reports `state` in `tps.status`.
    pub async fn report(&self, status: &JobStatus) -> Result<(), TpsError> {
        self.files
            .write(TPS_STATUS, format!("{status}\n"))
            .await
            .map_err(|source| TpsError::Artifact {
                name: TPS_STATUS,
                source,
            })
    }

    /// Runs the job, reporting `RUNNING` then `DONE` or `ERROR`.
    pub async fn run(&self) -> Result<(), TpsError> {
        self.report(&JobStatus::new(JobState::Running)).await?;
        match self.compute().await {
            Ok(genes) => {
                info!(dir = %self.files.dir().display(), genes, "association test finished");
                self.report(&JobStatus::new(JobState::Done)).await
            }
            Err(err) => {
                warn!(dir = %self.files.dir().display(), "association test failed: {err}");
                self.report(&JobStatus {
                    state: JobState::Error,
                    detail: Some(err.to_string()),
                })
                .await?;
                Err(err)
            }
        }
    }

    async fn read(&self, name: &'static str) -> Result<Vec<u8>, TpsError> {
        self.files
            .read(name)
            .await
            .map_err(|source| TpsError::Artifact { name, source })
    }

    async fn compute(&self) -> Result<usize, TpsError> {
        let aes_key = AesKey::from_bytes(&decrypt_rsa(self.key, &self.read(AES_KEY).await?)?)?;
        let algorithm = String::from_utf8_lossy(&self.read(ALGORITHM).await?).into_owned();
        let client_rows = decrypt_aes(&aes_key, &self.read(CLIENT_GENOTYPES).await?)?;
        let client_excluded = decrypt_aes(&aes_key, &self.read(CLIENT_EXCLUDED).await?)?;
        let rpp_rows = self.read(RPP_GENOTYPES).await?;
        let rpp_excluded = self.read(RPP_EXCLUDED).await?;

        let mut excluded: BTreeSet<String> = read_exclusions(&client_excluded[..])?;
        excluded.extend(read_exclusions(&rpp_excluded[..])?);
        let keep = |rows: Vec<HashedRow>| -> Vec<HashedRow> {
            rows.into_iter()
                .filter(|r| !excluded.contains(&r.variant))
                .collect()
        };
        let client_rows = keep(read_hashed_rows(&client_rows[..])?);
        let rpp_rows = keep(read_hashed_rows(&rpp_rows[..])?);

        let scores = self
            .test
            .run(algorithm.trim(), &client_rows, &rpp_rows)
            .map_err(TpsError::Test)?;
        let results = encrypt_aes(&aes_key, &write_results(&scores))?;
        self.files
            .write(RESULTS, results)
            .await
            .map_err(|source| TpsError::Artifact {
                name: RESULTS,
                source,
            })?;
        self.files
            .mark_complete(RESULTS_COMPLETE)
            .await
            .map_err(|source| TpsError::Artifact {
                name: RESULTS_COMPLETE,
                source,
            })?;
        Ok(scores.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use crate::{
        artifacts::CLIENT_DATA_COMPLETE,
        crypto::{PublicKey, encrypt_rsa, generate_rsa_keypair},
    };

    use super::*;

    static TPS_KEYS: LazyLock<(PublicKey, PrivateKey)> =
        LazyLock::new(|| generate_rsa_keypair().unwrap());

    /// Reports, per gene, the number of rows seen in both matrices.
    struct RowCount;

    impl AssociationTest for RowCount {
        fn run(
            &self,
            algorithm: &str,
            client: &[HashedRow],
            rpp: &[HashedRow],
        ) -> Result<Vec<GeneScore>, String> {
            if algorithm != "count" {
                return Err(format!("unsupported algorithm {algorithm}"));
            }
            let genes: BTreeSet<&str> = client.iter().chain(rpp).map(|r| r.gene.as_str()).collect();
            Ok(genes
                .into_iter()
                .map(|gene| GeneScore {
                    gene: gene.to_string(),
                    p_value: 0.5,
                    extra: vec![
                        client.iter().filter(|r| r.gene == gene).count().to_string(),
                        rpp.iter().filter(|r| r.gene == gene).count().to_string(),
                    ],
                })
                .collect())
        }
    }

    async fn session(dir: &std::path::Path, algorithm: &str) -> (SessionFiles, AesKey) {
        let files = SessionFiles::new(dir);
        let key = AesKey::generate();
        let (tps_public, _) = &*TPS_KEYS;
        files
            .write(AES_KEY, encrypt_rsa(tps_public, key.as_bytes()).unwrap())
            .await
            .unwrap();
        files.write(ALGORITHM, algorithm).await.unwrap();
        let client = b"v1\tgA\t0,1\nv2\tgA\t1,1\nv3\tgB\t2,0\n";
        files
            .write(CLIENT_GENOTYPES, encrypt_aes(&key, client).unwrap())
            .await
            .unwrap();
        files
            .write(CLIENT_EXCLUDED, encrypt_aes(&key, b"v3\n").unwrap())
            .await
            .unwrap();
        files
            .write(RPP_GENOTYPES, b"v1\tgA\t0,0,1\nv2\tgA\t0,1,0\n")
            .await
            .unwrap();
        files.write(RPP_EXCLUDED, b"v2\n").await.unwrap();
        files.mark_complete(CLIENT_DATA_COMPLETE).await.unwrap();
        (files, key)
    }

    #[tokio::test]
    async fn job_merges_exclusions_and_encrypts_results() {
        let dir = tempfile::tempdir().unwrap();
        let (files, key) = session(dir.path(), "count\n").await;
        let (_, tps_private) = &*TPS_KEYS;
        TpsJob::new(files.clone(), tps_private, RowCount)
            .run()
            .await
            .unwrap();
        assert!(files.exists(RESULTS_COMPLETE).await);
        let status: JobStatus = String::from_utf8(files.read(TPS_STATUS).await.unwrap())
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(status.state, JobState::Done);
        let blob = decrypt_aes(&key, &files.read(RESULTS).await.unwrap()).unwrap();
        let scores = parse_results(&blob).unwrap();
        // v2 excluded by the RPP and v3 by the Client
        assert_eq!(
            scores,
            vec![GeneScore {
                gene: "gA".into(),
                p_value: 0.5,
                extra: vec!["1".into(), "1".into()],
            }]
        );
    }

    #[tokio::test]
    async fn failing_test_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (files, _) = session(dir.path(), "unknown").await;
        let (_, tps_private) = &*TPS_KEYS;
        let err = TpsJob::new(files.clone(), tps_private, RowCount)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, TpsError::Test(_)));
        let status: JobStatus = String::from_utf8(files.read(TPS_STATUS).await.unwrap())
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(status.state, JobState::Error);
        assert!(status.detail.unwrap().contains("unsupported algorithm"));
        assert!(!files.exists(RESULTS_COMPLETE).await);
    }

    #[test]
    fn results_lines() {
        let scores = vec![
            GeneScore {
                gene: "h1".into(),
                p_value: 0.001,
                extra: vec![],
            },
            GeneScore {
                gene: "h2".into(),
                p_value: 1.0,
                extra: vec!["12".into(), "note".into()],
            },
        ];
        let blob = write_results(&scores);
        assert_eq!(blob, b"h1\t0.001\nh2\t1\t12\tnote\n");
        assert_eq!(parse_results(&blob).unwrap(), scores);
        assert!(parse_results(b"h1\n").is_err());
        assert!(parse_results(b"h1\tlow\n").is_err());
    }

    #[test]
    fn job_status_lines() {
        assert_eq!(
            "RUNNING".parse::<JobStatus>().unwrap(),
            JobStatus::new(JobState::Running)
        );
        let status: JobStatus = "ERROR\tdisk full\n".parse().unwrap();
        assert_eq!(status.detail.as_deref(), Some("disk full"));
        assert!("STARTED".parse::<JobStatus>().is_err());
    }
}
