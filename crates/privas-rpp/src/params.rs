//! `session.params`: what the RPP must remember about a session to resume it after a restart.

use std::path::Path;

use privas::{
    artifacts::SESSION_PARAMS,
    crypto::{CryptoError, PublicKey},
    extractor::Criteria,
    session_id::SessionId,
    utils::kv,
};

const SESSION_ID: &str = "SESSION_ID";
const DATASET: &str = "DATASET";
const GNOMAD_VERSION: &str = "GNOMAD_VERSION";
const MAX_AF: &str = "MAX_AF";
const MAX_AF_SUB: &str = "MAX_AF_SUB";
const LIMIT_CONSEQUENCE: &str = "LIMIT_CONSEQUENCE";
const LIMIT_SNV: &str = "LIMIT_SNV";
const BEDFILE: &str = "BEDFILE";
const QC_PARAMS: &str = "QC_PARAMS";
const HASH_SALT: &str = "HASH_SALT";
const CLIENT_PUBLIC_KEY: &str = "CLIENT_PUBLIC_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("unable to access {SESSION_PARAMS}")]
    Io(#[from] std::io::Error),
    #[error("line {0} of {SESSION_PARAMS} is not KEY<TAB>value")]
    Syntax(usize),
    #[error("missing {0} in {SESSION_PARAMS}")]
    Missing(&'static str),
    #[error("invalid {key} in {SESSION_PARAMS}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The parameters a session was created with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub session: SessionId,
    pub dataset: String,
    pub gnomad_version: String,
    /// The Client's filters, with the intersection of both parties' regions.
    pub criteria: Criteria,
    pub qc_params: String,
    pub hash_salt: String,
    pub client_public_key: PublicKey,
}

impl SessionParams {
    pub fn to_text(&self) -> Result<String, ParamsError> {
        let mut out = String::new();
        kv::push(&mut out, SESSION_ID, &self.session);
        kv::push(&mut out, DATASET, &self.dataset);
        kv::push(&mut out, GNOMAD_VERSION, &self.gnomad_version);
        kv::push(&mut out, MAX_AF, self.criteria.max_af);
        kv::push(&mut out, MAX_AF_SUB, self.criteria.max_af_sub);
        kv::push(&mut out, LIMIT_CONSEQUENCE, self.criteria.min_consequence);
        kv::push(&mut out, LIMIT_SNV, self.criteria.snv_only);
        kv::push(&mut out, BEDFILE, &self.criteria.bed);
        kv::push(&mut out, QC_PARAMS, self.qc_params.replace(['\n', '\t'], " "));
        kv::push(&mut out, HASH_SALT, &self.hash_salt);
        kv::push(&mut out, CLIENT_PUBLIC_KEY, self.client_public_key.encode()?);
        Ok(out)
    }

    pub fn parse(text: &str) -> Result<Self, ParamsError> {
        let mut values = std::collections::HashMap::new();
        for entry in kv::entries(text) {
            let entry = entry.map_err(ParamsError::Syntax)?;
            values.insert(entry.key, entry.value);
        }
        let get = |key: &'static str| values.get(key).copied().ok_or(ParamsError::Missing(key));
        fn parsed<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ParamsError>
        where
            T::Err: std::fmt::Display,
        {
            value.trim().parse().map_err(|err: T::Err| ParamsError::Invalid {
                key,
                reason: err.to_string(),
            })
        }
        Ok(Self {
            session: parsed(SESSION_ID, get(SESSION_ID)?)?,
            dataset: get(DATASET)?.to_string(),
            gnomad_version: get(GNOMAD_VERSION)?.to_string(),
            criteria: Criteria {
                max_af: parsed(MAX_AF, get(MAX_AF)?)?,
                max_af_sub: parsed(MAX_AF_SUB, get(MAX_AF_SUB)?)?,
                min_consequence: parsed(LIMIT_CONSEQUENCE, get(LIMIT_CONSEQUENCE)?)?,
                snv_only: parsed(LIMIT_SNV, get(LIMIT_SNV)?)?,
                bed: parsed(BEDFILE, get(BEDFILE)?)?,
            },
            qc_params: get(QC_PARAMS)?.to_string(),
            hash_salt: get(HASH_SALT)?.to_string(),
            client_public_key: PublicKey::decode(get(CLIENT_PUBLIC_KEY)?)?,
        })
    }

    /// Writes the parameters into the session directory `dir`.
    pub async fn save(&self, dir: &Path) -> Result<(), ParamsError> {
        tokio::fs::write(dir.join(SESSION_PARAMS), self.to_text()?).await?;
        Ok(())
    }

    /// Reads the parameters of the session directory `dir`.
    pub async fn load(dir: &Path) -> Result<Self, ParamsError> {
        let text = tokio::fs::read_to_string(dir.join(SESSION_PARAMS)).await?;
        Self::parse(&text)
    }
}
