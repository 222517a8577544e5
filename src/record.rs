//! The Client's copy of the protocol state, saved as a `*.privas` file.
//!
//! The file is a list of `KEY<TAB>value` lines. Every key is mandatory, unknown keys are
//! rejected, and loading reports every problem of a file at once.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    bed::BedFile,
    crypto::{AesKey, CryptoError, PrivateKey, PublicKey},
    extractor::{Criteria, HashDictionary},
    session_id::SessionId,
    status::SessionStatus,
    utils::kv,
};

/// File extension of Client session records.
pub const EXTENSION: &str = "privas";

const SESSION_ID: &str = "SESSION_ID";
const PUBLIC_RSA_KEY: &str = "PUBLIC_RSA_KEY";
const PRIVATE_RSA_KEY: &str = "PRIVATE_RSA_KEY";
const THIRD_PARTY_RSA_KEY: &str = "THIRD_PARTY_RSA_KEY";
const THIRD_PARTY_NAME: &str = "THIRD_PARTY_NAME";
const AES_KEY: &str = "AES_KEY";
const RPP_ADDRESS: &str = "RPP_ADDRESS";
const HASK_KEY: &str = "HASK_KEY";
const GENOTYPE_FILENAME: &str = "GENOTYPE_FILENAME";
const DATASET: &str = "DATASET";
const GNOMAD_VERSION: &str = "GNOMAD_VERSION";
const MAX_AF: &str = "MAX_AF";
const MAX_AF_SUB: &str = "MAX_AF_SUB";
const LIMIT_CONSEQUENCE: &str = "LIMIT_CONSEQUENCE";
const LIMIT_SNV: &str = "LIMIT_SNV";
const BEDFILE: &str = "BEDFILE";
const QC_PARAMS: &str = "QC_PARAMS";
const EXCLUDED_VARIANTS: &str = "EXCLUDED_VARIANTS";
const LAST_KNOWN_STATUS: &str = "LAST_KNOWN_STATUS";
const HASH_DICTIONARY: &str = "HASH_DICTIONARY";
const GENE_POSITIONS: &str = "GENE_POSITIONS";
const ALGORITHM: &str = "ALGORITHM";

const KEYS: [&str; 22] = [
    SESSION_ID,
    PUBLIC_RSA_KEY,
    PRIVATE_RSA_KEY,
    THIRD_PARTY_RSA_KEY,
    THIRD_PARTY_NAME,
    AES_KEY,
    RPP_ADDRESS,
    HASK_KEY,
    GENOTYPE_FILENAME,
    DATASET,
    GNOMAD_VERSION,
    MAX_AF,
    MAX_AF_SUB,
    LIMIT_CONSEQUENCE,
    LIMIT_SNV,
    BEDFILE,
    QC_PARAMS,
    EXCLUDED_VARIANTS,
    LAST_KNOWN_STATUS,
    HASH_DICTIONARY,
    GENE_POSITIONS,
    ALGORITHM,
];

/// Errors raised while loading or saving a session record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The record is invalid, with one entry per problem found.
    #[error("invalid session file:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("unable to access session file")]
    Io(#[from] std::io::Error),
}

/// Everything the Client needs to follow up on a session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub session: SessionId,
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
    pub tps_public_key: PublicKey,
    pub tps_name: String,
    pub aes_key: AesKey,
    /// `host:port` of the RPP.
    pub rpp_address: String,
    /// The salt used to hash identifiers.
    pub hash_salt: String,
    pub genotype_file: PathBuf,
    pub dataset: String,
    pub gnomad_version: String,
    /// Filters of the session, with the regions covered by both parties.
    pub criteria: Criteria,
    pub qc_params: String,
    pub excluded_variants: BTreeSet<String>,
    pub last_known_status: Option<SessionStatus>,
    pub dictionary: HashDictionary,
    pub algorithm: String,
}

impl ClientSession {
    /// Loads a record from `path`.
    pub async fn load(path: &Path) -> Result<Self, RecordError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    /// Saves the record to `path`.
    pub async fn save(&self, path: &Path) -> Result<(), RecordError> {
        tokio::fs::write(path, self.to_text()?).await?;
        debug!(session = %self.session, path = %path.display(), "session file saved");
        Ok(())
    }

    /// The file name a record is saved under by default.
    pub fn file_name(&self) -> String {
        format!("{}.{EXTENSION}", self.session)
    }

    /// Renders the record.
    pub fn to_text(&self) -> Result<String, RecordError> {
        let mut out = String::new();
        kv::push(&mut out, SESSION_ID, &self.session);
        kv::push(&mut out, PUBLIC_RSA_KEY, self.public_key.encode()?);
        kv::push(&mut out, PRIVATE_RSA_KEY, self.private_key.encode()?);
        kv::push(&mut out, THIRD_PARTY_RSA_KEY, self.tps_public_key.encode()?);
        kv::push(&mut out, THIRD_PARTY_NAME, &self.tps_name);
        kv::push(&mut out, AES_KEY, self.aes_key.encode());
        kv::push(&mut out, RPP_ADDRESS, &self.rpp_address);
        kv::push(&mut out, HASK_KEY, &self.hash_salt);
        kv::push(&mut out, GENOTYPE_FILENAME, self.genotype_file.display());
        kv::push(&mut out, DATASET, &self.dataset);
        kv::push(&mut out, GNOMAD_VERSION, &self.gnomad_version);
        kv::push(&mut out, MAX_AF, self.criteria.max_af);
        kv::push(&mut out, MAX_AF_SUB, self.criteria.max_af_sub);
        kv::push(&mut out, LIMIT_CONSEQUENCE, self.criteria.min_consequence);
        kv::push(&mut out, LIMIT_SNV, self.criteria.snv_only);
        kv::push(&mut out, BEDFILE, &self.criteria.bed);
        kv::push(&mut out, QC_PARAMS, self.qc_params.replace(['\n', '\t'], " "));
        let excluded: Vec<&str> = self.excluded_variants.iter().map(String::as_str).collect();
        kv::push(&mut out, EXCLUDED_VARIANTS, excluded.join(","));
        let status = self
            .last_known_status
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        kv::push(&mut out, LAST_KNOWN_STATUS, status);
        let genes: Vec<String> = self.dictionary.gene_records().collect();
        kv::push(&mut out, HASH_DICTIONARY, genes.join(";"));
        let positions: Vec<String> = self.dictionary.position_records().collect();
        kv::push(&mut out, GENE_POSITIONS, positions.join(";"));
        kv::push(&mut out, ALGORITHM, self.algorithm.replace(['\n', '\t'], " "));
        Ok(out)
    }

    /// Parses a record, collecting every problem before failing.
    pub fn parse(text: &str) -> Result<Self, RecordError> {
        let mut errors = vec![];
        let mut values: BTreeMap<&str, &str> = BTreeMap::new();
        for entry in kv::entries(text) {
            match entry {
                Err(line) => errors.push(format!("line {line}: expected KEY<TAB>value")),
                Ok(entry) if !KEYS.contains(&entry.key) => {
                    errors.push(format!("line {}: unknown key {}", entry.line, entry.key))
                }
                Ok(entry) => {
                    if values.insert(entry.key, entry.value).is_some() {
                        errors.push(format!("line {}: duplicate key {}", entry.line, entry.key));
                    }
                }
            }
        }
        for key in KEYS {
            if !values.contains_key(key) {
                errors.push(format!("missing key {key}"));
            }
        }

        let mut field = |key: &str, parse: &dyn Fn(&str) -> Result<Field, String>| {
            let value = values.get(key)?;
            match parse(value) {
                Ok(field) => Some(field),
                Err(reason) => {
                    errors.push(format!("{key}: {reason}"));
                    None
                }
            }
        };
        let text = |v: &str| -> Result<Field, String> { Ok(Field::Text(v.to_string())) };
        let non_empty = |v: &str| {
            if v.trim().is_empty() {
                Err("must not be empty".to_string())
            } else {
                Ok(Field::Text(v.trim().to_string()))
            }
        };
        let public_key = |v: &str| {
            PublicKey::decode(v)
                .map(Field::PublicKey)
                .map_err(|e| e.to_string())
        };
        let frequency = |v: &str| match v.trim().parse::<f64>() {
            Ok(f) if (0.0..=1.0).contains(&f) => Ok(Field::Number(f)),
            _ => Err(format!("'{v}' is not a frequency")),
        };

        let session = field(SESSION_ID, &|v| {
            v.parse().map(Field::Session).map_err(|e: crate::session_id::InvalidSessionId| e.to_string())
        });
        let own_public_key = field(PUBLIC_RSA_KEY, &public_key);
        let private_key = field(PRIVATE_RSA_KEY, &|v| {
            PrivateKey::decode(v)
                .map(Field::PrivateKey)
                .map_err(|e| e.to_string())
        });
        let tps_public_key = field(THIRD_PARTY_RSA_KEY, &public_key);
        let tps_name = field(THIRD_PARTY_NAME, &non_empty);
        let aes_key = field(AES_KEY, &|v| {
            AesKey::decode(v).map(Field::AesKey).map_err(|e| e.to_string())
        });
        let rpp_address = field(RPP_ADDRESS, &|v| match v.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Field::Text(v.to_string()))
            }
            _ => Err(format!("'{v}' is not host:port")),
        });
        let hash_salt = field(HASK_KEY, &non_empty);
        let genotype_file = field(GENOTYPE_FILENAME, &non_empty);
        let dataset = field(DATASET, &non_empty);
        let gnomad_version = field(GNOMAD_VERSION, &text);
        let max_af = field(MAX_AF, &frequency);
        let max_af_sub = field(MAX_AF_SUB, &frequency);
        let min_consequence = field(LIMIT_CONSEQUENCE, &|v| v.parse().map(Field::Consequence));
        let snv_only = field(LIMIT_SNV, &|v| match v.trim() {
            "true" => Ok(Field::Flag(true)),
            "false" => Ok(Field::Flag(false)),
            other => Err(format!("'{other}' is not true or false")),
        });
        let bed = field(BEDFILE, &|v| {
            v.parse::<BedFile>()
                .map(Field::Bed)
                .map_err(|e| e.to_string())
        });
        let qc_params = field(QC_PARAMS, &text);
        let excluded = field(EXCLUDED_VARIANTS, &|v| {
            Ok(Field::Set(
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ))
        });
        let status = field(LAST_KNOWN_STATUS, &|v| {
            if v.trim().is_empty() {
                Ok(Field::Status(None))
            } else {
                v.parse()
                    .map(|s| Field::Status(Some(s)))
                    .map_err(|e: crate::status::InvalidStatus| e.to_string())
            }
        });
        let algorithm = field(ALGORITHM, &text);

        let mut dictionary = HashDictionary::default();
        let genes = values.get(HASH_DICTIONARY).copied().unwrap_or_default();
        let positions = values.get(GENE_POSITIONS).copied().unwrap_or_default();
        for record in genes.split(';').filter(|r| !r.is_empty()) {
            if let Err(reason) = dictionary.add_gene_record(record) {
                errors.push(format!("{HASH_DICTIONARY}: {reason}"));
            }
        }
        for record in positions.split(';').filter(|r| !r.is_empty()) {
            if let Err(reason) = dictionary.add_position_record(record) {
                errors.push(format!("{GENE_POSITIONS}: {reason}"));
            }
        }

        if !errors.is_empty() {
            return Err(RecordError::Invalid(errors));
        }
        let (
            Some(Field::Session(session)),
            Some(Field::PublicKey(public_key)),
            Some(Field::PrivateKey(private_key)),
            Some(Field::PublicKey(tps_public_key)),
            Some(Field::Text(tps_name)),
            Some(Field::AesKey(aes_key)),
            Some(Field::Text(rpp_address)),
            Some(Field::Text(hash_salt)),
            Some(Field::Text(genotype_file)),
            Some(Field::Text(dataset)),
            Some(Field::Text(gnomad_version)),
            Some(Field::Number(max_af)),
            Some(Field::Number(max_af_sub)),
            Some(Field::Consequence(min_consequence)),
            Some(Field::Flag(snv_only)),
            Some(Field::Bed(bed)),
            Some(Field::Text(qc_params)),
            Some(Field::Set(excluded_variants)),
            Some(Field::Status(last_known_status)),
            Some(Field::Text(algorithm)),
        ) = (
            session,
            own_public_key,
            private_key,
            tps_public_key,
            tps_name,
            aes_key,
            rpp_address,
            hash_salt,
            genotype_file,
            dataset,
            gnomad_version,
            max_af,
            max_af_sub,
            min_consequence,
            snv_only,
            bed,
            qc_params,
            excluded,
            status,
            algorithm,
        )
        else {
            // every field parsed without error has the variant of its parser
            return Err(RecordError::Invalid(vec!["inconsistent fields".to_string()]));
        };
        Ok(Self {
            session,
            public_key,
            private_key,
            tps_public_key,
            tps_name,
            aes_key,
            rpp_address,
            hash_salt,
            genotype_file: PathBuf::from(genotype_file),
            dataset,
            gnomad_version,
            criteria: Criteria {
                max_af,
                max_af_sub,
                min_consequence,
                snv_only,
                bed,
            },
            qc_params,
            excluded_variants,
            last_known_status,
            dictionary,
            algorithm,
        })
    }
}

/// A parsed record value.
enum Field {
    Text(String),
    Number(f64),
    Flag(bool),
    Session(SessionId),
    PublicKey(PublicKey),
    PrivateKey(PrivateKey),
    AesKey(AesKey),
    Consequence(crate::genotype::Consequence),
    Bed(BedFile),
    Set(BTreeSet<String>),
    Status(Option<SessionStatus>),
}
