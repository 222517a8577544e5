//! The RPP configuration file.
//!
//! One `TAG<TAB>value` pair per line, `#` comments and blank lines are ignored. Every tag is
//! mandatory:
//!
//! ```text
//! PORT                  4200
//! DATASETS              name:genotypePath:size:bedPath,...
//! GNOMAD_VERSIONS       version:path,...
//! SESSION_DIR           /var/lib/privas/sessions
//! EXPIRED_SESSION_FILE  /var/lib/privas/expired.txt
//! TPS_NAME              Trusted Compute
//! TPS_ADDRESS           tps.example.org
//! TPS_USER              privas
//! TPS_LAUNCH_COMMAND    ssh {user}@{address} privas-tps run {session}
//! TPS_GET_KEY_COMMAND   ssh {user}@{address} cat /etc/privas/tps.pub
//! TPS_SESSION_DIR       /mnt/tps/sessions
//! WHITELIST             192.168.*.*,10.0.0.1-20
//! BLACKLIST
//! CONNECTION_LOG        /var/log/privas/connections.log
//! MAX_PER_DAY           5
//! MAX_PER_WEEK          20
//! MAX_PER_MONTH         0
//! ```

use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use privas::{
    bed::{BedError, BedFile},
    message::{DatasetDescription, RppConfiguration},
    utils::kv,
};
use tracing::info;

use crate::access::{AddressPattern, RateLimits, parse_patterns};

/// Errors of the configuration, all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {0}: expected TAG<TAB>value")]
    Syntax(usize),
    #[error("line {line}: unknown tag {tag}")]
    UnknownTag { line: usize, tag: String },
    #[error("line {line}: tag {tag} is set twice")]
    DuplicateTag { line: usize, tag: &'static str },
    #[error("missing tag {tag}, expected {syntax}")]
    MissingTag {
        tag: &'static str,
        syntax: &'static str,
    },
    #[error("invalid value for {tag} ({reason}), expected {syntax}")]
    InvalidValue {
        tag: &'static str,
        syntax: &'static str,
        reason: String,
    },
    #[error("invalid bed file of dataset {dataset}")]
    Bed {
        dataset: String,
        #[source]
        source: BedError,
    },
}

const PORT: &str = "PORT";
const DATASETS: &str = "DATASETS";
const GNOMAD_VERSIONS: &str = "GNOMAD_VERSIONS";
const SESSION_DIR: &str = "SESSION_DIR";
const EXPIRED_SESSION_FILE: &str = "EXPIRED_SESSION_FILE";
const TPS_NAME: &str = "TPS_NAME";
const TPS_ADDRESS: &str = "TPS_ADDRESS";
const TPS_USER: &str = "TPS_USER";
const TPS_LAUNCH_COMMAND: &str = "TPS_LAUNCH_COMMAND";
const TPS_GET_KEY_COMMAND: &str = "TPS_GET_KEY_COMMAND";
const TPS_SESSION_DIR: &str = "TPS_SESSION_DIR";
const WHITELIST: &str = "WHITELIST";
const BLACKLIST: &str = "BLACKLIST";
const CONNECTION_LOG: &str = "CONNECTION_LOG";
const MAX_PER_DAY: &str = "MAX_PER_DAY";
const MAX_PER_WEEK: &str = "MAX_PER_WEEK";
const MAX_PER_MONTH: &str = "MAX_PER_MONTH";

/// Every tag with its expected syntax.
const TAGS: [(&str, &str); 17] = [
    (PORT, "a port number"),
    (DATASETS, "name:genotypePath:size:bedPath[,...]"),
    (GNOMAD_VERSIONS, "version:path[,...]"),
    (SESSION_DIR, "a directory"),
    (EXPIRED_SESSION_FILE, "a file path"),
    (TPS_NAME, "a name"),
    (TPS_ADDRESS, "a host name or address"),
    (TPS_USER, "a user name"),
    (TPS_LAUNCH_COMMAND, "a shell command"),
    (TPS_GET_KEY_COMMAND, "a shell command"),
    (TPS_SESSION_DIR, "a directory"),
    (WHITELIST, "IP patterns like 192.168.*.1-20, comma-separated, possibly empty"),
    (BLACKLIST, "IP patterns like 192.168.*.1-20, comma-separated, possibly empty"),
    (CONNECTION_LOG, "a file path"),
    (MAX_PER_DAY, "a number, 0 for no limit"),
    (MAX_PER_WEEK, "a number, 0 for no limit"),
    (MAX_PER_MONTH, "a number, 0 for no limit"),
];

/// A dataset offered by the RPP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    /// The annotated genotype file.
    pub genotypes: PathBuf,
    /// Number of samples.
    pub size: usize,
    pub bed_path: PathBuf,
    /// Regions covered by the dataset, loaded from `bed_path`.
    pub bed: BedFile,
}

/// How to reach the TPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpsConfig {
    pub name: String,
    pub address: String,
    pub user: String,
    /// Shell command launching the job of a session.
    pub launch_command: String,
    /// Shell command printing the TPS public key (PEM) on stdout.
    pub get_key_command: String,
    /// Directory holding the TPS side session directories, reachable from the RPP.
    pub session_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RppConfig {
    pub port: u16,
    pub datasets: Vec<Dataset>,
    /// GnomAD versions with the path of their annotations.
    pub gnomad_versions: Vec<(String, PathBuf)>,
    pub session_dir: PathBuf,
    pub expired_session_file: PathBuf,
    pub tps: TpsConfig,
    pub whitelist: Vec<AddressPattern>,
    pub blacklist: Vec<AddressPattern>,
    pub connection_log: PathBuf,
    pub limits: RateLimits,
}

impl RppConfig {
    /// Reads the configuration at `path` and loads the bed file of every dataset.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text)?;
        for dataset in &mut config.datasets {
            dataset.load_bed()?;
        }
        info!(
            path = %path.display(),
            datasets = config.datasets.len(),
            port = config.port,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parses the configuration, without loading the dataset bed files.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut values: BTreeMap<&'static str, &str> = BTreeMap::new();
        for entry in kv::entries(text) {
            let entry = entry.map_err(ConfigError::Syntax)?;
            let Some(&(tag, _)) = TAGS.iter().find(|(tag, _)| *tag == entry.key) else {
                return Err(ConfigError::UnknownTag {
                    line: entry.line,
                    tag: entry.key.to_string(),
                });
            };
            if values.insert(tag, entry.value.trim()).is_some() {
                return Err(ConfigError::DuplicateTag {
                    line: entry.line,
                    tag,
                });
            }
        }
        let get = |tag: &'static str| -> Result<&str, ConfigError> {
            values.get(tag).copied().ok_or(ConfigError::MissingTag {
                tag,
                syntax: syntax(tag),
            })
        };
        let path = |tag: &'static str| -> Result<PathBuf, ConfigError> {
            let value = get(tag)?;
            if value.is_empty() {
                return Err(invalid(tag, "empty path"));
            }
            Ok(PathBuf::from(value))
        };
        let number = |tag: &'static str| -> Result<u32, ConfigError> {
            get(tag)?
                .parse()
                .map_err(|_| invalid(tag, "not a number"))
        };
        let patterns = |tag: &'static str| -> Result<Vec<AddressPattern>, ConfigError> {
            parse_patterns(get(tag)?).map_err(|reason| invalid(tag, reason))
        };

        let port = get(PORT)?
            .parse()
            .map_err(|_| invalid(PORT, "not a port number"))?;
        let datasets = get(DATASETS)?
            .split(',')
            .filter(|d| !d.trim().is_empty())
            .map(parse_dataset)
            .collect::<Result<Vec<_>, _>>()?;
        if datasets.is_empty() {
            return Err(invalid(DATASETS, "no dataset"));
        }
        let gnomad_versions = get(GNOMAD_VERSIONS)?
            .split(',')
            .filter(|v| !v.trim().is_empty())
            .map(|v| match v.trim().split_once(':') {
                Some((version, path)) if !version.is_empty() && !path.is_empty() => {
                    Ok((version.to_string(), PathBuf::from(path)))
                }
                _ => Err(invalid(GNOMAD_VERSIONS, format!("invalid entry '{v}'"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let text_value = |tag: &'static str| -> Result<String, ConfigError> {
            match get(tag)? {
                "" => Err(invalid(tag, "empty value")),
                value => Ok(value.to_string()),
            }
        };
        Ok(Self {
            port,
            datasets,
            gnomad_versions,
            session_dir: path(SESSION_DIR)?,
            expired_session_file: path(EXPIRED_SESSION_FILE)?,
            tps: TpsConfig {
                name: text_value(TPS_NAME)?,
                address: text_value(TPS_ADDRESS)?,
                user: text_value(TPS_USER)?,
                launch_command: text_value(TPS_LAUNCH_COMMAND)?,
                get_key_command: text_value(TPS_GET_KEY_COMMAND)?,
                session_dir: path(TPS_SESSION_DIR)?,
            },
            whitelist: patterns(WHITELIST)?,
            blacklist: patterns(BLACKLIST)?,
            connection_log: path(CONNECTION_LOG)?,
            limits: RateLimits {
                per_day: number(MAX_PER_DAY)?,
                per_week: number(MAX_PER_WEEK)?,
                per_month: number(MAX_PER_MONTH)?,
            },
        })
    }

    /// Looks up a dataset by name.
    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Whether `version` is one of the configured GnomAD versions.
    pub fn has_gnomad_version(&self, version: &str) -> bool {
        self.gnomad_versions.iter().any(|(v, _)| v == version)
    }

    /// What is announced to Clients.
    pub fn announcement(&self) -> RppConfiguration {
        RppConfiguration {
            datasets: self
                .datasets
                .iter()
                .map(|d| DatasetDescription {
                    name: d.name.clone(),
                    size: d.size,
                })
                .collect(),
            gnomad_versions: self.gnomad_versions.iter().map(|(v, _)| v.clone()).collect(),
            tps_name: self.tps.name.clone(),
        }
    }
}

impl Dataset {
    /// Loads the regions covered by the dataset.
    pub fn load_bed(&mut self) -> Result<(), ConfigError> {
        let file = File::open(&self.bed_path).map_err(|source| ConfigError::Io {
            path: self.bed_path.clone(),
            source,
        })?;
        self.bed = BedFile::read(BufReader::new(file)).map_err(|source| ConfigError::Bed {
            dataset: self.name.clone(),
            source,
        })?;
        Ok(())
    }
}

fn syntax(tag: &str) -> &'static str {
    TAGS.iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, syntax)| *syntax)
        .unwrap_or_default()
}

fn invalid(tag: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        tag,
        syntax: syntax(tag),
        reason: reason.into(),
    }
}

fn parse_dataset(descriptor: &str) -> Result<Dataset, ConfigError> {
    let fields: Vec<&str> = descriptor.trim().split(':').collect();
    let [name, genotypes, size, bed_path] = fields[..] else {
        return Err(invalid(
            DATASETS,
            format!("'{descriptor}' does not have four fields"),
        ));
    };
    let size = size
        .parse()
        .map_err(|_| invalid(DATASETS, format!("invalid size '{size}'")))?;
    if name.is_empty() || genotypes.is_empty() || bed_path.is_empty() {
        return Err(invalid(DATASETS, format!("empty field in '{descriptor}'")));
    }
    Ok(Dataset {
        name: name.to_string(),
        genotypes: PathBuf::from(genotypes),
        size,
        bed_path: PathBuf::from(bed_path),
        bed: BedFile::new(),
    })
}
