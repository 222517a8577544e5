//! The sessions of an RPP, their directories and the ledger of expired sessions.

use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
    path::PathBuf,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use privas::{
    artifacts::{RPP_STATUS, SessionFiles},
    crypto::{CryptoError, PublicKey, encrypt_rsa, generate_salt},
    extractor::Criteria,
    message::{RppConfiguration, SessionOffer, SessionRequest},
    session_id::SessionId,
    status::{SessionStatus, State},
};
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, OnceCell, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    access::{AccessError, AccessPolicy},
    config::RppConfig,
    handle::SessionHandle,
    params::{ParamsError, SessionParams},
    scheduler::Scheduler,
    state::{SessionActor, SessionContext, Timing},
    tps::TpsLink,
};

/// Number of background jobs running at the same time.
pub const WORKERS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),
    #[error("unknown GnomAD version '{0}'")]
    UnknownGnomadVersion(String),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session {0} has expired")]
    Expired(SessionId),
    #[error("the requested regions do not overlap the regions of dataset '{0}'")]
    DisjointRegions(String),
    #[error("invalid client key")]
    ClientKey(#[source] CryptoError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("unable to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("the TPS is unreachable: {0}")]
    Tps(String),
}

pub struct Registry<T> {
    config: RppConfig,
    ctx: SessionContext<T>,
    access: AccessPolicy,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    expired: Mutex<BTreeSet<SessionId>>,
    tps_key: OnceCell<String>,
}

impl<T: TpsLink> Registry<T> {
    /// Opens the session directory, restoring and resuming every session that has not
    /// expired.
    pub async fn open(config: RppConfig, tps: T, timing: Timing) -> Result<Arc<Self>, RegistryError> {
        let io = |path: &std::path::Path| {
            let path = path.to_path_buf();
            move |source| RegistryError::Io { path, source }
        };
        tokio::fs::create_dir_all(&config.session_dir)
            .await
            .map_err(io(&config.session_dir))?;
        let expired = match tokio::fs::read_to_string(&config.expired_session_file).await {
            Ok(text) => text.lines().filter_map(|l| l.trim().parse().ok()).collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: config.expired_session_file.clone(),
                    source,
                });
            }
        };
        let access = AccessPolicy::new(
            config.whitelist.clone(),
            config.blacklist.clone(),
            config.limits,
            config.connection_log.clone(),
        );
        let registry = Arc::new(Self {
            ctx: SessionContext {
                tps: Arc::new(tps),
                scheduler: Scheduler::new(WORKERS),
                timing,
            },
            access,
            sessions: Default::default(),
            expired: Mutex::new(expired),
            tps_key: OnceCell::new(),
            config,
        });
        registry.restore().await?;
        Ok(registry)
    }

    pub fn config(&self) -> &RppConfig {
        &self.config
    }

    /// What `AskRPPConfiguration` is answered with.
    pub fn configuration(&self) -> RppConfiguration {
        self.config.announcement()
    }

    fn files(&self, session: &SessionId) -> SessionFiles {
        SessionFiles::new(self.config.session_dir.join(session.as_str()))
    }

    async fn restore(&self) -> Result<(), RegistryError> {
        let dir = &self.config.session_dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|source| RegistryError::Io {
                path: dir.clone(),
                source,
            })?;
        let now = Utc::now();
        let mut restored = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(session) = entry.file_name().to_string_lossy().parse::<SessionId>() else {
                continue;
            };
            if session.is_expired(now) {
                self.remove_expired(&session).await;
                continue;
            }
            let files = self.files(&session);
            let params = match SessionParams::load(files.dir()).await {
                Ok(params) => params,
                Err(err) => {
                    warn!(%session, %err, "unable to restore session");
                    continue;
                }
            };
            let Some(dataset) = self.config.dataset(&params.dataset) else {
                warn!(%session, dataset = %params.dataset, "dataset of session is no longer offered");
                continue;
            };
            let status = files
                .read_status(RPP_STATUS)
                .await
                .unwrap_or_else(|| SessionStatus::new(State::Unknown));
            let genotypes = dataset.genotypes.clone();
            let handle = self.spawn(params, genotypes, files, status);
            if handle.resume().await.is_err() {
                error!(%session, "session stopped while resuming");
                continue;
            }
            self.sessions.write().await.insert(session, handle);
            restored += 1;
        }
        info!(restored, "sessions restored");
        Ok(())
    }

    fn spawn(
        &self,
        params: SessionParams,
        genotypes: PathBuf,
        files: SessionFiles,
        status: SessionStatus,
    ) -> SessionHandle {
        let (actor, handle) =
            SessionActor::new(params, genotypes, files, status, self.ctx.clone());
        tokio::spawn(actor.start());
        handle
    }

    /// The TPS key, fetched once.
    async fn tps_public_key(&self) -> Result<&str, RegistryError> {
        self.tps_key
            .get_or_try_init(|| async {
                self.ctx
                    .tps
                    .public_key()
                    .await
                    .map_err(|err| RegistryError::Tps(err.to_string()))
            })
            .await
            .map(String::as_str)
    }

    /// Handles `AskSession` from `peer`.
    pub async fn create(
        &self,
        request: SessionRequest,
        peer: IpAddr,
    ) -> Result<SessionOffer, RegistryError> {
        let now = Utc::now();
        let admission = self.access.admit(peer, now).await?;
        let dataset = self
            .config
            .dataset(&request.dataset)
            .ok_or_else(|| RegistryError::UnknownDataset(request.dataset.clone()))?;
        if !self.config.has_gnomad_version(&request.gnomad_version) {
            return Err(RegistryError::UnknownGnomadVersion(request.gnomad_version));
        }
        let bed = request
            .criteria
            .bed
            .restrict(&dataset.bed)
            .ok_or_else(|| RegistryError::DisjointRegions(dataset.name.clone()))?;
        let client_public_key =
            PublicKey::decode(&request.client_public_key).map_err(RegistryError::ClientKey)?;
        let tps_public_key = self.tps_public_key().await?.to_string();

        let session = self.unique_id(now).await;
        let files = self.files(&session);
        tokio::fs::create_dir_all(files.dir())
            .await
            .map_err(|source| RegistryError::Io {
                path: files.dir().to_path_buf(),
                source,
            })?;
        let hash_salt = generate_salt();
        let encrypted_salt = encrypt_rsa(&client_public_key, hash_salt.as_bytes())?;
        let params = SessionParams {
            session: session.clone(),
            dataset: request.dataset,
            gnomad_version: request.gnomad_version,
            criteria: Criteria {
                bed: bed.clone(),
                ..request.criteria
            },
            qc_params: request.qc_params,
            hash_salt,
            client_public_key,
        };
        params.save(files.dir()).await?;
        let status = SessionStatus::new(State::NewSession);
        files
            .write_status(RPP_STATUS, &status)
            .await
            .map_err(|source| RegistryError::Io {
                path: files.path(RPP_STATUS),
                source,
            })?;
        let handle = self.spawn(params, dataset.genotypes.clone(), files, status);
        self.sessions.write().await.insert(session.clone(), handle);
        if let Err(err) = admission.record(&session).await {
            error!(%err, "unable to log the connection");
        }
        debug!(%session, dataset = %dataset.name, "session offered");
        Ok(SessionOffer {
            session,
            encrypted_salt,
            tps_public_key,
            bed,
        })
    }

    async fn unique_id(&self, now: DateTime<Utc>) -> SessionId {
        loop {
            let session = SessionId::generate_at(now);
            let taken = self.sessions.read().await.contains_key(&session)
                || self.expired.lock().await.contains(&session)
                || tokio::fs::try_exists(self.files(&session).dir())
                    .await
                    .unwrap_or(true);
            if !taken {
                return session;
            }
        }
    }

    /// The handle of a live session.
    pub async fn get(&self, session: &SessionId) -> Result<SessionHandle, RegistryError> {
        if let Some(handle) = self.sessions.read().await.get(session) {
            return Ok(handle.clone());
        }
        if self.expired.lock().await.contains(session) || session.is_expired(Utc::now()) {
            return Err(RegistryError::Expired(session.clone()));
        }
        Err(RegistryError::UnknownSession(session.clone()))
    }

    /// Expires every session older than the retention window, returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .keys()
            .filter(|s| s.is_expired(now))
            .cloned()
            .collect();
        for session in &expired {
            let handle = self.sessions.write().await.remove(session);
            if let Some(handle) = handle
                && handle.expire().await.is_err()
            {
                debug!(%session, "session was already stopped");
            }
            self.remove_expired(session).await;
        }
        expired.len()
    }

    /// Runs [`Registry::sweep`] periodically.
    pub fn spawn_expiry_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.ctx.timing.expiry_sweep);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = registry.sweep().await;
                if removed > 0 {
                    info!(removed, "expired sessions removed");
                }
            }
        })
    }

    /// Deletes the directory of an expired session and adds it to the ledger.
    async fn remove_expired(&self, session: &SessionId) {
        self.ctx.scheduler.cancel_session(session).await;
        let dir = self.files(session).dir().to_path_buf();
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(%session, ?err, "unable to delete the session directory");
        }
        let mut expired = self.expired.lock().await;
        if !expired.insert(session.clone()) {
            return;
        }
        let res = async {
            let mut ledger = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.expired_session_file)
                .await?;
            ledger.write_all(format!("{session}\n").as_bytes()).await?;
            ledger.flush().await
        }
        .await;
        if let Err(err) = res {
            error!(%session, ?err, "unable to update the expired session ledger");
        }
        info!(%session, "session expired");
    }
}
