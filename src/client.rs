//! The Client side of the protocol: one connection per request to the RPP, plus a long-lived
//! monitor connection.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    bed::Chromosome,
    channel::{FrameError, MsgChannel},
    crypto::{
        AesKey, CryptoError, PublicKey, decrypt_aes, decrypt_rsa, encrypt_aes, encrypt_rsa,
        generate_rsa_keypair,
    },
    extractor::{Criteria, ExtractError, Extractor, QualityControl},
    message::{ClientData, Message, MessageError, RppConfiguration, SessionRequest},
    record::ClientSession,
    session_id::SessionId,
    status::SessionStatus,
    tps::{TpsError, parse_results},
};

/// Delay before the monitor reconnects after losing its connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Errors of a request to the RPP.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The RPP could not be reached.
    #[error("unable to connect to {address}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The reply was a rejection, of the wrong kind or for another session.
    #[error(transparent)]
    Protocol(#[from] MessageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Results(#[from] TpsError),
    /// The decrypted hash salt is not valid text.
    #[error("the session salt is not valid UTF-8")]
    InvalidSalt,
    /// The offered regions share nothing with the requested ones.
    #[error("the RPP offered no region in common with the requested ones")]
    DisjointRegions,
    #[error("extraction task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// What the Client asks for when creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub dataset: String,
    pub gnomad_version: String,
    /// Filters with the regions covered by the Client.
    pub criteria: Criteria,
    pub qc_params: String,
    pub genotype_file: PathBuf,
    pub algorithm: String,
}

/// One line of the results, with the gene de-hashed when the Client knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneResult {
    /// The gene name, or its hash if it is not in the dictionary.
    pub gene: String,
    pub position: Option<(Chromosome, u64)>,
    pub p_value: f64,
    pub extra: Vec<String>,
}

/// Sends requests to one RPP.
#[derive(Debug, Clone)]
pub struct RppConnector {
    address: String,
}

impl RppConnector {
    /// A connector for the RPP listening at `address` (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<MsgChannel<TcpStream>, RequestError> {
        let stream =
            TcpStream::connect(&self.address)
                .await
                .map_err(|source| RequestError::Connect {
                    address: self.address.clone(),
                    source,
                })?;
        Ok(MsgChannel(stream))
    }

    async fn request(
        &self,
        msg: &Message,
        session: Option<&SessionId>,
    ) -> Result<Message, RequestError> {
        let mut channel = self.connect().await?;
        debug!(kind = msg.kind(), "sending request");
        channel.send(msg).await?;
        let reply: Message = channel.recv().await?;
        Ok(reply.into_reply(session)?)
    }

    /// Asks which datasets, GnomAD versions and TPS the RPP offers.
    pub async fn configuration(&self) -> Result<RppConfiguration, RequestError> {
        match self.request(&Message::AskRppConfiguration, None).await? {
            Message::SendRppConfiguration(config) => Ok(config),
            other => Err(other.unexpected("SendRPPConfiguration").into()),
        }
    }

    /// Creates a session: generates the Client keys, sends `AskSession` and decrypts the
    /// session salt.
    pub async fn prepare_session(&self, params: NewSession) -> Result<ClientSession, RequestError> {
        let (public_key, private_key) = generate_rsa_keypair()?;
        let config = self.configuration().await?;
        let request = Message::AskSession(SessionRequest {
            client_public_key: public_key.to_pem()?,
            dataset: params.dataset.clone(),
            gnomad_version: params.gnomad_version.clone(),
            criteria: params.criteria.clone(),
            qc_params: params.qc_params.clone(),
        });
        let offer = match self.request(&request, None).await? {
            Message::SendSession(offer) => offer,
            other => return Err(other.unexpected("SendSession").into()),
        };
        let salt = decrypt_rsa(&private_key, &offer.encrypted_salt)?;
        let hash_salt = String::from_utf8(salt).map_err(|_| RequestError::InvalidSalt)?;
        let tps_public_key = PublicKey::decode(&offer.tps_public_key)?;
        let bed = params
            .criteria
            .bed
            .restrict(&offer.bed)
            .ok_or(RequestError::DisjointRegions)?;
        info!(session = %offer.session, dataset = %params.dataset, "session prepared");
        Ok(ClientSession {
            session: offer.session,
            public_key,
            private_key,
            tps_public_key,
            tps_name: config.tps_name,
            aes_key: AesKey::generate(),
            rpp_address: self.address.clone(),
            hash_salt,
            genotype_file: params.genotype_file,
            dataset: params.dataset,
            gnomad_version: params.gnomad_version,
            criteria: Criteria {
                bed,
                ..params.criteria
            },
            qc_params: params.qc_params,
            excluded_variants: Default::default(),
            last_known_status: None,
            dictionary: Default::default(),
            algorithm: params.algorithm,
        })
    }

    /// Starts the RPP side of the session.
    pub async fn start_session(&self, record: &ClientSession) -> Result<(), RequestError> {
        let session = &record.session;
        let msg = Message::StartSession {
            session: session.clone(),
        };
        match self.request(&msg, Some(session)).await? {
            Message::SessionStarted { .. } => Ok(()),
            other => Err(other.unexpected("SessionStarted").into()),
        }
    }

    /// Extracts, encrypts and sends the Client data, filling the record's exclusions and
    /// dictionaries.
    pub async fn send_client_data<Q>(
        &self,
        record: &mut ClientSession,
        qc: Q,
        progress: impl FnMut(usize, usize),
    ) -> Result<(), RequestError>
    where
        Q: QualityControl + Send + 'static,
    {
        let criteria = record.criteria.clone();
        let salt = record.hash_salt.clone();
        let path = record.genotype_file.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            Extractor::new(&criteria, &salt)
                .with_quality_control(qc)
                .extract_file(&path)
        })
        .await??;
        info!(session = %record.session, stats = ?extraction.stats, "client data extracted");

        let data = ClientData {
            session: record.session.clone(),
            encrypted_aes_key: encrypt_rsa(&record.tps_public_key, record.aes_key.as_bytes())?,
            genotypes: encrypt_aes(&record.aes_key, &extraction.genotype_blob())?,
            exclusions: encrypt_aes(&record.aes_key, &extraction.exclusion_blob())?,
            algorithm: record.algorithm.clone(),
        };
        let mut channel = self.connect().await?;
        channel
            .send_with_progress(&Message::SendClientData(data), progress)
            .await?;
        let reply: Message = channel.recv().await?;
        match reply.into_reply(Some(&record.session))? {
            Message::AckClientData { .. } => {}
            other => return Err(other.unexpected("AckClientData").into()),
        }
        record.excluded_variants = extraction.excluded;
        record.dictionary = extraction.dictionary;
        Ok(())
    }

    /// Downloads and decrypts the results, de-hashing genes with the record's dictionary.
    pub async fn results(&self, record: &ClientSession) -> Result<Vec<GeneResult>, RequestError> {
        let session = &record.session;
        let msg = Message::AskResults {
            session: session.clone(),
        };
        let blob = match self.request(&msg, Some(session)).await? {
            Message::SendResults { results, .. } => results,
            other => return Err(other.unexpected("SendResults").into()),
        };
        let scores = parse_results(&decrypt_aes(&record.aes_key, &blob)?)?;
        Ok(scores
            .into_iter()
            .map(|score| {
                let gene = record
                    .dictionary
                    .gene(&score.gene)
                    .map(str::to_string)
                    .unwrap_or(score.gene);
                GeneResult {
                    position: record.dictionary.position(&gene),
                    gene,
                    p_value: score.p_value,
                    extra: score.extra,
                }
            })
            .collect())
    }

    /// Follows the status of `session`, reconnecting after [`RECONNECT_DELAY`].
    pub fn monitor(&self, session: SessionId) -> Monitor {
        self.monitor_with_delay(session, RECONNECT_DELAY)
    }

    /// Like [`RppConnector::monitor`], with a custom reconnection delay.
    pub fn monitor_with_delay(&self, session: SessionId, delay: Duration) -> Monitor {
        let (tx, rx) = mpsc::channel(32);
        let reachable = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(monitor_loop(
            self.clone(),
            session,
            delay,
            tx,
            Arc::clone(&reachable),
        ));
        Monitor {
            updates: rx,
            reachable,
            task,
        }
    }
}

/// An update received by a [`Monitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The session status reported by the RPP.
    Rpp(SessionStatus),
    /// A detail line reported by the TPS.
    Tps(String),
    /// The RPP refused to monitor the session, the monitor stops.
    Rejected(String),
}

/// A running monitor, stopped when dropped.
#[derive(Debug)]
pub struct Monitor {
    updates: mpsc::Receiver<MonitorEvent>,
    reachable: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Monitor {
    /// The next update, `None` once the monitor stopped.
    pub async fn next(&mut self) -> Option<MonitorEvent> {
        self.updates.recv().await
    }

    /// Whether the monitor connection is currently established.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn monitor_loop(
    connector: RppConnector,
    session: SessionId,
    delay: Duration,
    tx: mpsc::Sender<MonitorEvent>,
    reachable: Arc<AtomicBool>,
) {
    loop {
        match follow(&connector, &session, &tx, &reachable).await {
            Ok(()) => return,
            Err(err) => {
                if reachable.swap(false, Ordering::Relaxed) {
                    warn!(%session, "monitor connection lost: {err}");
                } else {
                    debug!(%session, "RPP unreachable: {err}");
                }
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

/// Follows one monitor connection. `Ok` means the monitor is done for good.
async fn follow(
    connector: &RppConnector,
    session: &SessionId,
    tx: &mpsc::Sender<MonitorEvent>,
    reachable: &AtomicBool,
) -> Result<(), RequestError> {
    let mut channel = connector.connect().await?;
    channel
        .send(&Message::AskMonitor {
            session: session.clone(),
        })
        .await?;
    reachable.store(true, Ordering::Relaxed);
    loop {
        let msg: Message = channel.recv().await?;
        let event = match msg.into_reply(Some(session)) {
            Ok(Message::SendRppStatus { status, .. }) => MonitorEvent::Rpp(status),
            Ok(Message::SendTpsStatus { detail, .. }) => MonitorEvent::Tps(detail),
            Ok(other) => return Err(other.unexpected("SendRPPStatus").into()),
            Err(MessageError::Rejected(reason)) => {
                let _ = tx.send(MonitorEvent::Rejected(reason)).await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let is_final = matches!(&event, MonitorEvent::Rpp(s) if s.state.is_final());
        if tx.send(event).await.is_err() || is_final {
            return Ok(());
        }
    }
}
