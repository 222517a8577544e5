use std::{fmt::Debug, ops::ControlFlow, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use privas::{
    artifacts::{
        AES_KEY, ALGORITHM, CLIENT_DATA_COMPLETE, CLIENT_EXCLUDED, CLIENT_GENOTYPES, RESULTS,
        RESULTS_COMPLETE, RPP_EXCLUDED, RPP_GENOTYPES, RPP_GENOTYPES_COMPLETE, RPP_STATUS,
        SessionFiles,
    },
    extractor::{ExtractError, ExtractionStats, Extractor},
    message::{ClientData, Message},
    session_id::SessionId,
    status::{SessionStatus, State},
    tps::{JobState, JobStatus},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{handle::SessionHandle, params::SessionParams, scheduler::Scheduler, tps::TpsLink};

#[cfg(test)]
mod tests;

/// Written next to the session artifacts once the TPS job was launched.
pub(crate) const TPS_LAUNCHED: &str = "tps.launched";

/// Delays of the background jobs of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Between two checks of the readiness markers.
    pub readiness_poll: Duration,
    /// Between two dispatch attempts or polls of the TPS status.
    pub tps_poll: Duration,
    /// Between two attempts to download the results.
    pub results_retry: Duration,
    /// Between two sweeps of the expired sessions.
    pub expiry_sweep: Duration,
    /// How long monitors may go without a status before the current one is sent again.
    pub monitor_refresh: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            readiness_poll: Duration::from_secs(5),
            tps_poll: Duration::from_secs(30),
            results_retry: Duration::from_secs(30),
            expiry_sweep: Duration::from_secs(3600),
            monitor_refresh: Duration::from_secs(10),
        }
    }
}

/// What every session of an RPP shares.
pub struct SessionContext<T> {
    pub tps: Arc<T>,
    pub scheduler: Scheduler,
    pub timing: Timing,
}

impl<T> Clone for SessionContext<T> {
    fn clone(&self) -> Self {
        Self {
            tps: Arc::clone(&self.tps),
            scheduler: self.scheduler.clone(),
            timing: self.timing,
        }
    }
}

pub type Ret<R> = oneshot::Sender<R>;

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum SessionCmd {
    Start(Ret<Result<(), SessionError>>),
    ClientData(ClientData, Ret<Result<(), SessionError>>),
    Status(Ret<SessionStatus>),
    /// Registers a monitor; the current status is pushed to it right away.
    Monitor(mpsc::Sender<Message>, Ret<SessionStatus>),
    Results(Ret<Result<Vec<u8>, SessionError>>),
    /// Restarts the background jobs relevant to the restored status.
    Resume,
    /// Reports `EXPIRED`, cancels the background jobs and stops the state machine.
    Expire(Ret<()>),
    #[doc(hidden)]
    InternalExtracted(Result<ExtractionStats, String>),
    #[doc(hidden)]
    InternalReadiness { client: bool, rpp: bool },
    #[doc(hidden)]
    InternalDispatched(Result<(), String>),
    #[doc(hidden)]
    InternalPolled(Result<JobStatus, String>),
    #[doc(hidden)]
    InternalResultsStored,
    /// Answers whether the refresh job should keep running.
    #[doc(hidden)]
    InternalRefresh(Ret<bool>),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {session} is {state}, unable to {action}")]
    InvalidState {
        session: SessionId,
        action: &'static str,
        state: State,
    },
    #[error("the client data of session {0} was already received")]
    DuplicateClientData(SessionId),
    #[error("unable to store {name}")]
    Artifact {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// The state machine of one session.
///
/// Status transitions happen here only. Background jobs (extraction, readiness poll, TPS
/// dispatch and poll, result retrieval) run on the [`Scheduler`] and report back with
/// internal commands.
pub struct SessionActor<T> {
    params: SessionParams,
    genotypes: PathBuf,
    files: SessionFiles,
    status: SessionStatus,
    ctx: SessionContext<T>,
    monitors: Vec<mpsc::Sender<Message>>,
    client_ready: bool,
    rpp_ready: bool,
    dispatched: bool,
    last_tps_detail: Option<String>,
    last_push: Instant,
    refreshing: bool,
    cmd_rx: mpsc::Receiver<SessionCmd>,
    cmd_tx: mpsc::Sender<SessionCmd>,
}

impl<T: TpsLink> SessionActor<T> {
    /// Creates the state machine of a session, starting at `status`.
    ///
    /// `genotypes` is the genotype file of the session's dataset. The state machine runs once
    /// [`SessionActor::start`] is awaited and is controlled through the returned handle.
    pub fn new(
        params: SessionParams,
        genotypes: PathBuf,
        files: SessionFiles,
        status: SessionStatus,
        ctx: SessionContext<T>,
    ) -> (Self, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        (
            Self {
                params,
                genotypes,
                files,
                status,
                ctx,
                monitors: vec![],
                client_ready: false,
                rpp_ready: false,
                dispatched: false,
                last_tps_detail: None,
                last_push: Instant::now(),
                refreshing: false,
                cmd_rx,
                cmd_tx: cmd_tx.clone(),
            },
            SessionHandle(cmd_tx),
        )
    }

    #[tracing::instrument(name = "session", skip_all, fields(session = %self.params.session))]
    pub async fn start(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            debug!("handling {cmd:?}");
            self = match self.handle_cmd(cmd).await {
                ControlFlow::Continue(this) => this,
                ControlFlow::Break(_) => return,
            }
        }
    }

    async fn handle_cmd(mut self, cmd: SessionCmd) -> ControlFlow<(), Self> {
        if !matches!(cmd, SessionCmd::Expire(_)) {
            self.lapse().await;
        }
        let internal = matches!(
            cmd,
            SessionCmd::InternalExtracted(_)
                | SessionCmd::InternalReadiness { .. }
                | SessionCmd::InternalDispatched(_)
                | SessionCmd::InternalPolled(_)
                | SessionCmd::InternalResultsStored
                | SessionCmd::InternalRefresh(_)
        );
        if internal && self.status.state == State::Expired {
            debug!("ignoring {cmd:?} of an expired session");
            return ControlFlow::Continue(self);
        }
        match cmd {
            SessionCmd::Start(ret) => {
                let res = self.start_session().await;
                let _ = ret.send(res);
            }
            SessionCmd::ClientData(data, ret) => {
                let res = self.client_data(data).await;
                let _ = ret.send(res);
            }
            SessionCmd::Status(ret) => {
                let _ = ret.send(self.current_status());
            }
            SessionCmd::Monitor(monitor, ret) => {
                let status = self.current_status();
                let msg = Message::SendRppStatus {
                    session: self.params.session.clone(),
                    status: status.clone(),
                };
                if monitor.send(msg).await.is_ok() {
                    self.monitors.push(monitor);
                    if !self.refreshing && !status.state.is_final() {
                        self.refreshing = true;
                        self.schedule_refresh().await;
                    }
                }
                let _ = ret.send(status);
            }
            SessionCmd::Results(ret) => {
                let res = self.results().await;
                let _ = ret.send(res);
            }
            SessionCmd::Resume => self.resume().await,
            SessionCmd::Expire(ret) => {
                self.set_status(SessionStatus::new(State::Expired)).await;
                self.ctx
                    .scheduler
                    .cancel_session(&self.params.session)
                    .await;
                info!("session expired");
                let _ = ret.send(());
                return ControlFlow::Break(());
            }
            SessionCmd::InternalExtracted(res) => self.extracted(res).await,
            SessionCmd::InternalReadiness { client, rpp } => {
                self.client_ready |= client;
                self.rpp_ready |= rpp;
                self.check_readiness().await;
            }
            SessionCmd::InternalDispatched(res) => self.tps_dispatched(res).await,
            SessionCmd::InternalPolled(res) => self.polled(res).await,
            SessionCmd::InternalResultsStored => {
                self.set_status(SessionStatus::new(State::ResultsAvailable))
                    .await;
            }
            SessionCmd::InternalRefresh(ret) => {
                let keep = self.refresh().await;
                self.refreshing = keep;
                let _ = ret.send(keep);
            }
        }
        ControlFlow::Continue(self)
    }

    /// Moves a session past its retention window to `EXPIRED` and stops its background jobs.
    async fn lapse(&mut self) {
        if self.status.state == State::Expired || !self.params.session.is_expired(Utc::now()) {
            return;
        }
        info!(status = %self.status.state, "retention window elapsed");
        self.set_status(SessionStatus::new(State::Expired)).await;
        self.ctx
            .scheduler
            .cancel_session(&self.params.session)
            .await;
    }

    fn current_status(&self) -> SessionStatus {
        if self.params.session.is_expired(Utc::now()) {
            SessionStatus::new(State::Expired)
        } else {
            self.status.clone()
        }
    }

    fn invalid_state(&self, action: &'static str) -> SessionError {
        SessionError::InvalidState {
            session: self.params.session.clone(),
            action,
            state: self.status.state,
        }
    }

    /// Persists `status` and pushes it to the monitors, unless it repeats the current one.
    async fn set_status(&mut self, status: SessionStatus) {
        if status.same_as(&self.status) {
            return;
        }
        info!(status = %status.state, detail = ?status.detail, "status changed");
        if let Err(err) = self.files.write_status(RPP_STATUS, &status).await {
            error!(?err, "unable to persist the session status");
        }
        self.status = status;
        self.push_status().await;
    }

    async fn push_status(&mut self) {
        let msg = Message::SendRppStatus {
            session: self.params.session.clone(),
            status: self.status.clone(),
        };
        self.push(msg).await;
        self.last_push = Instant::now();
    }

    /// Repeats the current status to monitors that did not hear from the session for a while.
    /// Returns whether there is anything left to refresh.
    async fn refresh(&mut self) -> bool {
        if self.monitors.is_empty() || self.status.state.is_final() {
            return false;
        }
        if self.last_push.elapsed() >= self.ctx.timing.monitor_refresh {
            self.push_status().await;
        }
        !self.monitors.is_empty()
    }

    async fn push(&mut self, msg: Message) {
        let mut open = Vec::with_capacity(self.monitors.len());
        for monitor in self.monitors.drain(..) {
            if monitor.send(msg.clone()).await.is_ok() {
                open.push(monitor);
            } else {
                debug!("monitor disconnected");
            }
        }
        self.monitors = open;
    }

    async fn start_session(&mut self) -> Result<(), SessionError> {
        match self.status.state {
            State::NewSession => {}
            State::Expired => return Err(self.invalid_state("start")),
            state => {
                debug!(status = %state, "session already started");
                return Ok(());
            }
        }
        self.set_status(SessionStatus::new(State::WaitingBoth)).await;
        self.check_readiness().await;
        self.schedule_extraction().await;
        self.schedule_readiness_poll().await;
        Ok(())
    }

    async fn client_data(&mut self, data: ClientData) -> Result<(), SessionError> {
        let accepting = matches!(
            self.status.state,
            State::NewSession | State::WaitingBoth | State::WaitingClient
        );
        if !accepting {
            return Err(self.invalid_state("receive client data"));
        }
        if self.client_ready {
            return Err(SessionError::DuplicateClientData(
                self.params.session.clone(),
            ));
        }
        let parts: [(&'static str, &[u8]); 4] = [
            (AES_KEY, &data.encrypted_aes_key),
            (ALGORITHM, data.algorithm.as_bytes()),
            (CLIENT_GENOTYPES, &data.genotypes),
            (CLIENT_EXCLUDED, &data.exclusions),
        ];
        for (name, contents) in parts {
            self.files
                .write(name, contents)
                .await
                .map_err(|source| SessionError::Artifact { name, source })?;
        }
        self.files
            .mark_complete(CLIENT_DATA_COMPLETE)
            .await
            .map_err(|source| SessionError::Artifact {
                name: CLIENT_DATA_COMPLETE,
                source,
            })?;
        info!(bytes = data.genotypes.len(), "client data received");
        self.client_ready = true;
        if self.status.state != State::NewSession {
            self.check_readiness().await;
        }
        Ok(())
    }

    async fn results(&self) -> Result<Vec<u8>, SessionError> {
        if self.current_status().state != State::ResultsAvailable
            || !self.files.exists(RESULTS_COMPLETE).await
        {
            return Err(self.invalid_state("send the results"));
        }
        self.files
            .read(RESULTS)
            .await
            .map_err(|source| SessionError::Artifact {
                name: RESULTS,
                source,
            })
    }

    async fn check_readiness(&mut self) {
        if self.dispatched || !self.status.state.is_waiting() {
            return;
        }
        let state = match (self.client_ready, self.rpp_ready) {
            (true, true) => State::TpsSending,
            (true, false) => State::WaitingRpp,
            (false, true) => State::WaitingClient,
            (false, false) => State::WaitingBoth,
        };
        self.set_status(SessionStatus::new(state)).await;
        if state == State::TpsSending {
            self.dispatched = true;
            self.schedule_tps().await;
        }
    }

    async fn extracted(&mut self, res: Result<ExtractionStats, String>) {
        match res {
            Ok(stats) => {
                info!(?stats, "dataset extracted");
                self.rpp_ready = true;
                self.check_readiness().await;
            }
            Err(err) => {
                warn!(%err, "extraction failed");
                self.set_status(SessionStatus::with_detail(State::Error, err))
                    .await;
                self.ctx
                    .scheduler
                    .cancel_session(&self.params.session)
                    .await;
            }
        }
    }

    async fn tps_dispatched(&mut self, res: Result<(), String>) {
        let status = match res {
            Ok(()) => SessionStatus::new(State::TpsPending),
            Err(err) => SessionStatus::with_detail(State::TpsError, err),
        };
        self.set_status(status).await;
    }

    async fn polled(&mut self, res: Result<JobStatus, String>) {
        if self.status.state.is_final() {
            return;
        }
        let job = match res {
            Ok(job) => job,
            Err(err) => {
                self.set_status(SessionStatus::with_detail(State::TpsUnknown, err))
                    .await;
                return;
            }
        };
        if job.detail.is_some() && job.detail != self.last_tps_detail {
            self.last_tps_detail = job.detail.clone();
            let msg = Message::SendTpsStatus {
                session: self.params.session.clone(),
                detail: job.detail.clone().unwrap_or_default(),
            };
            self.push(msg).await;
        }
        let status = match job.state {
            JobState::Pending => SessionStatus::new(State::TpsPending),
            JobState::Running => SessionStatus::new(State::TpsRunning),
            JobState::Done => SessionStatus::new(State::TpsDone),
            JobState::Error => {
                SessionStatus::with_detail(State::TpsError, job.detail.unwrap_or_default())
            }
        };
        self.set_status(status).await;
        if job.state == JobState::Done {
            self.schedule_retrieval().await;
        }
    }

    async fn resume(&mut self) {
        self.client_ready = self.files.exists(CLIENT_DATA_COMPLETE).await;
        self.rpp_ready = self.files.exists(RPP_GENOTYPES_COMPLETE).await;
        let state = self.status.state;
        info!(status = %state, "resuming session");
        match state {
            State::WaitingBoth | State::WaitingClient | State::WaitingRpp => {
                if !self.rpp_ready {
                    self.schedule_extraction().await;
                }
                self.schedule_readiness_poll().await;
            }
            State::TpsSending => {
                self.dispatched = true;
                if let Err(err) = tokio::fs::remove_file(self.files.path(TPS_LAUNCHED)).await
                    && err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(?err, "unable to reset the dispatch marker");
                }
                self.schedule_tps().await;
            }
            State::TpsPending | State::TpsRunning | State::TpsError | State::TpsUnknown => {
                self.dispatched = true;
                self.schedule_tps().await;
            }
            State::TpsDone => {
                self.dispatched = true;
                self.schedule_retrieval().await;
            }
            State::NoSession
            | State::Unknown
            | State::NewSession
            | State::ResultsAvailable
            | State::Error
            | State::Expired => {}
        }
    }

    async fn schedule_extraction(&self) {
        let genotypes = self.genotypes.clone();
        let criteria = self.params.criteria.clone();
        let salt = self.params.hash_salt.clone();
        let files = self.files.clone();
        let cmd_tx = self.cmd_tx.clone();
        let job = async move {
            let res = tokio::task::spawn_blocking(move || {
                extract_dataset(&genotypes, &criteria, &salt, &files)
            })
            .await
            .map_err(|err| err.to_string())
            .and_then(|res| res.map_err(|err| err.to_string()));
            let _ = cmd_tx.send(SessionCmd::InternalExtracted(res)).await;
        };
        self.ctx
            .scheduler
            .run_once(&self.params.session, "extraction", job)
            .await;
    }

    async fn schedule_refresh(&self) {
        let cmd_tx = self.cmd_tx.clone();
        let job = move || {
            let cmd_tx = cmd_tx.clone();
            async move {
                let (tx, rx) = oneshot::channel();
                if cmd_tx.send(SessionCmd::InternalRefresh(tx)).await.is_err() {
                    return ControlFlow::Break(());
                }
                match rx.await {
                    Ok(true) => ControlFlow::Continue(()),
                    _ => ControlFlow::Break(()),
                }
            }
        };
        self.ctx
            .scheduler
            .run_repeating(
                &self.params.session,
                "monitor refresh",
                self.ctx.timing.monitor_refresh,
                job,
            )
            .await;
    }

    async fn schedule_readiness_poll(&self) {
        let files = self.files.clone();
        let cmd_tx = self.cmd_tx.clone();
        let job = move || {
            let files = files.clone();
            let cmd_tx = cmd_tx.clone();
            async move {
                let client = files.exists(CLIENT_DATA_COMPLETE).await;
                let rpp = files.exists(RPP_GENOTYPES_COMPLETE).await;
                let stopped = cmd_tx
                    .send(SessionCmd::InternalReadiness { client, rpp })
                    .await
                    .is_err();
                if stopped || (client && rpp) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        };
        self.ctx
            .scheduler
            .run_repeating(
                &self.params.session,
                "readiness",
                self.ctx.timing.readiness_poll,
                job,
            )
            .await;
    }

    /// Dispatches the session to the TPS unless it already was, then polls its status until
    /// the job is done.
    async fn schedule_tps(&self) {
        let session = self.params.session.clone();
        let files = self.files.clone();
        let tps = Arc::clone(&self.ctx.tps);
        let cmd_tx = self.cmd_tx.clone();
        let job = move || {
            let session = session.clone();
            let files = files.clone();
            let tps = Arc::clone(&tps);
            let cmd_tx = cmd_tx.clone();
            async move {
                let (cmd, flow) = if files.exists(TPS_LAUNCHED).await {
                    let res = tps.status(&session).await.map_err(|err| err.to_string());
                    let done = matches!(&res, Ok(job) if job.state == JobState::Done);
                    let flow = if done {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    };
                    (SessionCmd::InternalPolled(res), flow)
                } else {
                    let res = dispatch(&*tps, &session, &files).await;
                    (SessionCmd::InternalDispatched(res), ControlFlow::Continue(()))
                };
                if cmd_tx.send(cmd).await.is_err() {
                    return ControlFlow::Break(());
                }
                flow
            }
        };
        self.ctx
            .scheduler
            .run_repeating(&self.params.session, "tps", self.ctx.timing.tps_poll, job)
            .await;
    }

    async fn schedule_retrieval(&self) {
        let session = self.params.session.clone();
        let files = self.files.clone();
        let tps = Arc::clone(&self.ctx.tps);
        let cmd_tx = self.cmd_tx.clone();
        let job = move || {
            let session = session.clone();
            let files = files.clone();
            let tps = Arc::clone(&tps);
            let cmd_tx = cmd_tx.clone();
            async move {
                match retrieve(&*tps, &session, &files).await {
                    Ok(()) => {
                        let _ = cmd_tx.send(SessionCmd::InternalResultsStored).await;
                        ControlFlow::Break(())
                    }
                    Err(err) => {
                        warn!(%err, "unable to retrieve the results, retrying");
                        ControlFlow::Continue(())
                    }
                }
            }
        };
        self.ctx
            .scheduler
            .run_repeating(
                &self.params.session,
                "retrieval",
                self.ctx.timing.results_retry,
                job,
            )
            .await;
    }
}

/// Extracts the dataset and writes the RPP half of the session, marker last.
fn extract_dataset(
    genotypes: &std::path::Path,
    criteria: &privas::extractor::Criteria,
    salt: &str,
    files: &SessionFiles,
) -> Result<ExtractionStats, ExtractError> {
    let extraction = Extractor::new(criteria, salt).extract_file(genotypes)?;
    let mut out = std::io::BufWriter::new(std::fs::File::create(files.path(RPP_GENOTYPES))?);
    extraction.write_genotypes(&mut out)?;
    std::io::Write::flush(&mut out)?;
    extraction.write_exclusions(std::fs::File::create(files.path(RPP_EXCLUDED))?)?;
    std::fs::write(files.path(RPP_GENOTYPES_COMPLETE), b"")?;
    Ok(extraction.stats)
}

async fn dispatch<T: TpsLink>(
    tps: &T,
    session: &SessionId,
    files: &SessionFiles,
) -> Result<(), String> {
    tps.upload(session, files)
        .await
        .map_err(|err| format!("upload failed: {err}"))?;
    tps.launch(session)
        .await
        .map_err(|err| format!("launch failed: {err}"))?;
    files
        .mark_complete(TPS_LAUNCHED)
        .await
        .map_err(|err| format!("unable to mark the launch: {err}"))
}

async fn retrieve<T: TpsLink>(
    tps: &T,
    session: &SessionId,
    files: &SessionFiles,
) -> Result<(), String> {
    let results = tps
        .fetch_results(session)
        .await
        .map_err(|err| err.to_string())?;
    files
        .write(RESULTS, results)
        .await
        .map_err(|err| err.to_string())?;
    files
        .mark_complete(RESULTS_COMPLETE)
        .await
        .map_err(|err| err.to_string())
}

impl<T> Debug for SessionActor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionActor")
            .field("session", &self.params.session)
            .field("status", &self.status)
            .field("monitors", &self.monitors.len())
            .finish_non_exhaustive()
    }
}
