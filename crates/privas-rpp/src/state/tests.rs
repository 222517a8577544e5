use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use privas::{
    artifacts::SessionFiles,
    crypto::{generate_rsa_keypair, generate_salt},
    extractor::Criteria,
    genotype::Consequence,
    message::{ClientData, Message},
    session_id::SessionId,
    status::{SessionStatus, State},
    tps::{JobState, JobStatus},
};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

use crate::{
    handle::{HandleError, SessionHandle},
    params::SessionParams,
    scheduler::Scheduler,
    state::{SessionActor, SessionContext, SessionError, Timing},
    tps::TpsLink,
};

const GENOTYPES: &str = "\
#CHROM\tPOS\tID\tREF\tALT\tGENE\tCONSEQUENCE\tAF\tAF_SUB\tR1,R2,R3
chr1\t1000\t.\tA\tG\tGENE1\tmissense_variant\t0.001\t0.001\t0,1,2
chr1\t2000\t.\tC\tT\tGENE1\tstop_gained\t0.01\t0.001\t1,1,0
chr2\t500\t.\tG\tA\tGENE2\tintron_variant\t0.001\t0.001\t0,0,1
";

const FAST: Timing = Timing {
    readiness_poll: Duration::from_millis(10),
    tps_poll: Duration::from_millis(10),
    results_retry: Duration::from_millis(10),
    expiry_sweep: Duration::from_secs(3600),
    monitor_refresh: Duration::from_secs(3600),
};

#[derive(Default)]
struct FakeTps {
    uploads: AtomicUsize,
    launches: AtomicUsize,
    unreachable: AtomicBool,
    statuses: Mutex<VecDeque<JobStatus>>,
}

impl FakeTps {
    fn with_statuses(states: &[JobState]) -> Self {
        Self {
            statuses: Mutex::new(states.iter().map(|s| JobStatus::new(*s)).collect()),
            ..Default::default()
        }
    }
}

impl TpsLink for FakeTps {
    type Error = std::io::Error;

    async fn public_key(&self) -> Result<String, Self::Error> {
        Ok(String::new())
    }

    async fn upload(&self, _: &SessionId, _: &SessionFiles) -> Result<(), Self::Error> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("connection refused"));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn launch(&self, _: &SessionId) -> Result<(), Self::Error> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, _: &SessionId) -> Result<JobStatus, Self::Error> {
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        status.ok_or_else(|| std::io::Error::other("no status"))
    }

    async fn fetch_results(&self, _: &SessionId) -> Result<Vec<u8>, Self::Error> {
        Ok(b"sealed results".to_vec())
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    handle: SessionHandle,
    scheduler: Scheduler,
    session: SessionId,
    updates: mpsc::Receiver<Message>,
}

async fn fixture(tps: &Arc<FakeTps>, session: SessionId, status: State, genotypes: bool) -> Fixture {
    fixture_with(tps, session, status, genotypes, FAST).await
}

async fn fixture_with(
    tps: &Arc<FakeTps>,
    session: SessionId,
    status: State,
    genotypes: bool,
    timing: Timing,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let genotype_file = dir.path().join("panel.tsv");
    if genotypes {
        std::fs::write(&genotype_file, GENOTYPES).unwrap();
    }
    let session_dir = dir.path().join(session.as_str());
    std::fs::create_dir(&session_dir).unwrap();
    let (client_public_key, _) = generate_rsa_keypair().unwrap();
    let params = SessionParams {
        session: session.clone(),
        dataset: "panel".to_string(),
        gnomad_version: "v4".to_string(),
        criteria: Criteria {
            max_af: 0.05,
            max_af_sub: 0.05,
            min_consequence: Consequence::MissenseVariant,
            snv_only: true,
            bed: Default::default(),
        },
        qc_params: String::new(),
        hash_salt: generate_salt(),
        client_public_key,
    };
    let scheduler = Scheduler::new(4);
    let ctx = SessionContext {
        tps: Arc::clone(tps),
        scheduler: scheduler.clone(),
        timing,
    };
    let (actor, handle) = SessionActor::new(
        params,
        genotype_file,
        SessionFiles::new(&session_dir),
        SessionStatus::new(status),
        ctx,
    );
    tokio::spawn(actor.start());
    let (tx, updates) = mpsc::channel(64);
    handle.monitor(tx).await.unwrap();
    Fixture {
        dir,
        handle,
        scheduler,
        session,
        updates,
    }
}

fn client_data(session: &SessionId) -> ClientData {
    ClientData {
        session: session.clone(),
        encrypted_aes_key: vec![1; 256],
        genotypes: b"encrypted genotypes".to_vec(),
        exclusions: b"encrypted exclusions".to_vec(),
        algorithm: "count".to_string(),
    }
}

async fn next_state(updates: &mut mpsc::Receiver<Message>) -> State {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), updates.recv())
            .await
            .expect("no status update")
            .expect("monitor closed");
        if let Message::SendRppStatus { status, .. } = msg {
            return status.state;
        }
    }
}

/// The states reported up to `last`, repeats of an unchanged status collapsed.
async fn states_until(updates: &mut mpsc::Receiver<Message>, last: State) -> Vec<State> {
    let mut states = vec![];
    loop {
        let state = next_state(updates).await;
        if states.last() != Some(&state) {
            states.push(state);
        }
        if state == last {
            return states;
        }
    }
}

fn trace() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

fn exists(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

#[tokio::test]
async fn client_data_first_reaches_waiting_rpp() {
    let _g = trace();
    let tps = Arc::new(FakeTps::with_statuses(&[
        JobState::Pending,
        JobState::Running,
        JobState::Done,
    ]));
    let mut f = fixture(&tps, SessionId::generate(), State::NewSession, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::NewSession);

    f.handle.client_data(client_data(&f.session)).await.unwrap();
    f.handle.start().await.unwrap();
    assert_eq!(
        states_until(&mut f.updates, State::ResultsAvailable).await,
        vec![
            State::WaitingBoth,
            State::WaitingRpp,
            State::TpsSending,
            State::TpsPending,
            State::TpsRunning,
            State::TpsDone,
            State::ResultsAvailable,
        ]
    );
    assert_eq!(f.handle.results().await.unwrap(), b"sealed results");
    assert_eq!(tps.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(tps.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rpp_first_reaches_waiting_client() {
    let _g = trace();
    let tps = Arc::new(FakeTps::with_statuses(&[JobState::Done]));
    let mut f = fixture(&tps, SessionId::generate(), State::NewSession, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::NewSession);

    f.handle.start().await.unwrap();
    assert_eq!(next_state(&mut f.updates).await, State::WaitingBoth);
    assert_eq!(next_state(&mut f.updates).await, State::WaitingClient);

    f.handle.client_data(client_data(&f.session)).await.unwrap();
    let rest = states_until(&mut f.updates, State::ResultsAvailable).await;
    assert_eq!(rest.first(), Some(&State::TpsSending));
    assert_eq!(rest.iter().filter(|s| **s == State::TpsSending).count(), 1);
    assert_eq!(tps.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_data_is_accepted_once() {
    let tps = Arc::new(FakeTps::default());
    let f = fixture(&tps, SessionId::generate(), State::NewSession, true).await;
    f.handle.client_data(client_data(&f.session)).await.unwrap();
    let err = f
        .handle
        .client_data(client_data(&f.session))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HandleError::SessionError(SessionError::DuplicateClientData(_))
    ));
}

#[tokio::test]
async fn start_twice_has_no_effect() {
    let tps = Arc::new(FakeTps::default());
    let mut f = fixture(&tps, SessionId::generate(), State::NewSession, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::NewSession);
    f.handle.start().await.unwrap();
    assert_eq!(next_state(&mut f.updates).await, State::WaitingBoth);
    assert_eq!(next_state(&mut f.updates).await, State::WaitingClient);
    f.handle.start().await.unwrap();
    assert_eq!(f.handle.status().await.unwrap().state, State::WaitingClient);
}

#[tokio::test]
async fn results_before_completion_are_refused() {
    let tps = Arc::new(FakeTps::default());
    let f = fixture(&tps, SessionId::generate(), State::WaitingBoth, true).await;
    assert!(matches!(
        f.handle.results().await,
        Err(HandleError::SessionError(SessionError::InvalidState {
            state: State::WaitingBoth,
            ..
        }))
    ));
}

#[tokio::test]
async fn extraction_failure_is_fatal() {
    let _g = trace();
    let tps = Arc::new(FakeTps::default());
    let mut f = fixture(&tps, SessionId::generate(), State::NewSession, false).await;
    assert_eq!(next_state(&mut f.updates).await, State::NewSession);
    f.handle.start().await.unwrap();
    assert_eq!(next_state(&mut f.updates).await, State::WaitingBoth);
    assert_eq!(next_state(&mut f.updates).await, State::Error);
    let status = f.handle.status().await.unwrap();
    assert!(status.detail.is_some());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.scheduler.active_jobs(&f.session).await, 0);
}

#[tokio::test]
async fn dispatch_failure_is_retried() {
    let _g = trace();
    let tps = Arc::new(FakeTps::with_statuses(&[JobState::Done]));
    tps.unreachable.store(true, Ordering::SeqCst);
    let mut f = fixture(&tps, SessionId::generate(), State::NewSession, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::NewSession);
    f.handle.client_data(client_data(&f.session)).await.unwrap();
    f.handle.start().await.unwrap();
    assert_eq!(
        states_until(&mut f.updates, State::TpsError).await,
        vec![
            State::WaitingBoth,
            State::WaitingRpp,
            State::TpsSending,
            State::TpsError
        ]
    );
    tps.unreachable.store(false, Ordering::SeqCst);
    assert_eq!(
        states_until(&mut f.updates, State::ResultsAvailable).await,
        vec![
            State::TpsPending,
            State::TpsDone,
            State::ResultsAvailable
        ]
    );
}

#[tokio::test]
async fn expired_session_reports_expired() {
    let tps = Arc::new(FakeTps::default());
    let old = SessionId::generate_at(Utc::now() - TimeDelta::days(15));
    let mut f = fixture(&tps, old, State::ResultsAvailable, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::Expired);
    assert_eq!(f.handle.status().await.unwrap().state, State::Expired);

    f.handle.expire().await.unwrap();
    assert!(matches!(
        f.handle.status().await,
        Err(HandleError::StateMachineStopped)
    ));
}

#[tokio::test]
async fn lapsed_session_refuses_to_start() {
    let tps = Arc::new(FakeTps::default());
    let old = SessionId::generate_at(Utc::now() - TimeDelta::days(15));
    let mut f = fixture(&tps, old, State::NewSession, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::Expired);

    let res = f.handle.start().await;
    assert!(matches!(
        res,
        Err(HandleError::SessionError(SessionError::InvalidState {
            state: State::Expired,
            ..
        }))
    ));
    let res = f.handle.client_data(client_data(&f.session)).await;
    assert!(matches!(
        res,
        Err(HandleError::SessionError(SessionError::InvalidState { .. }))
    ));
    assert_eq!(f.handle.status().await.unwrap().state, State::Expired);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.scheduler.active_jobs(&f.session).await, 0);
    assert_eq!(tps.uploads.load(Ordering::SeqCst), 0);
    let dir = f.dir.path().join(f.session.as_str());
    assert!(!exists(&dir, privas::artifacts::RPP_GENOTYPES_COMPLETE));
    assert!(!exists(&dir, privas::artifacts::CLIENT_DATA_COMPLETE));
}

#[tokio::test]
async fn monitors_hear_an_unchanged_status_again() {
    let tps = Arc::new(FakeTps::with_statuses(&[JobState::Running]));
    let timing = Timing {
        monitor_refresh: Duration::from_millis(20),
        ..FAST
    };
    let mut f = fixture_with(&tps, SessionId::generate(), State::NewSession, true, timing).await;
    f.handle.start().await.unwrap();
    f.handle.client_data(client_data(&f.session)).await.unwrap();
    states_until(&mut f.updates, State::TpsRunning).await;
    assert_eq!(next_state(&mut f.updates).await, State::TpsRunning);
    assert_eq!(next_state(&mut f.updates).await, State::TpsRunning);
    assert_eq!(f.handle.status().await.unwrap().state, State::TpsRunning);
}

#[tokio::test]
async fn resume_after_tps_done_retrieves_results() {
    let tps = Arc::new(FakeTps::default());
    let mut f = fixture(&tps, SessionId::generate(), State::TpsDone, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::TpsDone);
    f.handle.resume().await.unwrap();
    assert_eq!(next_state(&mut f.updates).await, State::ResultsAvailable);
    assert_eq!(tps.uploads.load(Ordering::SeqCst), 0);
    assert_eq!(f.handle.results().await.unwrap(), b"sealed results");
}

#[tokio::test]
async fn resume_of_final_sessions_starts_nothing() {
    for state in [State::ResultsAvailable, State::Error, State::NewSession] {
        let tps = Arc::new(FakeTps::default());
        let f = fixture(&tps, SessionId::generate(), state, true).await;
        let before = f.scheduler.active_jobs(&f.session).await;
        f.handle.resume().await.unwrap();
        assert_eq!(f.handle.status().await.unwrap().state, state);
        assert_eq!(f.scheduler.active_jobs(&f.session).await, before);
    }
}

#[tokio::test]
async fn resume_while_waiting_extracts_again() {
    let tps = Arc::new(FakeTps::with_statuses(&[JobState::Done]));
    let mut f = fixture(&tps, SessionId::generate(), State::WaitingClient, true).await;
    assert_eq!(next_state(&mut f.updates).await, State::WaitingClient);
    f.handle.resume().await.unwrap();
    // no RPP marker yet, the extraction runs again
    f.handle.client_data(client_data(&f.session)).await.unwrap();
    let states = states_until(&mut f.updates, State::ResultsAvailable).await;
    assert!(states.contains(&State::TpsSending));
    let dir = f.dir.path().join(f.session.as_str());
    assert!(exists(&dir, privas::artifacts::RPP_GENOTYPES_COMPLETE));
    assert!(exists(&dir, super::TPS_LAUNCHED));
}
