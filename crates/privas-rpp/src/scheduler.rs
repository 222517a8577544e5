//! A bounded pool for the background work of sessions.
//!
//! Jobs are plain tokio tasks, but each one holds a permit of a shared [`Semaphore`] while it
//! executes, which bounds how many extractions, uploads and polls run at the same time.
//! Repeating jobs release their permit while they sleep.

use std::{collections::HashMap, ops::ControlFlow, sync::Arc, time::Duration};

use privas::session_id::SessionId;
use tokio::{
    sync::{Mutex, Semaphore},
    task::AbortHandle,
};
use tracing::{Instrument, debug, debug_span};

#[derive(Debug, Clone)]
pub struct Scheduler {
    permits: Arc<Semaphore>,
    jobs: Arc<Mutex<HashMap<SessionId, Vec<AbortHandle>>>>,
}

impl Scheduler {
    /// A scheduler running at most `workers` jobs concurrently.
    ///
    /// # Panics
    /// - If `workers` is 0.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a scheduler needs at least one worker");
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            jobs: Default::default(),
        }
    }

    /// Runs `job` once, as soon as a worker is free.
    pub async fn run_once<F>(&self, session: &SessionId, name: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let span = debug_span!("job", %session, job = name);
        let task = tokio::spawn(
            async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                debug!("running");
                job.await;
            }
            .instrument(span),
        );
        self.track(session, task.abort_handle()).await;
    }

    /// Runs `job` now, then again `delay` after each run, until it returns
    /// [`ControlFlow::Break`] or the session is cancelled.
    pub async fn run_repeating<F, Fut>(
        &self,
        session: &SessionId,
        name: &'static str,
        delay: Duration,
        mut job: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let span = debug_span!("job", %session, job = name);
        let task = tokio::spawn(
            async move {
                loop {
                    let flow = {
                        let Ok(_permit) = permits.acquire().await else {
                            return;
                        };
                        job().await
                    };
                    if flow.is_break() {
                        debug!("done");
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
            .instrument(span),
        );
        self.track(session, task.abort_handle()).await;
    }

    /// Aborts every pending job of `session`, returns how many were still running.
    ///
    /// A job that is blocked on a worker thread (like an extraction) finishes its current
    /// step, but is not run again.
    pub async fn cancel_session(&self, session: &SessionId) -> usize {
        let Some(handles) = self.jobs.lock().await.remove(session) else {
            return 0;
        };
        let mut cancelled = 0;
        for handle in handles.into_iter().filter(|h| !h.is_finished()) {
            handle.abort();
            cancelled += 1;
        }
        debug!(%session, cancelled, "cancelled session jobs");
        cancelled
    }

    /// Number of jobs of `session` that have not finished yet.
    pub async fn active_jobs(&self, session: &SessionId) -> usize {
        self.jobs
            .lock()
            .await
            .get(session)
            .map_or(0, |handles| handles.iter().filter(|h| !h.is_finished()).count())
    }

    async fn track(&self, session: &SessionId, handle: AbortHandle) {
        let mut jobs = self.jobs.lock().await;
        let handles = jobs.entry(session.clone()).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}
