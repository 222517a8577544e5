use privas::{
    message::{ClientData, Message},
    status::SessionStatus,
};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::state::{SessionCmd, SessionError};

/// A handle for an executing [`SessionActor`] state-machine.
///
/// This cheaply clonable handle is how connections and the registry talk to a session.
///
/// [`SessionActor`]: crate::SessionActor
#[derive(Debug, Clone)]
pub struct SessionHandle(pub(crate) mpsc::Sender<SessionCmd>);

/// Errors when controlling a [`SessionActor`] state-machine.
///
/// [`SessionActor`]: crate::SessionActor
#[derive(thiserror::Error, Debug)]
pub enum HandleError<E> {
    /// The state-machine for this handle is stopped.
    #[error("state machine for this handle is stopped")]
    StateMachineStopped,
    /// An error returned by the state-machine.
    #[error(transparent)]
    SessionError(E),
}

impl SessionHandle {
    /// Handles `StartSession`. Starting a session twice has no effect.
    pub async fn start(&self) -> Result<(), HandleError<SessionError>> {
        let (ret_tx, ret_rx) = oneshot::channel();
        self.0.send(SessionCmd::Start(ret_tx)).await?;
        ret_rx.await?.map_err(HandleError::SessionError)
    }

    /// Stores the Client's half of the data.
    pub async fn client_data(&self, data: ClientData) -> Result<(), HandleError<SessionError>> {
        let (ret_tx, ret_rx) = oneshot::channel();
        self.0.send(SessionCmd::ClientData(data, ret_tx)).await?;
        ret_rx.await?.map_err(HandleError::SessionError)
    }

    pub async fn status(&self) -> Result<SessionStatus, HandleError<SessionError>> {
        let (ret_tx, ret_rx) = oneshot::channel();
        self.0.send(SessionCmd::Status(ret_tx)).await?;
        Ok(ret_rx.await?)
    }

    /// Registers `monitor`, which receives `SendRPPStatus` and `SendTPSStatus` messages until it
    /// is closed.
    pub async fn monitor(
        &self,
        monitor: mpsc::Sender<Message>,
    ) -> Result<SessionStatus, HandleError<SessionError>> {
        let (ret_tx, ret_rx) = oneshot::channel();
        self.0.send(SessionCmd::Monitor(monitor, ret_tx)).await?;
        Ok(ret_rx.await?)
    }

    /// The encrypted results, once the session is `RESULTS_AVAILABLE`.
    pub async fn results(&self) -> Result<Vec<u8>, HandleError<SessionError>> {
        let (ret_tx, ret_rx) = oneshot::channel();
        self.0.send(SessionCmd::Results(ret_tx)).await?;
        ret_rx.await?.map_err(HandleError::SessionError)
    }

    /// Restarts the background work of a restored session.
    pub async fn resume(&self) -> Result<(), HandleError<SessionError>> {
        self.0.send(SessionCmd::Resume).await?;
        Ok(())
    }

    /// Expires the session. The state machine stops afterwards.
    pub async fn expire(&self) -> Result<(), HandleError<SessionError>> {
        let (ret_tx, ret_rx) = oneshot::channel();
        self.0.send(SessionCmd::Expire(ret_tx)).await?;
        Ok(ret_rx.await?)
    }
}

impl<T, E> From<mpsc::error::SendError<T>> for HandleError<E> {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::StateMachineStopped
    }
}

impl<E> From<oneshot::error::RecvError> for HandleError<E> {
    fn from(_: oneshot::error::RecvError) -> Self {
        error!("ret sender dropped");
        Self::StateMachineStopped
    }
}
