//! The accept loop: one task per connection, one request per connection, except monitors
//! which stay open until their session reaches a final status.

use std::{net::SocketAddr, sync::Arc};

use privas::{
    channel::MsgChannel,
    message::Message,
    session_id::SessionId,
    status::{SessionStatus, State},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    handle::HandleError,
    registry::{Registry, RegistryError},
    state::SessionError,
    tps::TpsLink,
};

/// Why a request was answered with `SendError`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] HandleError<SessionError>),
    #[error("unexpected message {0}")]
    Unexpected(&'static str),
}

pub struct Server<T> {
    registry: Arc<Registry<T>>,
}

impl<T: TpsLink> Server<T> {
    pub fn new(registry: Arc<Registry<T>>) -> Self {
        Self { registry }
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!("listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = Arc::clone(&self.registry);
            let span = info_span!("connection", %peer);
            tokio::spawn(handle_connection(registry, stream, peer).instrument(span));
        }
    }
}

async fn handle_connection<T: TpsLink>(
    registry: Arc<Registry<T>>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut channel = MsgChannel(stream);
    let msg: Message = match channel.recv().await {
        Ok(msg) => msg,
        Err(err) => {
            warn!(%err, "unable to read request");
            return;
        }
    };
    debug!(kind = msg.kind(), "request received");
    if let Message::AskMonitor { session } = msg {
        monitor(&registry, channel, session).await;
        return;
    }
    let reply = match respond(&registry, msg, peer).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%err, "request rejected");
            Message::SendError {
                message: err.to_string(),
            }
        }
    };
    if let Err(err) = channel.send(&reply).await {
        warn!(%err, kind = reply.kind(), "unable to send reply");
    }
}

async fn respond<T: TpsLink>(
    registry: &Registry<T>,
    msg: Message,
    peer: SocketAddr,
) -> Result<Message, RequestError> {
    let reply = match msg {
        Message::AskRppConfiguration => Message::SendRppConfiguration(registry.configuration()),
        Message::AskSession(request) => {
            Message::SendSession(registry.create(request, peer.ip()).await?)
        }
        Message::StartSession { session } => {
            registry.get(&session).await?.start().await?;
            Message::SessionStarted { session }
        }
        Message::SendClientData(data) => {
            let session = data.session.clone();
            registry.get(&session).await?.client_data(data).await?;
            Message::AckClientData { session }
        }
        Message::AskResults { session } => {
            let results = registry.get(&session).await?.results().await?;
            Message::SendResults { session, results }
        }
        other => return Err(RequestError::Unexpected(other.kind())),
    };
    Ok(reply)
}

/// Forwards the status updates of `session` until it reaches a final status or the Client
/// goes away.
async fn monitor<T: TpsLink>(
    registry: &Registry<T>,
    mut channel: MsgChannel<TcpStream>,
    session: SessionId,
) {
    let handle = match registry.get(&session).await {
        Ok(handle) => handle,
        Err(RegistryError::Expired(_)) => {
            let msg = Message::SendRppStatus {
                session,
                status: SessionStatus::new(State::Expired),
            };
            let _ = channel.send(&msg).await;
            return;
        }
        Err(err) => {
            let _ = channel
                .send(&Message::SendError {
                    message: err.to_string(),
                })
                .await;
            return;
        }
    };
    let (tx, mut rx) = mpsc::channel(32);
    if let Err(err) = handle.monitor(tx).await {
        let _ = channel
            .send(&Message::SendError {
                message: err.to_string(),
            })
            .await;
        return;
    }
    debug!(%session, "monitor registered");
    while let Some(msg) = rx.recv().await {
        let is_final = matches!(&msg, Message::SendRppStatus { status, .. } if status.state.is_final());
        if let Err(err) = channel.send(&msg).await {
            debug!(%session, %err, "monitor disconnected");
            return;
        }
        if is_final {
            debug!(%session, "session reached a final status");
            return;
        }
    }
}
