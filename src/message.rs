//! The closed set of messages exchanged between the Client and the RPP.
//!
//! Every message is one variant of [`Message`]. On the wire it is encoded by `bincode` (a `u32`
//! variant tag followed by the fields in declaration order) and framed by
//! [`crate::channel`]. Requests are answered by exactly one reply, except
//! [`Message::AskMonitor`] which keeps the connection open for status pushes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{bed::BedFile, extractor::Criteria, session_id::SessionId, status::SessionStatus};

/// Protocol level errors, raised when a reply does not match its request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The other party answered with [`Message::SendError`].
    #[error("request rejected: {0}")]
    Rejected(String),
    /// The reply is of the wrong kind.
    #[error("expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },
    /// The reply concerns another session.
    #[error("reply for session {got}, expected {expected}")]
    SessionMismatch { expected: SessionId, got: SessionId },
}

/// A dataset offered by the RPP, with its number of samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescription {
    pub name: String,
    pub size: usize,
}

impl fmt::Display for DatasetDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.size)
    }
}

/// What the RPP offers, sent before any session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RppConfiguration {
    pub datasets: Vec<DatasetDescription>,
    pub gnomad_versions: Vec<String>,
    pub tps_name: String,
}

/// A Client asking for a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// SPKI PEM of the Client's session key.
    pub client_public_key: String,
    pub dataset: String,
    pub gnomad_version: String,
    /// Filters, with the regions covered by the Client.
    pub criteria: Criteria,
    /// Opaque quality control parameters.
    pub qc_params: String,
}

/// The RPP's answer to a [`SessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOffer {
    pub session: SessionId,
    /// The session hash salt, RSA-encrypted with the Client's key.
    pub encrypted_salt: Vec<u8>,
    /// SPKI PEM of the TPS key.
    pub tps_public_key: String,
    /// Intersection of the regions covered by the Client and by the dataset.
    pub bed: BedFile,
}

/// The Client's half of the data. Only the TPS can decrypt it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    pub session: SessionId,
    /// The AES key, RSA-encrypted with the TPS key.
    pub encrypted_aes_key: Vec<u8>,
    /// AES-encrypted hashed genotype matrix.
    pub genotypes: Vec<u8>,
    /// AES-encrypted exclusion list.
    pub exclusions: Vec<u8>,
    /// Opaque description of the association test to run.
    pub algorithm: String,
}

impl fmt::Debug for ClientData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientData")
            .field("session", &self.session)
            .field("genotypes", &format_args!("{} bytes", self.genotypes.len()))
            .field("exclusions", &format_args!("{} bytes", self.exclusions.len()))
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A request or a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    AskRppConfiguration,
    SendRppConfiguration(RppConfiguration),
    AskSession(SessionRequest),
    SendSession(SessionOffer),
    StartSession { session: SessionId },
    SessionStarted { session: SessionId },
    SendClientData(ClientData),
    AckClientData { session: SessionId },
    AskResults { session: SessionId },
    SendResults { session: SessionId, results: Vec<u8> },
    AskMonitor { session: SessionId },
    SendRppStatus { session: SessionId, status: SessionStatus },
    SendTpsStatus { session: SessionId, detail: String },
    SendError { message: String },
}

impl Message {
    /// The session a message belongs to, if any.
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            Message::AskRppConfiguration
            | Message::SendRppConfiguration(_)
            | Message::AskSession(_)
            | Message::SendError { .. } => None,
            Message::SendSession(offer) => Some(&offer.session),
            Message::SendClientData(data) => Some(&data.session),
            Message::StartSession { session }
            | Message::SessionStarted { session }
            | Message::AckClientData { session }
            | Message::AskResults { session }
            | Message::SendResults { session, .. }
            | Message::AskMonitor { session }
            | Message::SendRppStatus { session, .. }
            | Message::SendTpsStatus { session, .. } => Some(session),
        }
    }

    /// The name of the message kind, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AskRppConfiguration => "AskRPPConfiguration",
            Message::SendRppConfiguration(_) => "SendRPPConfiguration",
            Message::AskSession(_) => "AskSession",
            Message::SendSession(_) => "SendSession",
            Message::StartSession { .. } => "StartSession",
            Message::SessionStarted { .. } => "SessionStarted",
            Message::SendClientData(_) => "SendClientData",
            Message::AckClientData { .. } => "AckClientData",
            Message::AskResults { .. } => "AskResults",
            Message::SendResults { .. } => "SendResults",
            Message::AskMonitor { .. } => "AskMonitor",
            Message::SendRppStatus { .. } => "SendRPPStatus",
            Message::SendTpsStatus { .. } => "SendTPSStatus",
            Message::SendError { .. } => "SendError",
        }
    }

    /// Turns a [`Message::SendError`] reply into [`MessageError::Rejected`] and checks that any
    /// other reply belongs to `session`.
    pub fn into_reply(self, session: Option<&SessionId>) -> Result<Message, MessageError> {
        if let Message::SendError { message } = self {
            return Err(MessageError::Rejected(message));
        }
        if let (Some(expected), Some(got)) = (session, self.session()) {
            if expected != got {
                return Err(MessageError::SessionMismatch {
                    expected: expected.clone(),
                    got: got.clone(),
                });
            }
        }
        Ok(self)
    }

    /// The error for a reply of the wrong kind.
    pub fn unexpected(self, expected: &'static str) -> MessageError {
        MessageError::UnexpectedReply {
            expected,
            got: self.kind(),
        }
    }
}
