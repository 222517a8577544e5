//! The lifecycle states of a session as seen by the RPP.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A closed set of session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// No session exists yet.
    NoSession,
    /// The status could not be restored.
    Unknown,
    NewSession,
    WaitingBoth,
    /// The RPP data is ready, the Client data is missing.
    WaitingClient,
    /// The Client data is ready, the RPP data is missing.
    WaitingRpp,
    TpsSending,
    TpsPending,
    TpsRunning,
    TpsDone,
    TpsError,
    TpsUnknown,
    ResultsAvailable,
    Error,
    Expired,
}

const STATES: [State; 15] = [
    State::NoSession,
    State::Unknown,
    State::NewSession,
    State::WaitingBoth,
    State::WaitingClient,
    State::WaitingRpp,
    State::TpsSending,
    State::TpsPending,
    State::TpsRunning,
    State::TpsDone,
    State::TpsError,
    State::TpsUnknown,
    State::ResultsAvailable,
    State::Error,
    State::Expired,
];

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::NoSession => "NO_SESSION",
            State::Unknown => "UNKNOWN",
            State::NewSession => "NEW_SESSION",
            State::WaitingBoth => "WAITING_BOTH",
            State::WaitingClient => "WAITING_CLIENT",
            State::WaitingRpp => "WAITING_RPP",
            State::TpsSending => "TPS_SENDING",
            State::TpsPending => "TPS_PENDING",
            State::TpsRunning => "TPS_RUNNING",
            State::TpsDone => "TPS_DONE",
            State::TpsError => "TPS_ERROR",
            State::TpsUnknown => "TPS_UNKNOWN",
            State::ResultsAvailable => "RESULTS_AVAILABLE",
            State::Error => "ERROR",
            State::Expired => "EXPIRED",
        }
    }

    /// Whether one of the parties' data is still missing.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            State::WaitingBoth | State::WaitingClient | State::WaitingRpp
        )
    }

    /// Whether the TPS job was dispatched and has not finished yet.
    pub fn is_tps_in_flight(self) -> bool {
        matches!(
            self,
            State::TpsPending | State::TpsRunning | State::TpsError | State::TpsUnknown
        )
    }

    /// States after which nothing happens anymore.
    pub fn is_final(self) -> bool {
        matches!(self, State::ResultsAvailable | State::Error | State::Expired)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = std::convert::Infallible;

    /// Unknown names parse to [`State::Unknown`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(STATES
            .into_iter()
            .find(|state| state.as_str() == s.trim())
            .unwrap_or(State::Unknown))
    }
}

/// A state with its optional detail and the time it was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: State,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SessionStatus {
    /// A status entered now.
    pub fn new(state: State) -> Self {
        Self {
            state,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// A status with a human-readable detail, entered now.
    pub fn with_detail(state: State, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(state)
        }
    }

    /// Whether `other` carries the same information, ignoring the timestamp.
    pub fn same_as(&self, other: &SessionStatus) -> bool {
        self.state == other.state && self.detail == other.detail
    }
}

/// The status file line: `STATE<TAB>rfc3339<TAB>detail`.
impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = self.detail.as_deref().unwrap_or_default();
        // keep the status on a single line
        let detail = detail.replace(['\n', '\r', '\t'], " ");
        write!(
            f,
            "{}\t{}\t{}",
            self.state,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            detail
        )
    }
}

/// A status line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status line '{0}'")]
pub struct InvalidStatus(pub String);

impl FromStr for SessionStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.lines().next().unwrap_or_default();
        let mut fields = line.splitn(3, '\t');
        let state = fields.next().unwrap_or_default();
        let Some(timestamp) = fields.next() else {
            return Err(InvalidStatus(line.to_string()));
        };
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| InvalidStatus(line.to_string()))?
            .with_timezone(&Utc);
        let detail = fields.next().filter(|d| !d.trim().is_empty());
        Ok(Self {
            state: state.parse().unwrap_or(State::Unknown),
            detail: detail.map(str::to_string),
            timestamp,
        })
    }
}
