//! The Reference Panel Provider server.
//!
//! The RPP accepts session requests from Clients, extracts its own dataset with each session's
//! salt, collects the Client's encrypted half of the data and hands both to the Third-Party
//! Server. Every session is driven by its own [`SessionActor`], controlled through a
//! [`SessionHandle`]; the [`Registry`] owns the handles and the session directories.

pub mod access;
pub mod config;
mod handle;
pub mod params;
pub mod registry;
pub mod scheduler;
pub mod server;
mod state;
pub mod tps;

pub use handle::{HandleError, SessionHandle};
pub use registry::{Registry, RegistryError};
pub use state::{SessionActor, SessionCmd, SessionContext, SessionError, Timing};
