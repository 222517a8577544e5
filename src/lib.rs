//! Secure three-party association tests on genomic data.
//!
//! A Client holding private genotypes runs a gene-level association test against the dataset
//! of a Reference Panel Provider (RPP). The statistic itself is computed by a Third-Party Server
//! (TPS) trusted by both. Neither the RPP nor the TPS sees the Client's identifiers in clear
//! text, and the Client never sees the RPP's data.
//!
//! ## Main Components
//!
//! * [`channel`]: block-compressed message framing over a byte stream.
//! * [`crypto`]: RSA, AES-GCM and the salted hash used for pseudonymization.
//! * [`bed`]: genomic interval sets restricting which positions may leave a party.
//! * [`extractor`]: the de-identification pipeline (filter, hash, shuffle).
//! * [`message`]: the closed set of messages exchanged between the Client and the RPP.
//! * [`client`]: the Client side of the protocol, with [`record`] as its persisted state.
//! * [`tps`]: the job run by the TPS on a session directory.
//!
//! The RPP server (session registry, state machine and accept loop) lives in the
//! `privas-rpp` crate.
//!
//! ## Protocol
//!
//! 1. The Client asks for a session, sending its public key, its filters and its covered
//!    regions. The RPP answers with a session id, the hash salt encrypted for the Client, the
//!    TPS public key and the intersection of both parties' regions.
//! 2. The Client starts the session. The RPP extracts its own dataset with the same salt.
//! 3. The Client extracts its data, encrypts it with an AES key that only the TPS can unwrap
//!    and sends it to the RPP.
//! 4. Once both halves are ready, the RPP dispatches the session to the TPS, polls it and
//!    relays the encrypted results, which only the Client can decrypt and de-hash.
#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod artifacts;
pub mod bed;
pub mod channel;
pub mod client;
pub mod crypto;
pub mod extractor;
pub mod genotype;
pub mod message;
pub mod record;
pub mod session_id;
pub mod status;
pub mod tps;
pub mod utils;
