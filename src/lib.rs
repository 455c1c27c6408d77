//! # whatsapp-fleet
//!
//! Multi-tenant WhatsApp connection fleet manager: owns up to `MAX_INSTANCES`
//! concurrent protocol sessions, one per tenant, with session state kept in
//! Postgres so the process is stateless across restarts.
//!
//! The two subsystems with the real engineering in them are
//! [`fleet`] (the Instance Lifecycle & Reconnection Coordinator) and
//! [`store::session`] (the Session State Store Adapter backing it). The rest
//! of this crate — HTTP surface, configuration, registry persistence,
//! telemetry — is ambient plumbing around those two.
//!
//! The real WhatsApp wire protocol (Noise handshake, binary XML nodes,
//! Signal double-ratchet) lives behind the `full` feature as
//! [`protocol::real`]; [`protocol::fake`] is the in-memory double the rest
//! of the crate is tested against.

pub mod admission;
pub mod api;
pub mod binary;
pub mod config;
pub mod error;
pub mod fleet;
pub mod pairing;
pub mod protocol;
pub mod socket;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use fleet::Fleet;
pub use types::Jid;
