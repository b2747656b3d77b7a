//! Shared core library for the corral GPU-container orchestrator.
//!
//! Everything both sides of the wire need lives here: the framed
//! NDJSON protocol, the ticket-correlating [`protocol::client::AsyncClient`],
//! token signing and verification, the cluster config loader, the GPU
//! placement algorithm, and the error taxonomy that maps onto numeric
//! wire codes.

pub mod auth;
pub mod config;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod sched;
pub mod transport;
