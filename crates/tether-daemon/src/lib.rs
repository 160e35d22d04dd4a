//! Per-host daemon for the tether control mesh.
//!
//! Aggregates every local session endpoint, federates with peer daemons
//! over TCP, and relays RPCs to any reachable session. The binary is
//! `tetherd`; the library surface exists for the client helper and for
//! integration tests that run daemons in-process.

pub mod client;
pub mod daemon;

pub use client::{ClientError, DaemonClient};
