//! Axon Sync - safety-gated replication between nodes
//!
//! The [`SyncMonitor`] keeps a table of peers, pings them, and exchanges
//! CRDT deltas with every reachable one. Replication is off until
//! [`SyncMonitor::enable_sync`] passes a safety check (enough live peers,
//! a sane clock, a store that verifies).
//!
//! # Exchange
//!
//! ```text
//!   requester                                responder
//!   ─────────                                ─────────
//!   push: deltas past outbound cursors  ──►  merge, ack per object
//!   inbound cursors                     ──►  deltas past those cursors
//!   merge, advance inbound cursors      ◄──  acks + batches
//! ```
//!
//! Merges are joins, so a lost ack or a cancelled round only causes
//! re-delivery, never divergence.
//!
//! Transport and discovery are trait seams ([`PeerTransport`],
//! [`Discovery`]); [`MemoryNetwork`] wires nodes together in-process.

mod config;
pub mod error;
mod monitor;
mod peer;
pub mod protocol;
mod report;
mod transport;

pub use config::SyncConfig;
pub use error::{Error, Result, SafetyViolation};
pub use monitor::SyncMonitor;
pub use peer::{Peer, PeerInfo, PeerState, Transition};
pub use protocol::{ExchangeRequest, ExchangeResponse, SyncRequest, SyncResponse};
pub use report::{
    HealthLevel, HealthStatus, PeerCounts, PeerOutcome, SyncEvent, SyncMetrics, SyncSummary, TestSyncReport,
};
pub use transport::{Discovery, MemoryNetwork, MemoryTransport, PeerTransport, RequestHandler, StaticDiscovery};
