//! Axon Bus - causally stamped publish/subscribe
//!
//! Every event published on the bus carries an HLC [`Timestamp`] from the
//! node's clock, so consumers on any node can order what happened without a
//! global clock.
//!
//! # Delivery
//!
//! ```text
//!              publish(topic, payload)
//!                       │
//!              ┌────────┴────────┐   stamp with HLC, wrap in Arc<Event>
//!              ▼                 ▼
//!        ┌──────────┐      ┌──────────┐
//!        │  inbox A │      │  inbox B │   bounded ordinary lane
//!        │ [prio ]  │      │ [prio ]  │   unbounded algedonic lane
//!        │ [ordin]  │      │ [ordin]  │
//!        └──────────┘      └──────────┘
//! ```
//!
//! Fan-out never waits on a consumer: pushing into an inbox is O(1). A full
//! ordinary lane drops its oldest event. The algedonic lane is never
//! dropped and is always drained first, which is how the
//! [`AlgedonicEscalator`] bypasses backlog.
//!
//! # Topics
//!
//! Topics are an explicit [`Topic`] enum with a validated
//! [`Topic::Custom`] escape hatch; validation happens when subscribing.

pub mod algedonic;
mod bus;
pub mod error;
mod event;
mod inbox;
mod topic;

pub use algedonic::{AlgedonicEscalator, AlgedonicSignal, Escalation, EscalatorConfig, EscalatorStats, SignalKind};
pub use bus::{BusConfig, BusStats, EventBus, Subscriber, SubscriberId};
pub use error::{Error, Result};
pub use event::{Event, EventId, Priority};
pub use topic::{Subsystem, Topic};

pub use axon_clock::{Hlc, NodeId, Timestamp};
