//! Axon CRDT - replicated beliefs, context and metrics
//!
//! Three join-semilattices live here:
//!
//! - [`BeliefSet`]: observed-remove set of belief strings owned by an agent
//! - [`ContextGraph`]: grow-only set of typed edges
//! - [`MetricCounter`]: per-node slot vector, value is the sum of slots
//!
//! Changes travel as [`Delta`]s. Applying a delta is a join, so deltas may
//! be delivered late, out of order or more than once and every replica
//! still converges to the same state.
//!
//! The [`CrdtStore`] owns one supervised worker task per object. Merges to
//! one object serialize through that worker; different objects merge in
//! parallel. Each worker keeps a bounded delta log that replication reads
//! through [`CrdtStore::deltas_since`].

mod belief_set;
mod context_graph;
pub mod delta;
pub mod error;
mod metric_counter;
mod store;
mod worker;

#[cfg(test)]
mod convergence_test;

pub use belief_set::BeliefSet;
pub use context_graph::{ContextGraph, Edge};
pub use delta::{CrdtObject, CrdtOp, CrdtType, Delta, LocalOp, ObjectBatch};
pub use error::{Error, Result};
pub use metric_counter::MetricCounter;
pub use store::{CrdtStore, Created, IntegrityReport, ObjectInfo, StoreStats};
pub use worker::{ObjectSnapshot, RestartPolicy, StateChange, StoreConfig};
