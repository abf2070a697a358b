//! Axon Clock - Hybrid Logical Clocks
//!
//! Every delta, event and signal in an Axon cluster carries a [`Timestamp`]
//! produced by the node's [`Hlc`]. The clock combines wall time with a
//! logical counter, so timestamps stay causally comparable across nodes
//! without a global clock.
//!
//! # Ordering
//!
//! ```text
//! (physical_ms, logical, node_id)   compared lexicographically
//! ```
//!
//! The node id breaks ties between nodes that stamp in the same
//! millisecond with the same counter, which makes the order total.
//!
//! # Merge Rule
//!
//! On every incoming message the receiver calls [`Hlc::update`] with the
//! remote stamp. The returned stamp dominates both the remote stamp and
//! everything the local node issued before, so "happened-before" survives
//! the hop even when wall clocks disagree.

mod hlc;
mod node_id;
mod physical;
mod timestamp;

pub use hlc::Hlc;
pub use node_id::{InvalidNodeId, NodeId};
pub use physical::{ManualClock, PhysicalClock, SystemClock};
pub use timestamp::Timestamp;
