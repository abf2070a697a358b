//! Axon Cluster - observation agreement across nodes
//!
//! [`ClusterAggregator`] collects pattern-match reports, decides which
//! patterns enough distinct nodes have observed, and fans similarity
//! queries out to every live peer. Agreement here means "seen by at least
//! N nodes", not ordered writes.
//!
//! The vector index and connection tracking live outside this crate and
//! are reached through [`SearchBackend`] and [`ConnectionTelemetry`].

mod aggregator;
pub mod error;
mod record;
mod search;
mod telemetry;

pub use aggregator::{AggregatorConfig, ClusterAggregator, ClusterHit, ClusterSearch, OBSERVED_BY};
pub use error::{Error, Result};
pub use record::{ClusterPatternRecord, ConsensusReached, PatternIndexed, PatternMatch, PatternMetrics, ReportOutcome};
pub use search::{IndexRef, MemorySearch, SearchBackend, SearchHit};
pub use telemetry::{ClusterConnectionStats, ConnectionSample, ConnectionTelemetry, ShardedConnectionCounters};
