//! Wire messages exchanged between sync monitors.
//!
//! An exchange is one request/response pair. The requester pushes the
//! deltas it believes the responder lacks and sends the cursors of what it
//! already received from the responder; the responder merges, acknowledges
//! and answers with everything past those cursors.
//!
//! Cursors are versions in the *sender's* per-object delta log, so each
//! side only ever tracks positions in logs it does not own.

use std::collections::BTreeMap;

use axon_clock::{NodeId, Timestamp};
use axon_crdt::ObjectBatch;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-object positions in one peer's delta logs.
pub type Cursors = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncRequest {
    Ping { from: NodeId, hlc: Timestamp },
    Exchange(ExchangeRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub from: NodeId,
    pub hlc: Timestamp,
    /// Deltas from the requester's logs.
    pub batches: Vec<ObjectBatch>,
    /// What the requester already holds of the responder's logs.
    pub cursors: Cursors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    Pong { from: NodeId, hlc: Timestamp },
    Exchange(ExchangeResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub from: NodeId,
    pub hlc: Timestamp,
    /// Positions in the requester's logs the responder has now merged.
    pub acked: Cursors,
    /// Deltas from the responder's logs past the requester's cursors.
    pub batches: Vec<ObjectBatch>,
}

impl SyncRequest {
    pub fn sender(&self) -> &NodeId {
        match self {
            Self::Ping { from, .. } => from,
            Self::Exchange(req) => &req.from,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl SyncResponse {
    pub fn sender(&self) -> &NodeId {
        match self {
            Self::Pong { from, .. } => from,
            Self::Exchange(resp) => &resp.from,
        }
    }

    pub fn hlc(&self) -> &Timestamp {
        match self {
            Self::Pong { hlc, .. } => hlc,
            Self::Exchange(resp) => &resp.hlc,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Count the deltas carried by a set of batches.
pub(crate) fn delta_count(batches: &[ObjectBatch]) -> usize {
    batches.iter().map(|b| b.deltas.len()).sum()
}
