//! Error types for axon-crdt.

use thiserror::Error;

use crate::CrdtType;

/// Result type for axon-crdt operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mutating or merging CRDT objects.
#[derive(Debug, Error)]
pub enum Error {
    /// The id is already bound to a different CRDT type. The object is
    /// left untouched.
    #[error("type conflict on {id:?}: object is a {existing}, operation targets a {requested}")]
    TypeConflict {
        id: String,
        existing: CrdtType,
        requested: CrdtType,
    },

    /// No object with this id exists on this node.
    #[error("no CRDT object named {0:?}")]
    NotFound(String),

    /// The operation is well-typed but not applicable.
    #[error("invalid operation on {id:?}: {reason}")]
    InvalidOp { id: String, reason: String },

    /// The object's worker stopped (restart budget exhausted or shut down).
    #[error("worker for {0:?} is gone")]
    WorkerGone(String),

    /// Delta encoding or decoding failed.
    #[error("delta codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
