//! Error types for axon-bus.

use thiserror::Error;

/// Result type for axon-bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the event bus.
#[derive(Debug, Error)]
pub enum Error {
    /// A custom topic name failed validation.
    #[error("invalid topic {name:?}: {reason}")]
    InvalidTopic { name: String, reason: &'static str },

    /// Signal intensity (or threshold) outside `[0, 1]` or not a number.
    #[error("intensity {0} is outside [0, 1]")]
    InvalidIntensity(f64),

    /// The bus has been closed; no new subscriptions are accepted.
    #[error("event bus is closed")]
    Closed,

    /// A payload could not be encoded as JSON.
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}
