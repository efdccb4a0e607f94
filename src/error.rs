//! Error types for the codec and queueing layers.
//!
//! Transport-level failures inside the drivers are deliberately *not*
//! represented here: they are logged and absorbed (a lost satellite link is
//! recovered by reconnecting, not by propagating an error through the stack).

use thiserror::Error;

/// Errors raised while compiling schemas or encoding / decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Schema compilation failed (missing required option, bad bounds, ...).
    #[error("schema error: {0}")]
    Schema(String),

    /// A field selected a codec that is not registered for its wire type.
    #[error("no codec named {name:?} registered for wire type {wire_type}")]
    CodecNotFound { wire_type: &'static str, name: String },

    /// An encode-side value violation that cannot be represented as "absent".
    #[error("bad value for field {field:?}: {reason}")]
    BadFieldValue { field: String, reason: String },

    /// A decode-side length / CRC / structural mismatch.
    #[error("bad packet: {0}")]
    BadPacket(String),

    /// The encoded frame exceeds the configured maximum.
    #[error("encoded frame is {got} bytes, configured maximum is {limit}")]
    FrameTooLong { got: usize, limit: usize },
}

/// Errors raised by the queue layer.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Push rejected: the queue is at capacity and drops newest.
    #[error("queue {name:?} is full ({size} messages)")]
    QueueFull { name: String, size: usize },

    /// No queue is bound to the dispatch key.
    #[error("no queue for key {key}")]
    NoSuchQueue { key: String },

    /// A queue is already registered under this key.
    #[error("duplicate queue key {key}")]
    DuplicateKey { key: String },

    /// The queue id does not fit the id space of its kind.
    #[error("queue id {id} is too large for {kind} (maximum {max})")]
    IdTooLarge {
        kind: &'static str,
        id: u32,
        max: u32,
    },

    /// Encoding the pushed record failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
