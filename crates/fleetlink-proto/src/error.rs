//! Codec error types.
//!
//! Decode failures are descriptive values, never panics. Receivers at the
//! bus boundary discard malformed payloads after logging; nothing in this
//! crate crosses the bus as an exception.

use thiserror::Error;

use crate::MessageKind;

/// Errors produced by envelope encoding and decoding.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Payload is not parseable as a tagged envelope, or a mandatory
    /// content field is missing.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope parsed, but its `type` tag is not the kind the caller
    /// expected.
    #[error("envelope kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        /// Kind the receiving component declared.
        expected: MessageKind,
        /// Kind actually carried by the payload.
        actual: MessageKind,
    },
}
