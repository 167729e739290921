//! Transport error types.

use thiserror::Error;

/// Errors surfaced by bus and datagram transports.
///
/// A failed publish is reported to the caller and nothing else; retries,
/// if any, belong to the calling component.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker or socket is no longer reachable.
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// Datagram payload exceeds the bounded transport size.
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Transport limit.
        max: usize,
    },

    /// Underlying socket error.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
