//! Runtime error types.

use thiserror::Error;

/// Errors raised while building or running a vehicle runtime.
#[derive(Debug, Error)]
pub enum VehicleError {
    /// Application parameters are missing a field or carry the wrong type.
    #[error("invalid application parameters: {0}")]
    BadParameters(String),

    /// This vehicle does not appear in the configured platoon formation.
    #[error("vehicle {0} is not part of the formation")]
    NotInFormation(String),

    /// Envelope encode/decode failure.
    #[error(transparent)]
    Proto(#[from] fleetlink_proto::ProtoError),

    /// Transport failure.
    #[error(transparent)]
    Bus(#[from] fleetlink_bus::BusError),

    /// RPC bridge failure.
    #[error(transparent)]
    Rpc(#[from] crate::RpcError),

    /// Append-log I/O failure.
    #[error("log write failed: {0}")]
    Io(#[from] std::io::Error),
}
