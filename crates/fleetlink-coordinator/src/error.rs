//! Coordinator error types.

use thiserror::Error;

use crate::SimulationError;

/// Errors raised by the coordinator step loop.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Envelope encode/decode failure.
    #[error(transparent)]
    Proto(#[from] fleetlink_proto::ProtoError),

    /// Transport failure.
    #[error(transparent)]
    Bus(#[from] fleetlink_bus::BusError),

    /// The simulator reported an unrecoverable fault.
    #[error(transparent)]
    Simulation(#[from] SimulationError),

    /// An in-process vehicle runtime could not be started.
    #[error(transparent)]
    Vehicle(#[from] fleetlink_vehicle::VehicleError),
}
