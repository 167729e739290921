//! Simulation-side coordinator.
//!
//! The coordinator sits between the traffic simulation and the fleet of
//! remote vehicle runtimes:
//!
//! - the [`NodeLeaseRegistry`] binds each simulated vehicle to one
//!   execution node for its lifetime;
//! - the [`ApiInterpreter`] maps incoming `api_call` envelopes onto the
//!   [`SimulationApi`] trait;
//! - the [`Coordinator`] step loop serves calls between step deadlines,
//!   advances the simulation and broadcasts batched state updates.
//!
//! [`SyntheticSim`] is a scripted in-process [`SimulationApi`]
//! implementation for tests and the demo binary.

mod coordinator;
mod error;
mod interpreter;
mod lease;
mod sim;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::CoordinatorError;
pub use interpreter::{
    ApiInterpreter, SimulationApi, SimulationError, StepSnapshot, StepVehicle, VehicleState,
};
pub use lease::NodeLeaseRegistry;
pub use sim::SyntheticSim;
