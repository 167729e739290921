//! Remote API interpretation.
//!
//! Vehicle runtimes drive the simulator exclusively through `api_call`
//! envelopes; [`ApiInterpreter::serve`] maps each call onto the
//! [`SimulationApi`] trait and wraps the result in an `api_return` that
//! echoes the caller's correlation fields.
//!
//! A call that fails against the simulator (unknown vehicle, malformed
//! parameters) produces no response at all: the failure is logged and the
//! call dropped, matching the lossy-transport contract the runtimes
//! already live with. Only read operations carry data back; mutations
//! answer with the literal success marker `"true"`.

use fleetlink_proto::{ApiCall, ApiCode, ApiReturn, Envelope, VehicleData};
use serde_json::{Value, json};
use thiserror::Error;

/// Failures reported by a [`SimulationApi`] implementation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The addressed vehicle does not exist in the simulation. Recoverable;
    /// vehicles despawn while calls are in flight.
    #[error("unknown vehicle {0}")]
    UnknownVehicle(String),

    /// The simulator itself failed.
    #[error("simulator fault: {0}")]
    Fault(String),
}

/// Kinematic state of one vehicle, as read from the simulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleState {
    /// Acceleration requested by the active controller, m/s^2.
    pub controller_acceleration: f64,
    /// Actual acceleration, m/s^2.
    pub acceleration: f64,
    /// Speed, m/s.
    pub speed: f64,
    /// Simulation time of the sample, seconds.
    pub time: f64,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

/// Position of one vehicle within a step snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StepVehicle {
    /// Simulator identifier.
    pub sumo_id: String,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

/// Result of advancing the simulation by one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSnapshot {
    /// Simulation time after the step, seconds.
    pub time: f64,
    /// Every vehicle present after the step, with its position.
    pub vehicles: Vec<StepVehicle>,
}

/// Simulation-control surface the interpreter dispatches onto.
///
/// The closed set of operations mirrors [`ApiCode`]; implementations wrap
/// a real traffic simulator or, for tests and the demo, the synthetic one.
pub trait SimulationApi: Send {
    /// Read `vehicle`'s current kinematic state.
    fn read_vehicle_state(&mut self, vehicle: &str) -> Result<VehicleState, SimulationError>;

    /// Feed the platoon leader's state into `vehicle`'s controller.
    fn set_leader_data(
        &mut self,
        vehicle: &str,
        data: &VehicleData,
    ) -> Result<(), SimulationError>;

    /// Feed the preceding vehicle's state into `vehicle`'s controller.
    fn set_front_data(&mut self, vehicle: &str, data: &VehicleData)
    -> Result<(), SimulationError>;

    /// Set `vehicle`'s cruise control target speed, m/s.
    fn set_desired_speed(&mut self, vehicle: &str, speed: f64) -> Result<(), SimulationError>;

    /// Switch `vehicle`'s active longitudinal controller.
    fn set_active_controller(
        &mut self,
        vehicle: &str,
        controller: &str,
    ) -> Result<(), SimulationError>;

    /// Advance the simulation by one step.
    fn step(&mut self) -> Result<StepSnapshot, SimulationError>;
}

/// Stateless dispatcher from `api_call` envelopes onto a [`SimulationApi`].
#[derive(Debug)]
pub struct ApiInterpreter;

impl ApiInterpreter {
    /// Serve one call. Returns the response to publish, or `None` when the
    /// call was dropped.
    pub fn serve<S: SimulationApi>(api: &mut S, call: &ApiCall) -> Option<ApiReturn> {
        let response = match Self::dispatch(api, call) {
            Ok(response) => response,
            Err(error) => {
                // Dropped, not failed: the caller sees a lost response,
                // which it must already tolerate on this transport
                tracing::warn!(
                    vehicle = %call.sumo_id,
                    api_code = %call.api_code,
                    transaction_id = call.transaction_id,
                    %error,
                    "dropping API call"
                );
                return None;
            },
        };

        Some(ApiReturn {
            sumo_id: call.sumo_id.clone(),
            api_code: call.api_code,
            transaction_id: call.transaction_id,
            response,
        })
    }

    fn dispatch<S: SimulationApi>(api: &mut S, call: &ApiCall) -> Result<Value, ServeError> {
        match call.api_code {
            ApiCode::ReadState => {
                let vehicle = call
                    .parameters
                    .as_str()
                    .ok_or_else(|| ServeError::parameters("vehicle id string expected"))?;
                let state = api.read_vehicle_state(vehicle)?;

                // The response is a complete vehicle_data envelope, ready
                // to be re-sent as a beacon
                let envelope = Envelope::VehicleData(VehicleData {
                    sumo_id: vehicle.to_owned(),
                    controller_acceleration: state.controller_acceleration,
                    acceleration: state.acceleration,
                    speed: state.speed,
                    time: state.time,
                    x: state.x,
                    y: state.y,
                    sender: vehicle.to_owned(),
                    recipient: None,
                    ts: None,
                    seqn: None,
                });
                Ok(serde_json::to_value(envelope).map_err(ServeError::Malformed)?)
            },
            ApiCode::LeaderData => {
                let data = peer_data(&call.parameters)?;
                api.set_leader_data(&call.sumo_id, &data)?;
                Ok(success())
            },
            ApiCode::FrontData => {
                let data = peer_data(&call.parameters)?;
                api.set_front_data(&call.sumo_id, &data)?;
                Ok(success())
            },
            ApiCode::DesiredSpeed => {
                let speed = call
                    .parameters
                    .get("speed")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| ServeError::parameters("numeric speed expected"))?;
                api.set_desired_speed(&call.sumo_id, speed)?;
                Ok(success())
            },
            ApiCode::ActiveController => {
                let controller = call
                    .parameters
                    .get("controller")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServeError::parameters("controller name expected"))?;
                api.set_active_controller(&call.sumo_id, controller)?;
                Ok(success())
            },
        }
    }
}

fn peer_data(parameters: &Value) -> Result<VehicleData, ServeError> {
    serde_json::from_value(parameters.clone()).map_err(ServeError::Malformed)
}

fn success() -> Value {
    json!("true")
}

/// Why a call was dropped. Internal to the interpreter; callers only see
/// the absence of a response.
#[derive(Debug, Error)]
enum ServeError {
    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("malformed parameters: {0}")]
    Malformed(serde_json::Error),

    #[error("malformed parameters: {0}")]
    Parameters(String),
}

impl ServeError {
    fn parameters(message: &str) -> Self {
        Self::Parameters(message.to_owned())
    }
}
