//! Tagged message envelopes.
//!
//! One variant per message kind, each with a fixed, statically-typed field
//! set. The serde representation is adjacently tagged so the wire shape is
//! exactly `{"type": "...", "content": {...}}`.
//!
//! # Invariants
//!
//! - The `type` tag is immutable per kind; [`Envelope::kind`] is derived
//!   from the variant, never stored separately.
//! - [`Envelope::decode`] returns the envelope only if the tag matches the
//!   expected kind and every mandatory content field is present. On any
//!   failure the caller gets an error and no partial value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtoError, Result};

/// Discriminant of an [`Envelope`], matching the wire `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Remote API invocation from a vehicle runtime.
    ApiCall,
    /// Response to an [`MessageKind::ApiCall`].
    ApiReturn,
    /// Kinematic state report, used both as API payload and as peer beacon.
    VehicleData,
    /// A vehicle appeared in the simulation and was bound to a node.
    NewVehicle,
    /// A vehicle left the simulation and its node was released.
    DeleteVehicle,
    /// Per-step position report for one leased node.
    PositionUpdate,
    /// Current simulation time.
    Time,
    /// Fleet manager signal: begin stepping.
    StartSimulation,
    /// Fleet manager signal: terminate the run.
    StopSimulation,
}

impl MessageKind {
    /// Wire name of this kind (the `type` tag value).
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::ApiCall => "api_call",
            Self::ApiReturn => "api_return",
            Self::VehicleData => "vehicle_data",
            Self::NewVehicle => "new_vehicle",
            Self::DeleteVehicle => "delete_vehicle",
            Self::PositionUpdate => "update_position",
            Self::Time => "time",
            Self::StartSimulation => "start_simulation",
            Self::StopSimulation => "stop_simulation",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Simulation-control operations a vehicle runtime may invoke remotely.
///
/// Closed set; the interpreter dispatches on this tag and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiCode {
    /// Read the calling vehicle's current kinematic state.
    ReadState,
    /// Push the platoon leader's kinematic state into the controller.
    LeaderData,
    /// Push the preceding vehicle's kinematic state into the controller.
    FrontData,
    /// Set the cruise controller's desired speed.
    DesiredSpeed,
    /// Switch the active longitudinal controller.
    ActiveController,
}

impl std::fmt::Display for ApiCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadState => "read_state",
            Self::LeaderData => "leader_data",
            Self::FrontData => "front_data",
            Self::DesiredSpeed => "desired_speed",
            Self::ActiveController => "active_controller",
        };
        f.write_str(name)
    }
}

/// Content of an `api_call` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    /// Calling vehicle's simulator identifier.
    pub sumo_id: String,
    /// Operation to invoke.
    pub api_code: ApiCode,
    /// Correlation id, unique among the caller's outstanding calls.
    pub transaction_id: u64,
    /// Operation-specific parameters, opaque to the transport.
    pub parameters: Value,
}

/// Content of an `api_return` envelope.
///
/// `sumo_id`, `api_code` and `transaction_id` are echoed from the call
/// unchanged so the bridge can correlate the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReturn {
    /// Vehicle the call originated from.
    pub sumo_id: String,
    /// Operation that was invoked.
    pub api_code: ApiCode,
    /// Correlation id from the call.
    pub transaction_id: u64,
    /// Serialized result, or the literal success marker `"true"`.
    pub response: Value,
}

/// Content of a `vehicle_data` envelope.
///
/// The optional tail fields (`recipient`, `ts`, `seqn`) are present only
/// when the message is used as a peer beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleData {
    /// Vehicle the data describes.
    pub sumo_id: String,
    /// Acceleration requested by the active controller, m/s^2.
    pub controller_acceleration: f64,
    /// Actual acceleration, m/s^2.
    pub acceleration: f64,
    /// Speed, m/s.
    pub speed: f64,
    /// Simulation time the sample was taken at, seconds.
    pub time: f64,
    /// X coordinate in simulator space.
    pub x: f64,
    /// Y coordinate in simulator space.
    pub y: f64,
    /// Vehicle that sent this sample.
    pub sender: String,
    /// Intended receiver, set on beacons only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Sender wall-clock timestamp, set on beacons only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    /// Per-sender beacon sequence number, set on beacons only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seqn: Option<u64>,
}

/// Content of a `new_vehicle` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVehicle {
    /// Simulator identifier of the spawned vehicle.
    pub sumo_id: String,
    /// Execution node leased to it.
    pub colosseum_id: u32,
    /// Application the node should instantiate; `null` in test mode, where
    /// the coordinator hosts the runtimes itself.
    pub application: Option<String>,
    /// Application parameters forwarded verbatim.
    pub parameters: Option<Value>,
}

/// Content of a `delete_vehicle` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteVehicle {
    /// Simulator identifier of the despawned vehicle.
    pub sumo_id: String,
    /// Execution node returned to the free pool.
    pub colosseum_id: u32,
}

/// Content of an `update_position` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    /// Node whose position changed.
    pub colosseum_id: u32,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Coordinate reference system authority code, `null` for plain x-y.
    pub crs: Option<String>,
}

/// Content of a `time` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSync {
    /// Current simulation time, seconds.
    pub time: f64,
}

/// A message crossing the bus: one variant per wire kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Envelope {
    /// Remote API invocation.
    ApiCall(ApiCall),
    /// API response.
    ApiReturn(ApiReturn),
    /// Kinematic state sample or peer beacon.
    VehicleData(VehicleData),
    /// Vehicle spawned.
    NewVehicle(NewVehicle),
    /// Vehicle despawned.
    DeleteVehicle(DeleteVehicle),
    /// Node position changed.
    #[serde(rename = "update_position")]
    PositionUpdate(PositionUpdate),
    /// Simulation time report.
    Time(TimeSync),
    /// Begin stepping.
    StartSimulation {},
    /// Terminate the run.
    StopSimulation {},
}

impl Envelope {
    /// Kind carried by this envelope's `type` tag.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ApiCall(_) => MessageKind::ApiCall,
            Self::ApiReturn(_) => MessageKind::ApiReturn,
            Self::VehicleData(_) => MessageKind::VehicleData,
            Self::NewVehicle(_) => MessageKind::NewVehicle,
            Self::DeleteVehicle(_) => MessageKind::DeleteVehicle,
            Self::PositionUpdate(_) => MessageKind::PositionUpdate,
            Self::Time(_) => MessageKind::Time,
            Self::StartSimulation {} => MessageKind::StartSimulation,
            Self::StopSimulation {} => MessageKind::StopSimulation,
        }
    }

    /// Encode the envelope to its JSON wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope of any kind.
    ///
    /// Fails if the payload is not a well-formed tagged envelope or a
    /// mandatory field of the tagged kind is missing.
    pub fn decode_any(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode an envelope, requiring it to be of `expected` kind.
    pub fn decode(bytes: &[u8], expected: MessageKind) -> Result<Self> {
        let envelope = Self::decode_any(bytes)?;
        let actual = envelope.kind();
        if actual != expected {
            return Err(ProtoError::KindMismatch { expected, actual });
        }
        Ok(envelope)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn beacon() -> VehicleData {
        VehicleData {
            sumo_id: "v.0".into(),
            controller_acceleration: 0.5,
            acceleration: 0.4,
            speed: 20.0,
            time: 12.3,
            x: 100.25,
            y: -3.5,
            sender: "v.0".into(),
            recipient: Some("v.1".into()),
            ts: Some(1_700_000_000.0),
            seqn: Some(7),
        }
    }

    #[test]
    fn wire_shape_is_type_plus_content() {
        let envelope = Envelope::Time(TimeSync { time: 4.5 });
        let bytes = envelope.encode().unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(raw["type"], "time");
        assert_eq!(raw["content"]["time"], 4.5);
    }

    #[test]
    fn empty_content_kinds_round_trip() {
        for envelope in [Envelope::StartSimulation {}, Envelope::StopSimulation {}] {
            let bytes = envelope.encode().unwrap();
            let parsed = Envelope::decode(&bytes, envelope.kind()).unwrap();
            assert_eq!(parsed, envelope);
        }
    }

    #[test]
    fn beacon_round_trip_preserves_optional_fields() {
        let envelope = Envelope::VehicleData(beacon());
        let bytes = envelope.encode().unwrap();
        let parsed = Envelope::decode(&bytes, MessageKind::VehicleData).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn decode_rejects_wrong_kind() {
        let call = Envelope::ApiCall(ApiCall {
            sumo_id: "v.0".into(),
            api_code: ApiCode::ReadState,
            transaction_id: 1,
            parameters: Value::Null,
        });
        let bytes = call.encode().unwrap();

        let err = Envelope::decode(&bytes, MessageKind::VehicleData).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::KindMismatch {
                expected: MessageKind::VehicleData,
                actual: MessageKind::ApiCall,
            }
        ));
    }

    #[test]
    fn decode_rejects_missing_mandatory_field() {
        // vehicle_data without "sender"
        let payload = serde_json::json!({
            "type": "vehicle_data",
            "content": {
                "sumo_id": "v.0",
                "controller_acceleration": 0.0,
                "acceleration": 0.0,
                "speed": 10.0,
                "time": 1.0,
                "x": 0.0,
                "y": 0.0,
            }
        });
        let bytes = serde_json::to_vec(&payload).unwrap();

        assert!(matches!(
            Envelope::decode(&bytes, MessageKind::VehicleData),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode_any(b"not json at all").is_err());
        assert!(Envelope::decode_any(b"{\"type\": \"no_such_kind\", \"content\": {}}").is_err());
    }

    #[test]
    fn nullable_fields_are_still_mandatory_keys() {
        let envelope = Envelope::NewVehicle(NewVehicle {
            sumo_id: "v.2".into(),
            colosseum_id: 9,
            application: None,
            parameters: None,
        });
        let bytes = envelope.encode().unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        // Keys present, values null
        assert!(raw["content"].get("application").is_some_and(serde_json::Value::is_null));
        assert!(raw["content"].get("parameters").is_some_and(serde_json::Value::is_null));

        let parsed = Envelope::decode(&bytes, MessageKind::NewVehicle).unwrap();
        assert_eq!(parsed, envelope);
    }
}
