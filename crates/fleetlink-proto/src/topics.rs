//! Bus topic layout.
//!
//! Fixed-format topic strings with the vehicle identifier substituted in.
//! The coordinator subscribes to one `apicall/{id}` topic per managed
//! vehicle; each vehicle runtime subscribes to its own `apiresponse/{id}`
//! and `directcomm/{id}` topics.

/// Fleet-wide batched state update, coordinator → fleet manager.
pub const SUMO_UPDATE: &str = "sumo/update";

/// Fleet control signal, fleet manager → coordinator.
pub const COLOSSEUM_UPDATE: &str = "colosseum/update";

/// Prefix shared by all per-vehicle API call topics.
pub const API_CALL_PREFIX: &str = "apicall";

/// Topic a vehicle publishes API calls on.
pub fn api_call(vehicle_id: &str) -> String {
    format!("{API_CALL_PREFIX}/{vehicle_id}")
}

/// Topic the coordinator publishes API responses on.
pub fn api_response(vehicle_id: &str) -> String {
    format!("apiresponse/{vehicle_id}")
}

/// Topic used to relay peer beacons directly in test mode, bypassing the
/// real communication stack.
pub fn direct_comm(vehicle_id: &str) -> String {
    format!("directcomm/{vehicle_id}")
}

/// Extract the vehicle id from an `apicall/{id}` topic, if it is one.
pub fn api_call_vehicle(topic: &str) -> Option<&str> {
    topic.strip_prefix(API_CALL_PREFIX)?.strip_prefix('/')
}
