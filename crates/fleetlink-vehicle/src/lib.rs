//! Per-vehicle application runtime.
//!
//! Each simulated vehicle runs one instance of this runtime on its leased
//! execution node (or in-process in test mode). The runtime:
//!
//! - issues synchronous remote API calls over the asynchronous bus through
//!   the [`RpcBridge`];
//! - beacons its own kinematic state to downstream platoon members;
//! - feeds received peer beacons into its [`ControllerPolicy`] and the
//!   [`LinkMonitor`], which degrades the active control strategy when peer
//!   data goes stale and restores it once links recover.
//!
//! The state machines ([`LinkMonitor`], policies) are pure and
//! clock-parameterized; [`VehicleRuntime`] is the async shell that wires
//! them to the transports.

mod error;
mod link;
mod log;
mod policy;
mod rpc;
mod runtime;

pub use error::VehicleError;
pub use link::{
    ControllerMode, DEFAULT_SILENCE_THRESHOLD, LinkMonitor, PeerLinkState, RECOVERY_STREAK,
};
pub use log::PacketLog;
pub use policy::{
    ControllerPolicy, FormationConfig, LeaderPolicy, FollowerPolicy, PolicyAction, Role,
    controller_for_mode,
};
pub use rpc::{RpcBridge, RpcError};
pub use runtime::{VehicleConfig, VehicleHandle, VehicleRuntime};
