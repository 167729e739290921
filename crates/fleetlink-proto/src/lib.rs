//! Fleetlink wire protocol.
//!
//! Every message crossing the bus is a JSON envelope of the form
//! `{"type": "...", "content": {...}}`. The `type` tag selects one of a
//! closed set of message kinds; the `content` object carries the fixed
//! field set declared for that kind. Decoding is strict: an absent
//! mandatory field or a mismatched tag is an error, never a partial value.
//!
//! The codec is pure and has no I/O dependency. Transports live in
//! `fleetlink-bus`; this crate only defines what travels over them.

mod batch;
mod envelope;
mod error;
pub mod topics;

pub use batch::UpdateBatch;
pub use envelope::{
    ApiCall, ApiCode, ApiReturn, DeleteVehicle, Envelope, MessageKind, NewVehicle, PositionUpdate,
    TimeSync, VehicleData,
};
pub use error::ProtoError;

/// Convenience alias for codec results.
pub type Result<T> = std::result::Result<T, ProtoError>;
