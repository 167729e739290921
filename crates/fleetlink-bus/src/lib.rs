//! Transports for Fleetlink messages.
//!
//! Two delivery paths exist:
//!
//! - A topic-based publish/subscribe bus behind the [`Bus`] trait. The
//!   in-process [`MemoryBus`] broker implements it for tests and the
//!   self-contained demo; a brokered deployment substitutes its own client
//!   behind the same trait.
//! - A bounded-size unbrokered datagram link ([`UdpLink`]) for low-latency
//!   peer-to-peer beacon delivery, addressed by socket address rather than
//!   topic.
//!
//! Both paths are lossy by design: subscribers with full queues and
//! unreachable datagram peers drop messages. Loss detection is the Link
//! Monitor's job, not the transport's.

mod broker;
mod datagram;
mod error;

pub use broker::{Bus, BusMessage, MemoryBus, Subscription};
pub use datagram::{Datagram, MAX_DATAGRAM, UdpLink};
pub use error::BusError;
