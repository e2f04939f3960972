//! The `client` module is the library every module links against to take
//! part in the bus.
//!
//! It provides the `Publisher` (heartbeats plus message emission), the
//! `Subscriber` (prefix routing with reference-counted transport
//! subscriptions and log replay) and the `ControlClient` for central's
//! request/reply channel.

pub mod control_client;
pub mod publisher;
pub mod subscriber;

pub use control_client::ControlClient;
pub use publisher::Publisher;
pub use subscriber::{HandlerId, ReplayStats, Subscriber};
