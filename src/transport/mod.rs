//! The `transport` module is responsible for the data plane: the wire codec,
//! endpoint resolution, and the WebSocket sockets that move frames between
//! publishers, the broker and subscribers.
//!
//! It defines the framing used on every connection and implements the inlet,
//! outlet and forwarder that together make up the broker's bridge.

pub mod codec;
pub mod endpoint;
pub mod forwarder;
pub mod message;
pub mod outlet;
pub mod websocket;

pub use codec::{Attachment, Message, ParsedMessage};
pub use endpoint::{Endpoint, Port};
pub use forwarder::{Injector, spawn_forwarder};
pub use outlet::{Outlet, SharedOutlet};

#[cfg(test)]
mod tests;
