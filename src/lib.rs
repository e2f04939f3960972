//! # centralbus
//!
//! `centralbus` is a central message bus for a set of cooperating processes
//! ("modules"). Central rebroadcasts every message from any publisher to all
//! subscribers, tracks which modules are alive from their heartbeats, keeps a
//! durable log of all traffic and answers queries on a small request/reply
//! channel.
//!
//! ## Core Modules
//!
//! - `broker`: central itself: forwarding, presence tracking and the control plane.
//! - `client`: the `Publisher`, `Subscriber` and `ControlClient` every module uses.
//! - `config`: loading layered configuration.
//! - `persistence`: the length-delimited message log and attachment extraction.
//! - `playback`: re-driving a message log through a live publisher.
//! - `transport`: the wire codec, endpoints and the WebSocket sockets.
//! - `utils`: error types, logging setup and shared helpers.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod playback;
pub mod transport;
pub mod utils;
