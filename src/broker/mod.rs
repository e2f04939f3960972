pub mod control;
pub mod engine;
pub mod presence;

pub use control::{RpcRequest, RpcResponse};
pub use engine::{BoundEndpoints, Central, CentralHandle};
pub use presence::{ModulePresence, PresenceTracker};

#[cfg(test)]
mod tests;
