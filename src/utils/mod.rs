//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `centralbus` crate.
//!
//! It centralizes the error types, logging setup, daemonizing and a few
//! small helpers shared by the broker and the client library.

pub mod daemon;
pub mod error;
pub mod logging;

use std::sync::{Mutex, MutexGuard};

pub use error::{BusError, DecodeError, Result};

/// Current time in microseconds since the UNIX epoch.
///
/// This is the resolution used for log records, heartbeat deadlines and
/// message timestamps.
pub fn timestamp_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host name up to the first dot, as advertised in heartbeats.
pub fn short_host_name() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => {
            let name = name.to_string_lossy();
            name.split('.').next().unwrap_or_default().to_string()
        }
        Err(_) => "localhost".to_string(),
    }
}
