//! The `persistence` module implements the durable message log.
//!
//! Every tapped frame is appended as one length-delimited record. Binary
//! attachments are written to a side directory and the record points at it,
//! so large payloads never bloat the primary log. The same record format is
//! read back by the subscriber replay and by the playback tool.

pub mod attachments;
pub mod log_reader;
pub mod message_log;

pub use log_reader::{LogParser, LogRecord, open_log};
pub use message_log::{MessageLog, NO_ATTACHMENTS, RECORD_MARKER, ready_log_path};
