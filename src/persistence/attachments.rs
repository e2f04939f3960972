//! Attachment extraction
//!
//! Attachments of a multipart message land in
//! `<logDir>/attachments/<date>/<time.micros>/<topic>/<nonce>/<filename>`.
//! The random nonce keeps directories unique even for many messages on the
//! same topic within one microsecond tick.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::transport::codec::ParsedMessage;

pub const ATTACHMENTS_DIR: &str = "attachments";

/// Directory for one message's attachments, relative to the log directory.
pub fn attachment_suffix(now: DateTime<Utc>, topic: &str, nonce: u32) -> PathBuf {
    let topic: String = topic
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect();
    let topic = match topic.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => topic,
    };
    Path::new(ATTACHMENTS_DIR)
        .join(now.format("%Y-%m-%d").to_string())
        .join(now.format("%H-%M-%S%.6f").to_string())
        .join(topic)
        .join(format!("{nonce:08x}"))
}

/// Write every attachment of `parsed` under `log_dir`. Returns the directory
/// suffix the files were written to.
///
/// A failure part-way leaves whatever was already written in place.
pub fn extract(log_dir: &Path, parsed: &ParsedMessage, now: DateTime<Utc>) -> std::io::Result<PathBuf> {
    let suffix = attachment_suffix(now, &parsed.topic, rand::random());
    let dir = log_dir.join(&suffix);
    fs::create_dir_all(&dir)?;
    for attachment in &parsed.attachments {
        fs::write(dir.join(&attachment.filename), &attachment.payload)?;
    }
    Ok(suffix)
}
