//! Message log writer
//!
//! The broker appends every frame it taps. Frames with attachments have
//! their binary parts extracted first and are logged as `<topic>:<json>`
//! with the attachment directory in the record header.
//!
//! Failures are logged and swallowed per message: one bad frame or a full
//! disk for one attachment must never stop forwarding or later records.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::persistence::attachments;
use crate::persistence::log_reader::LogRecord;
use crate::transport::codec;
use crate::utils::Result;

/// Token starting every record header.
pub const RECORD_MARKER: &str = "@@@";
/// Attachment directory field of a record without attachments.
pub const NO_ATTACHMENTS: &str = "-";
/// Log file template value that disables a log.
pub const DISABLED: &str = "none";

const TIME_TOKEN: &str = "%s";

/// Resolve a log file template inside `log_dir`, creating the directory.
///
/// A `%s` in the template is replaced by the start time, and a `latest`
/// symlink next to it is re-pointed at the new file.
pub fn ready_log_path(log_dir: &Path, template: &str, now: DateTime<Utc>) -> io::Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    if !template.contains(TIME_TOKEN) {
        return Ok(log_dir.join(template));
    }

    let file_name = template.replace(TIME_TOKEN, &now.format("%Y-%m-%d-%H-%M-%S").to_string());
    let latest = log_dir.join(template.replace(TIME_TOKEN, "latest"));
    if latest.symlink_metadata().is_ok_and(|meta| meta.file_type().is_symlink()) {
        fs::remove_file(&latest)?;
    }
    if let Err(e) = link_latest(&file_name, &latest) {
        warn!("could not link {} to {file_name}: {e}", latest.display());
    }
    Ok(log_dir.join(file_name))
}

#[cfg(unix)]
fn link_latest(file_name: &str, latest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(file_name, latest)
}

#[cfg(not(unix))]
fn link_latest(_file_name: &str, _latest: &Path) -> io::Result<()> {
    Ok(())
}

#[derive(Debug)]
pub struct MessageLog {
    log_dir: PathBuf,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MessageLog {
    /// Open (append) the message log described by `template` in `log_dir`.
    pub fn open(log_dir: &Path, template: &str, now: DateTime<Utc>) -> Result<Self> {
        let path = ready_log_path(log_dir, template, now)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("logging messages to {}", path.display());
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it.
    pub fn append(&mut self, record: &LogRecord) -> io::Result<()> {
        record.write_to(&mut self.writer)?;
        self.writer.flush()
    }

    /// Log a tapped frame. Never fails; problems are reported through tracing.
    pub fn log_message(&mut self, frame: &[u8]) {
        let now = Utc::now();
        if codec::has_attachments(frame) {
            if let Err(e) = self.log_with_attachments(frame, now) {
                warn!(
                    "error while logging message with attachments on {:?}: {e}",
                    codec::topic_of(frame).unwrap_or_default()
                );
            }
        } else if let Err(e) = self.append(&LogRecord::new(now.timestamp_micros(), None, frame.to_vec())) {
            warn!("error while logging message: {e}");
        }
    }

    fn log_with_attachments(&mut self, frame: &[u8], now: DateTime<Utc>) -> Result<()> {
        let parsed = codec::parse_message(frame)?;
        let suffix = attachments::extract(&self.log_dir, &parsed, now)?;
        let raw = codec::encode(&parsed.topic, &parsed.json);
        let record = LogRecord::new(
            now.timestamp_micros(),
            Some(suffix.to_string_lossy().into_owned()),
            raw,
        );
        self.append(&record)?;
        Ok(())
    }

    /// Flush and close the log.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()?;
        info!("closed message log {}", self.path.display());
        Ok(())
    }
}
