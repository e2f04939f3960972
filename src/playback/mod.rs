//! Playback
//!
//! Re-drives a message log through a live publisher: every record whose
//! topic matches one of the filters is republished unchanged, in log order,
//! exactly as if the module that emitted it were sending it again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::Publisher;
use crate::persistence::log_reader::{LogParser, LogRecord, open_log};
use crate::utils::Result;

/// Time given to the publisher to reach central before the first record.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(100);

const PROGRESS_INTERVAL: usize = 100;

pub struct Playback {
    log_path: PathBuf,
    topics: Vec<String>,
    start_delay: Duration,
}

impl Playback {
    /// `topics` are topic prefixes; an empty list plays everything.
    pub fn new(log_path: impl Into<PathBuf>, topics: Vec<String>) -> Self {
        Self {
            log_path: log_path.into(),
            topics,
            start_delay: DEFAULT_START_DELAY,
        }
    }

    pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// A fresh pass over the log, starting at its first record.
    pub fn records(&self) -> Result<LogParser<std::io::BufReader<std::fs::File>>> {
        Ok(open_log(&self.log_path)?)
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|prefix| topic.starts_with(prefix.as_str()))
    }

    fn selected(&self, record: &LogRecord) -> bool {
        match record.topic() {
            Some(topic) => self.matches(topic),
            None => {
                warn!("skipping logged frame without a topic");
                false
            }
        }
    }

    /// Republish every matching record through `publisher`. Returns the
    /// number of records sent.
    pub async fn run(&self, publisher: &Publisher) -> Result<usize> {
        info!("playing {} topics: {:?}", self.log_path.display(), self.topics);
        tokio::time::sleep(self.start_delay).await;

        let mut sent = 0;
        for record in self.records()? {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("stopping playback: {e}");
                    break;
                }
            };
            if !self.selected(&record) {
                continue;
            }
            publisher.send_frame(record.raw)?;
            sent += 1;
            if sent % PROGRESS_INTERVAL == 0 {
                debug!("played {sent} messages");
            }
        }
        info!("message count: {sent}");
        Ok(sent)
    }
}
