//! Log record format and parser
//!
//! A record is `@@@ <timestamp> <length> <attachmentDir> ` followed by exactly
//! `length` raw bytes and a newline. The raw bytes may contain newlines or
//! anything resembling a header; the length field is what delimits them.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use crate::persistence::message_log::{NO_ATTACHMENTS, RECORD_MARKER};
use crate::transport::codec::{self, Message};
use crate::utils::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Microseconds since the UNIX epoch.
    pub timestamp: i64,
    pub length: usize,
    pub attachment_dir: Option<String>,
    pub raw: Vec<u8>,
}

impl LogRecord {
    pub fn new(timestamp: i64, attachment_dir: Option<String>, raw: Vec<u8>) -> Self {
        Self {
            timestamp,
            length: raw.len(),
            attachment_dir,
            raw,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        codec::topic_of(&self.raw)
    }

    pub fn message(&self) -> Result<Message, DecodeError> {
        Message::decode(&self.raw)
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let dir = self.attachment_dir.as_deref().unwrap_or(NO_ATTACHMENTS);
        write!(out, "{RECORD_MARKER} {} {} {dir} ", self.timestamp, self.raw.len())?;
        out.write_all(&self.raw)?;
        out.write_all(b"\n")
    }
}

/// Lazy iterator over the records of a log. Parsing stops at the first
/// malformed record, which is reported as an error item.
pub struct LogParser<R> {
    reader: R,
    offset: u64,
    done: bool,
}

impl<R: BufRead> LogParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            done: false,
        }
    }

    fn fail(&mut self, offset: u64, reason: impl Into<String>) -> DecodeError {
        self.done = true;
        DecodeError::LogRecord {
            offset,
            reason: reason.into(),
        }
    }

    /// Read up to and excluding the next space. `None` at a clean EOF.
    fn field(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b' ', &mut buf)?;
        self.offset += n as u64;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b' ') {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated header"));
        }
        buf.pop();
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "header is not utf-8"))
    }

    fn next_record(&mut self) -> Result<Option<LogRecord>, DecodeError> {
        let start = self.offset;
        let marker = match self.field() {
            Ok(Some(marker)) => marker,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.fail(start, e.to_string())),
        };
        if marker != RECORD_MARKER {
            return Err(self.fail(start, format!("expected {RECORD_MARKER:?}, found {marker:?}")));
        }

        let mut fields = Vec::with_capacity(3);
        for _ in 0..3 {
            match self.field() {
                Ok(Some(field)) => fields.push(field),
                Ok(None) => return Err(self.fail(start, "truncated header")),
                Err(e) => return Err(self.fail(start, e.to_string())),
            }
        }
        let timestamp: i64 = fields[0]
            .parse()
            .map_err(|_| self.fail(start, format!("bad timestamp {:?}", fields[0])))?;
        let length: usize = fields[1]
            .parse()
            .map_err(|_| self.fail(start, format!("bad length {:?}", fields[1])))?;
        let attachment_dir = match fields[2].as_str() {
            NO_ATTACHMENTS => None,
            dir => Some(dir.to_string()),
        };

        // never trust the header length for allocation
        let mut raw = Vec::new();
        if let Err(e) = (&mut self.reader).take(length as u64).read_to_end(&mut raw) {
            return Err(self.fail(start, format!("unreadable payload: {e}")));
        }
        if raw.len() != length {
            return Err(self.fail(
                start,
                format!("truncated payload: {} of {length} bytes", raw.len()),
            ));
        }
        let mut newline = [0u8; 1];
        if self.reader.read_exact(&mut newline).is_err() || newline[0] != b'\n' {
            return Err(self.fail(start, "missing record terminator"));
        }
        self.offset += length as u64 + 1;

        Ok(Some(LogRecord {
            timestamp,
            length,
            attachment_dir,
            raw,
        }))
    }
}

impl<R: BufRead> Iterator for LogParser<R> {
    type Item = Result<LogRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Open a log file for parsing. Every call starts from the beginning.
pub fn open_log(path: impl AsRef<Path>) -> io::Result<LogParser<BufReader<File>>> {
    Ok(LogParser::new(BufReader::new(File::open(path)?)))
}
