//! Wire codec
//!
//! A data-plane frame is `<topic>:<body>`. Decoding always splits at the
//! first `:`, so topics must not contain the delimiter. Bodies are opaque:
//! usually JSON text, sometimes a MIME-style multipart container holding a
//! JSON part plus named binary attachments.

use crate::utils::DecodeError;

/// Separates the topic from the body inside a frame.
pub const DELIMITER: u8 = b':';

const MULTIPART_PREFIX: &str = "multipart/";

/// A decoded data-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.topic, &self.body)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let (topic, body) = split(frame)?;
        Ok(Self::new(topic, body))
    }
}

/// A named binary part carried next to the primary JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub payload: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            payload: payload.into(),
        }
    }
}

/// A multipart message split into its primary payload and attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub topic: String,
    pub json: Vec<u8>,
    pub attachments: Vec<Attachment>,
}

pub fn encode(topic: &str, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(topic.len() + 1 + body.len());
    frame.extend_from_slice(topic.as_bytes());
    frame.push(DELIMITER);
    frame.extend_from_slice(body);
    frame
}

/// Split a frame at the first delimiter.
pub fn split(frame: &[u8]) -> Result<(&str, &[u8]), DecodeError> {
    let idx = frame
        .iter()
        .position(|b| *b == DELIMITER)
        .ok_or(DecodeError::MissingDelimiter)?;
    let topic = std::str::from_utf8(&frame[..idx]).map_err(|_| DecodeError::InvalidTopic)?;
    Ok((topic, &frame[idx + 1..]))
}

/// Topic of a frame, if it has one.
pub fn topic_of(frame: &[u8]) -> Option<&str> {
    split(frame).ok().map(|(topic, _)| topic)
}

/// Whether the frame's body is a multipart container.
pub fn has_attachments(frame: &[u8]) -> bool {
    match split(frame) {
        Ok((_, body)) => multipart_boundary(body).is_some(),
        Err(_) => false,
    }
}

/// Split a multipart frame into topic, primary JSON part and attachments.
pub fn parse_message(frame: &[u8]) -> Result<ParsedMessage, DecodeError> {
    let (topic, body) = split(frame)?;
    let (boundary, content_start) = multipart_boundary(body)
        .ok_or_else(|| DecodeError::Multipart("body is not a multipart container".into()))?;

    let mut json = None;
    let mut attachments = Vec::new();
    for part in split_parts(&body[content_start..], &boundary)? {
        let (headers, payload) = split_headers(part)
            .ok_or_else(|| DecodeError::Multipart("part has no header terminator".into()))?;
        match part_filename(&headers) {
            Some(filename) => {
                if filename.is_empty()
                    || filename.contains('/')
                    || filename.contains('\\')
                    || filename == ".."
                    || filename == "."
                {
                    return Err(DecodeError::Multipart(format!(
                        "unsafe attachment file name {filename:?}"
                    )));
                }
                attachments.push(Attachment::new(filename, payload));
            }
            None if json.is_none() => json = Some(payload.to_vec()),
            None => {}
        }
    }

    let json = json.ok_or_else(|| DecodeError::Multipart("no primary payload part".into()))?;
    Ok(ParsedMessage {
        topic: topic.to_string(),
        json,
        attachments,
    })
}

/// Build a multipart body from a JSON payload and attachments.
pub fn encode_multipart(json: &[u8], attachments: &[Attachment]) -> Vec<u8> {
    let boundary = format!("=={}==", uuid::Uuid::new_v4().simple());
    let mut body = Vec::new();
    body.extend_from_slice(
        format!("Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    body.extend_from_slice(json);
    for attachment in attachments {
        body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        body.extend_from_slice(
            format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n\r\n",
                attachment.filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(&attachment.payload);
    }
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Boundary declared by the body's leading header block, plus the offset
/// where the multipart content starts.
fn multipart_boundary(body: &[u8]) -> Option<(String, usize)> {
    let (headers, rest) = split_headers(body)?;
    let content_type = header(&headers, "content-type")?;
    let (mime, params) = content_type.split_once(';').unwrap_or((content_type, ""));
    if !mime.trim().to_ascii_lowercase().starts_with(MULTIPART_PREFIX) {
        return None;
    }
    let boundary = header_param(params, "boundary")?;
    Some((boundary, body.len() - rest.len()))
}

/// Parse `Name: value` lines up to the first blank line.
fn split_headers(data: &[u8]) -> Option<(Vec<(String, String)>, &[u8])> {
    let mut headers = Vec::new();
    let mut pos = 0;
    loop {
        let end = find(data, b"\n", pos)?;
        let line = trim_cr(&data[pos..end]);
        pos = end + 1;
        if line.is_empty() {
            return Some((headers, &data[pos..]));
        }
        let line = std::str::from_utf8(line).ok()?;
        let (name, value) = line.split_once(':')?;
        if name.is_empty() || name.contains(' ') {
            return None;
        }
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
}

fn split_parts<'a>(content: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, DecodeError> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut pos = find(content, delimiter, 0)
        .ok_or_else(|| DecodeError::Multipart("opening boundary not found".into()))?;

    let mut parts = Vec::new();
    loop {
        pos += delimiter.len();
        if content[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        // skip the rest of the boundary line
        let start = find(content, b"\n", pos)
            .ok_or_else(|| DecodeError::Multipart("truncated boundary line".into()))?
            + 1;
        let next = find_boundary_line(content, delimiter, start)
            .ok_or_else(|| DecodeError::Multipart("closing boundary not found".into()))?;
        parts.push(trim_line_ending(&content[start..next]));
        pos = next;
    }
}

/// Position of the next delimiter that starts a line.
fn find_boundary_line(content: &[u8], delimiter: &[u8], from: usize) -> Option<usize> {
    let mut search = from;
    loop {
        let idx = find(content, delimiter, search)?;
        if idx == from || content[idx - 1] == b'\n' {
            return Some(idx);
        }
        search = idx + 1;
    }
}

fn part_filename(headers: &[(String, String)]) -> Option<String> {
    header(headers, "content-disposition")
        .and_then(|value| header_param(value, "filename"))
        .or_else(|| header(headers, "content-type").and_then(|value| header_param(value, "name")))
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn header_param(value: &str, name: &str) -> Option<String> {
    value.split(';').find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(val.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|idx| idx + from)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_line_ending(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\r\n")
        .or_else(|| data.strip_suffix(b"\n"))
        .unwrap_or(data)
}
