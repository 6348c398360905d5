//! HTTP/1.1 wire codec.
//!
//! Request serialization and incremental response parsing (RFC 7230
//! framing). The parser is pull-based: callers feed a growing buffer and
//! get back either a parsed item plus the number of bytes it consumed, or
//! "need more data".

use bytes::{Buf, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};

use crate::base::NetError;

/// Upper bound on the response head (status line + headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Upper bound on a chunk-size line including extensions.
const MAX_CHUNK_LINE: usize = 16 * 1024;

/// Parsed response status line and header section.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body bytes follow the head (HEAD, 1xx, 204, 304).
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Body runs until the server closes the connection.
    UntilEof,
}

/// Serializes a request head: request line, header section, blank line.
pub fn encode_request_head(
    method: &str,
    target: &str,
    headers: &HeaderMap,
    buf: &mut BytesMut,
) {
    buf.extend_from_slice(method.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Serializes one body chunk in chunked transfer coding.
pub fn encode_chunk(data: &[u8], buf: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

/// Serializes the terminal chunk.
pub fn encode_final_chunk(buf: &mut BytesMut) {
    buf.extend_from_slice(b"0\r\n\r\n");
}

/// Attempts to parse a response head from the start of `buf`.
///
/// Returns `Ok(None)` when more data is needed, otherwise the head and the
/// number of bytes it occupies (including the terminating blank line).
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, NetError> {
    let end = match find_double_crlf(buf) {
        Some(end) => end,
        None => {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(NetError::BadMessage("response head too large".into()));
            }
            return Ok(None);
        }
    };

    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| NetError::BadMessage("response head is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| NetError::BadMessage("empty response head".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => {
            return Err(NetError::BadMessage(format!(
                "unsupported protocol token {:?}",
                other
            )))
        }
        None => return Err(NetError::BadMessage("missing protocol token".into())),
    };
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| NetError::BadMessage("invalid status code".into()))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(NetError::BadMessage("obsolete line folding".into()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| NetError::BadMessage(format!("malformed header line {:?}", line)))?;
        let name = HeaderName::from_bytes(name.trim_end().as_bytes())
            .map_err(|_| NetError::BadMessage(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| NetError::BadMessage("invalid header value".into()))?;
        headers.append(name, value);
    }

    Ok(Some((ResponseHead { version, status, reason, headers }, end + 4)))
}

/// Determines how the body of `head` is delimited, for a response to a
/// request with method `method`.
pub fn body_framing(method: &str, head: &ResponseHead) -> Result<BodyFraming, NetError> {
    if method.eq_ignore_ascii_case("HEAD")
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }

    if header_has_token(&head.headers, http::header::TRANSFER_ENCODING, "chunked") {
        return Ok(BodyFraming::Chunked);
    }

    let mut length: Option<u64> = None;
    for value in head.headers.get_all(http::header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| NetError::BadMessage("invalid Content-Length".into()))?;
        match length {
            Some(prev) if prev != parsed => {
                return Err(NetError::BadMessage("conflicting Content-Length".into()))
            }
            _ => length = Some(parsed),
        }
    }
    match length {
        Some(n) => Ok(BodyFraming::Length(n)),
        None => Ok(BodyFraming::UntilEof),
    }
}

/// Whether the connection stays open after this response.
pub fn wants_keep_alive(head: &ResponseHead) -> bool {
    if header_has_token(&head.headers, http::header::CONNECTION, "close") {
        return false;
    }
    if head.version == Version::HTTP_10 {
        return header_has_token(&head.headers, http::header::CONNECTION, "keep-alive");
    }
    true
}

/// True if a comma-separated header contains `token` (case-insensitive).
pub fn header_has_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Incremental decoder for chunked transfer coding.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailer,
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: ChunkState::Size }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Decodes as much of `input` as possible, passing decoded body bytes
    /// to `out`. Returns `Ok(true)` once the terminal chunk and trailer
    /// section have been consumed.
    pub fn decode(
        &mut self,
        input: &mut BytesMut,
        out: &mut dyn FnMut(&[u8]) -> Result<(), NetError>,
    ) -> Result<bool, NetError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let line_end = match find_crlf(input) {
                        Some(pos) => pos,
                        None => {
                            if input.len() > MAX_CHUNK_LINE {
                                return Err(NetError::BadMessage("chunk size line too long".into()));
                            }
                            return Ok(false);
                        }
                    };
                    let size = {
                        let line = std::str::from_utf8(&input[..line_end])
                            .map_err(|_| NetError::BadMessage("invalid chunk size line".into()))?;
                        let hex = line.split(';').next().unwrap_or("").trim();
                        u64::from_str_radix(hex, 16)
                            .map_err(|_| NetError::BadMessage(format!("invalid chunk size {:?}", hex)))?
                    };
                    input.advance(line_end + 2);
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(input.len() as u64) as usize;
                    out(&input[..take])?;
                    input.advance(take);
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data { remaining: left }
                    };
                }
                ChunkState::DataCrlf => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(NetError::BadMessage("missing CRLF after chunk".into()));
                    }
                    input.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let line_end = match find_crlf(input) {
                        Some(pos) => pos,
                        None => {
                            if input.len() > MAX_HEAD_BYTES {
                                return Err(NetError::BadMessage("trailer section too large".into()));
                            }
                            return Ok(false);
                        }
                    };
                    // Trailer headers are consumed and dropped.
                    let empty = line_end == 0;
                    input.advance(line_end + 2);
                    if empty {
                        self.state = ChunkState::Done;
                        return Ok(true);
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_double_crlf(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
