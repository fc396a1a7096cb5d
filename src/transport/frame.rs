//! Wire framing: `TAG MSGID LEN\r\n<payload>END\r\n`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Longest header line accepted before its `\r\n`.
pub const MAX_HEADER_LINE: usize = 80;

const TRAILER: &[u8] = b"END\r\n";

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTag {
    /// Opens a message; payload is the JSON header.
    Header,
    /// A chunk of message body.
    Data,
    /// Normal end of a message; payload is empty.
    Eof,
    /// Abnormal end of a message; payload is the error text.
    Txerr,
    /// Cumulative count of body bytes the receiver has consumed.
    Ack,
}

impl FrameTag {
    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameTag::Header => "HEADER",
            FrameTag::Data => "DATA",
            FrameTag::Eof => "EOF",
            FrameTag::Txerr => "TXERR",
            FrameTag::Ack => "ACK",
        }
    }

    /// Parse a wire token. Matching is exact and case-sensitive.
    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"HEADER" => Some(FrameTag::Header),
            b"DATA" => Some(FrameTag::Data),
            b"EOF" => Some(FrameTag::Eof),
            b"TXERR" => Some(FrameTag::Txerr),
            b"ACK" => Some(FrameTag::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub tag: FrameTag,
    /// Message id, scoped to the sending direction.
    pub id: u64,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame.
    pub fn new(tag: FrameTag, id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            id,
            payload: payload.into(),
        }
    }

    /// Bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.tag, self.id, self.payload.len())
    }
}

/// Framing violations. All of them are fatal to the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// No `\r\n` within the header line bound.
    #[error("header line exceeds {MAX_HEADER_LINE} bytes")]
    HeaderTooLong,
    /// Header line is not `TAG ID LEN`.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    /// Tag token is not one of the known kinds.
    #[error("unknown frame tag: {0:?}")]
    UnknownTag(String),
    /// A numeric field is not canonical decimal.
    #[error("non-canonical {field}: {value:?}")]
    NonCanonical {
        /// `id` or `length`.
        field: &'static str,
        /// Offending text.
        value: String,
    },
    /// Declared payload exceeds the configured maximum.
    #[error("frame too large: max {max} got {len}")]
    TooLarge {
        /// Configured maximum.
        max: usize,
        /// Declared length.
        len: usize,
    },
    /// The five bytes after the payload are not `END\r\n`.
    #[error("missing END trailer")]
    MissingTrailer,
    /// Stream ended inside a frame.
    #[error("stream ended mid-frame with {0} bytes buffered")]
    Truncated(usize),
}

/// Parse a canonical non-negative decimal: no sign, no leading zeros, not empty.
pub fn parse_canonical(field: &'static str, text: &[u8]) -> Result<u64, FrameError> {
    let bad = || FrameError::NonCanonical {
        field,
        value: String::from_utf8_lossy(text).into_owned(),
    };
    if text.is_empty() || !text.iter().all(u8::is_ascii_digit) {
        return Err(bad());
    }
    if text.len() > 1 && text[0] == b'0' {
        return Err(bad());
    }
    // digits only, so utf8 cannot fail; overflow is the remaining case
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(bad)
}

fn encoded_len(tag: FrameTag, id: u64, len: usize) -> usize {
    let digits = |mut n: u64| {
        let mut d = 1;
        while n >= 10 {
            n /= 10;
            d += 1;
        }
        d
    };
    tag.as_str().len() + 1 + digits(id) + 1 + digits(len as u64) + 2 + len + TRAILER.len()
}

/// Append one encoded frame to `dst`.
pub fn encode(tag: FrameTag, id: u64, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(encoded_len(tag, id, payload.len()));
    dst.put_slice(format!("{} {} {}\r\n", tag.as_str(), id, payload.len()).as_bytes());
    dst.put_slice(payload);
    dst.put_slice(TRAILER);
}

/// Incremental decoder. Feed bytes with [`FrameDecoder::extend`] and peel
/// frames with [`FrameDecoder::next_frame`] until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Decoder rejecting payloads above `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Read buffer, for reading straight from an `AsyncRead`.
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let search = &self.buf[..self.buf.len().min(MAX_HEADER_LINE + 2)];
        let line_end = match search.windows(2).position(|w| w == b"\r\n") {
            Some(pos) if pos <= MAX_HEADER_LINE => pos,
            Some(_) => return Err(FrameError::HeaderTooLong),
            None if self.buf.len() > MAX_HEADER_LINE + 1 => {
                return Err(FrameError::HeaderTooLong)
            }
            None => return Ok(None),
        };

        let (tag, id, len) = self.parse_header(&self.buf[..line_end])?;
        let body_start = line_end + 2;
        let total = body_start + len + TRAILER.len();
        if self.buf.len() < total {
            return Ok(None);
        }
        if &self.buf[body_start + len..total] != TRAILER {
            return Err(FrameError::MissingTrailer);
        }

        self.buf.advance(body_start);
        let payload = self.buf.split_to(len).freeze();
        self.buf.advance(TRAILER.len());
        Ok(Some(Frame { tag, id, payload }))
    }

    fn parse_header(&self, line: &[u8]) -> Result<(FrameTag, u64, usize), FrameError> {
        let mut parts = line.split(|b| *b == b' ');
        let (Some(tag), Some(id), Some(len), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(FrameError::MalformedHeader(
                String::from_utf8_lossy(line).into_owned(),
            ));
        };
        let tag = FrameTag::parse(tag)
            .ok_or_else(|| FrameError::UnknownTag(String::from_utf8_lossy(tag).into_owned()))?;
        let id = parse_canonical("id", id)?;
        let len = parse_canonical("length", len)?;
        if len > self.max_frame_len as u64 {
            return Err(FrameError::TooLarge {
                max: self.max_frame_len,
                len: usize::try_from(len).unwrap_or(usize::MAX),
            });
        }
        Ok((tag, id, len as usize))
    }
}
