//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`Framer`] turns an arbitrarily chunked byte stream back into payloads
//! without ever blocking: each call does one bounded step and keeps its
//! progress for the next poll. [`encode_frame`] produces the wire form.

use std::mem;

/// Maximum frame size (64 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("missing Content-Length header in {header:?}")]
    MissingContentLength { header: String },
    #[error("invalid Content-Length value {value:?}")]
    InvalidContentLength { value: String },
    #[error("Content-Length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    AwaitingHeaders,
    AwaitingBody { len: usize },
}

/// Resumable Content-Length frame parser.
#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    state: FrameState,
    /// Offset into `buf` up to which the header terminator is known absent.
    scanned: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: FrameState::AwaitingHeaders,
            scanned: 0,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete payload, if one is fully buffered.
    ///
    /// `Ok(None)` means "not ready yet": poll again after feeding more bytes.
    /// An error leaves the stream untrustworthy; callers should tear down.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.state == FrameState::AwaitingHeaders {
            // Back up so a terminator split across feeds is still found.
            let start = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
            let Some(pos) = find(&self.buf[start..], HEADER_TERMINATOR).map(|p| p + start) else {
                self.scanned = self.buf.len();
                return Ok(None);
            };

            let len = parse_content_length(&self.buf[..pos])?;
            if len > MAX_FRAME_BYTES {
                return Err(FramingError::TooLarge {
                    len,
                    max: MAX_FRAME_BYTES,
                });
            }
            self.buf.drain(..pos + HEADER_TERMINATOR.len());
            self.scanned = 0;
            self.state = FrameState::AwaitingBody { len };
        }

        let FrameState::AwaitingBody { len } = self.state else {
            return Ok(None);
        };
        if self.buf.len() < len {
            return Ok(None);
        }

        let rest = self.buf.split_off(len);
        let body = mem::replace(&mut self.buf, rest);
        self.state = FrameState::AwaitingHeaders;
        Ok(Some(body))
    }

    /// Drop all buffered bytes and restart at a header boundary.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.state = FrameState::AwaitingHeaders;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_content_length(header: &[u8]) -> Result<usize, FramingError> {
    let text = String::from_utf8_lossy(header);
    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // LSP uses "Content-Length" but parse case-insensitively for robustness.
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            return value
                .parse()
                .map_err(|_| FramingError::InvalidContentLength {
                    value: value.to_string(),
                });
        }
        // Ignore other headers (e.g. Content-Type)
    }
    Err(FramingError::MissingContentLength {
        header: text.into_owned(),
    })
}

/// Wrap a serialized JSON body in a `Content-Length` header.
///
/// Content-Length counts bytes, not characters.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}
