//! Echo protocol framing.

use bytes::BytesMut;

/// Two-byte sequence terminating every frame.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Frame that forces a server-side failure instead of an echo.
pub const SENTINEL: &[u8] = b"boom\r\n";

/// A complete frame extracted from the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload to echo back verbatim, terminator included.
    Echo(BytesMut),
    /// The sentinel command.
    Boom,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full frame was split off the front of the buffer.
    Complete(Frame),
    /// No terminator yet.
    Incomplete,
    /// The frame at the front of the buffer is, or can only become, longer
    /// than the limit.
    TooLarge,
}

/// Incremental frame decoder for one connection.
///
/// `max_len` bounds a frame including its terminator. The same rule applies
/// whether the frame is complete or still arriving, so the outcome does not
/// depend on how the peer's bytes were split across reads.
///
/// The decoder remembers how far the buffer has already been searched, so
/// each call only scans newly appended bytes.
#[derive(Debug, Clone)]
pub struct Decoder {
    max_len: usize,
    /// Offset in the buffer where the next terminator search starts.
    scanned: usize,
}

impl Decoder {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, scanned: 0 }
    }

    /// Split the first complete frame off `buffer`.
    ///
    /// Bytes after the terminator stay in `buffer` for the next call. The
    /// buffer must only grow at the back between calls.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> ParseResult {
        let start = self.scanned.min(buffer.len());

        match find_crlf(&buffer[start..]) {
            Some(pos) => {
                self.scanned = 0;
                let len = start + pos + TERMINATOR.len();
                if len > self.max_len {
                    return ParseResult::TooLarge;
                }
                let frame = buffer.split_to(len);
                if frame[..] == *SENTINEL {
                    ParseResult::Complete(Frame::Boom)
                } else {
                    ParseResult::Complete(Frame::Echo(frame))
                }
            }
            None => {
                // A trailing \r may be the first half of the terminator
                self.scanned = buffer.len().saturating_sub(1);
                let payload = match buffer.last() {
                    Some(b'\r') => buffer.len() - 1,
                    _ => buffer.len(),
                };
                if payload + TERMINATOR.len() > self.max_len {
                    ParseResult::TooLarge
                } else {
                    ParseResult::Incomplete
                }
            }
        }
    }

    /// Forget the search position, for a buffer that was cleared.
    pub fn reset(&mut self) {
        self.scanned = 0;
    }
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == TERMINATOR)
}
