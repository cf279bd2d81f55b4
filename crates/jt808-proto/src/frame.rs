//! Frame envelope: delimiters, escaping, and the XOR checksum.
//!
//! Every message travels as `7E | header | body | bcc | 7E`. Inside the
//! delimiters, `0x7E` is transmitted as `0x7D 0x02` and `0x7D` as
//! `0x7D 0x01`, so the delimiter byte never appears in the interior. The
//! checksum is a byte-wise XOR over header + body, computed before
//! escaping.
//!
//! [`seal`] and [`open`] are the only two ways frames are built and taken
//! apart; the packager and parser both go through them so the escape and
//! checksum invariants hold in one place.

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, Result};

/// Frame delimiter byte.
pub const DELIMITER: u8 = 0x7E;

/// Escape introducer byte.
pub const ESCAPE: u8 = 0x7D;

/// Second escape byte standing for `0x7E`.
const ESCAPED_DELIMITER: u8 = 0x02;

/// Second escape byte standing for `0x7D`.
const ESCAPED_ESCAPE: u8 = 0x01;

/// XOR-fold checksum over a byte region.
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, &b| acc ^ b)
}

/// Escape a byte region for transmission.
///
/// Maps `0x7E` to `0x7D 0x02` and `0x7D` to `0x7D 0x01`; everything else
/// passes through.
pub fn escape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 8);
    for &byte in input {
        match byte {
            DELIMITER => out.extend_from_slice(&[ESCAPE, ESCAPED_DELIMITER]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            other => out.push(other),
        }
    }
    out
}

/// Reverse the transmission escaping.
///
/// # Errors
///
/// - `ProtocolError::MalformedEscape` if `0x7D` is followed by anything
///   other than `0x01`/`0x02`, or ends the input
pub fn unescape(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut pos = 0;
    while pos < input.len() {
        let byte = input[pos];
        if byte == ESCAPE {
            match input.get(pos + 1) {
                Some(&ESCAPED_DELIMITER) => out.push(DELIMITER),
                Some(&ESCAPED_ESCAPE) => out.push(ESCAPE),
                _ => return Err(ProtocolError::MalformedEscape(pos)),
            }
            pos += 2;
        } else {
            out.push(byte);
            pos += 1;
        }
    }
    Ok(out)
}

/// Wrap an unescaped header+body region into a complete wire frame.
///
/// Appends the checksum, escapes the interior and adds the delimiters.
pub fn seal(interior: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(interior.len() + 1);
    inner.extend_from_slice(interior);
    inner.push(bcc(interior));

    let escaped = escape(&inner);
    let mut frame = Vec::with_capacity(escaped.len() + 2);
    frame.push(DELIMITER);
    frame.extend_from_slice(&escaped);
    frame.push(DELIMITER);
    frame
}

/// Unwrap a wire frame into its unescaped header+body region.
///
/// Verifies the delimiters, reverses the escaping and checks the checksum.
/// The returned bytes exclude the delimiters and the checksum byte.
///
/// # Errors
///
/// - `ProtocolError::MissingDelimiter` if the frame is not `7E … 7E`
/// - `ProtocolError::MalformedEscape` on a broken escape sequence
/// - `ProtocolError::FrameTooShort` if nothing remains after unescaping
/// - `ProtocolError::ChecksumMismatch` if the XOR check fails
pub fn open(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 2 || frame[0] != DELIMITER || frame[frame.len() - 1] != DELIMITER {
        return Err(ProtocolError::MissingDelimiter);
    }

    let mut inner = unescape(&frame[1..frame.len() - 1])?;
    if inner.len() < 2 {
        return Err(ProtocolError::FrameTooShort { expected: 2, actual: inner.len() });
    }

    let expected = match inner.pop() {
        Some(byte) => byte,
        None => return Err(ProtocolError::FrameTooShort { expected: 2, actual: 0 }),
    };
    let computed = bcc(&inner);
    if computed != expected {
        return Err(ProtocolError::ChecksumMismatch { expected, computed });
    }

    Ok(inner)
}

/// Incremental frame extractor for a TCP byte stream.
///
/// TCP reads are not frame-aligned: a single read may carry half a frame or
/// several frames back to back. The splitter buffers incoming bytes and
/// yields one complete `7E … 7E` envelope at a time. Garbage before the
/// first delimiter is discarded.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: BytesMut,
}

impl FrameSplitter {
    /// Create an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete frame, delimiters included.
    ///
    /// Returns `None` until a full `7E … 7E` envelope with a non-empty
    /// interior is buffered. Adjacent delimiters (an end abutting the next
    /// start, or keep-alive idle bytes) are collapsed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = self.buf.iter().position(|&b| b == DELIMITER)?;
            // Drop any noise before the opening delimiter.
            self.buf.advance(start);

            let end = self.buf[1..].iter().position(|&b| b == DELIMITER)? + 1;
            if end == 1 {
                // Empty interior: the first byte was a trailing delimiter
                // of a previous frame. Skip it and rescan.
                self.buf.advance(1);
                continue;
            }

            let frame = self.buf.split_to(end + 1);
            return Some(frame.to_vec());
        }
    }
}
