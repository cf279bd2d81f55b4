//! Error types for the JT/T 808 wire codec.
//!
//! Strongly-typed errors for the two codec layers: frame-level failures
//! (framing, escaping, checksum) and body-level failures (short or
//! inconsistent message bodies). Session crates map these onto their own
//! error types at the dispatch boundary.

use thiserror::Error;

/// Result alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding JT/T 808 frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame does not start and end with the `0x7E` delimiter.
    #[error("missing frame delimiter")]
    MissingDelimiter,

    /// An `0x7D` escape byte is followed by something other than
    /// `0x01`/`0x02`, or ends the input.
    #[error("malformed escape sequence at offset {0}")]
    MalformedEscape(usize),

    /// XOR checksum over the unescaped interior does not match the frame.
    #[error("checksum mismatch: expected {expected:#04x}, computed {computed:#04x}")]
    ChecksumMismatch {
        /// Checksum byte carried by the frame.
        expected: u8,
        /// Checksum computed over the received bytes.
        computed: u8,
    },

    /// Frame or body is shorter than the format requires.
    #[error("frame too short: need {expected} bytes, have {actual}")]
    FrameTooShort {
        /// Minimum byte count required.
        expected: usize,
        /// Byte count available.
        actual: usize,
    },

    /// Declared body length disagrees with the received byte count.
    #[error("body length mismatch: header declares {declared}, frame carries {actual}")]
    LengthMismatch {
        /// Length from the message-body attribute field.
        declared: u16,
        /// Actual unescaped body byte count.
        actual: usize,
    },

    /// Body exceeds the 10-bit length field.
    #[error("body too long: {0} bytes exceeds the 1023-byte limit")]
    BodyTooLong(usize),

    /// A BCD byte contains a nibble above 9.
    #[error("invalid BCD byte {0:#04x}")]
    InvalidBcd(u8),

    /// A string headed for BCD encoding contains a non-digit.
    #[error("non-digit character {0:?} in BCD input")]
    InvalidDigit(char),

    /// No encoder or decoder is registered for this message id.
    #[error("unsupported message id {0:#06x}")]
    UnsupportedMessage(u16),

    /// Body bytes violate the layout for this message id.
    #[error("invalid body for message {msg_id:#06x}: {reason}")]
    InvalidBody {
        /// Message id whose decoder or encoder rejected the body.
        msg_id: u16,
        /// What was violated.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_offsets_and_ids() {
        let err = ProtocolError::MalformedEscape(7);
        assert!(err.to_string().contains("offset 7"));

        let err = ProtocolError::UnsupportedMessage(0x8900);
        assert!(err.to_string().contains("0x8900"));

        let err = ProtocolError::ChecksumMismatch { expected: 0x1A, computed: 0x1B };
        assert!(err.to_string().contains("0x1a"));
    }
}
