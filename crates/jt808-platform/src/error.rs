//! Error types for the platform server.

use std::{io, time::Duration};

use jt808_proto::ProtocolError;
use thiserror::Error;

/// Errors produced by the platform server.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// A new client violated the registration handshake.
    #[error("handshake failed: {reason}")]
    Handshake {
        /// What the client got wrong.
        reason: &'static str,
    },

    /// The authentication code did not match the one issued.
    #[error("authentication code mismatch")]
    AuthMismatch,

    /// A read deadline expired.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// Operation that was waiting.
        operation: &'static str,
        /// How long it waited.
        elapsed: Duration,
    },

    /// No registered client under this id.
    #[error("unknown client id {0}")]
    UnknownClient(u64),

    /// No registered client with this phone number.
    #[error("no client registered with phone {0}")]
    UnknownPhone(String),

    /// The terminal refused an upgrade fragment.
    #[error("terminal rejected the upgrade with result {result}")]
    UpgradeRejected {
        /// Result code from the terminal's general respond.
        result: u8,
    },

    /// Frame codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// OS randomness was unavailable for auth-code generation.
    #[error("random generator failure: {0}")]
    Rng(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_offender() {
        assert!(PlatformError::UnknownClient(9).to_string().contains('9'));
        assert!(
            PlatformError::UnknownPhone("13523339527".to_owned())
                .to_string()
                .contains("13523339527")
        );
        assert!(PlatformError::UpgradeRejected { result: 2 }.to_string().contains('2'));
    }
}
