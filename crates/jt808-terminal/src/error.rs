//! Error types for the terminal session.
//!
//! Transport failures are fatal to the session; codec failures on inbound
//! frames are logged and the frame dropped, so they never surface here.
//! What does surface is everything the host can act on: bad state
//! transitions, rejected handshakes and deadline overruns.

use std::{io, time::Duration};

use jt808_proto::ProtocolError;
use thiserror::Error;

use crate::client::SessionState;

/// Errors produced by the terminal session.
#[derive(Error, Debug)]
pub enum TerminalError {
    /// Operation attempted from the wrong session state.
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// State the session was in.
        state: SessionState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The platform rejected the register request.
    #[error("registration rejected with result {result}")]
    RegisterRejected {
        /// Result code from the `0x8100` respond.
        result: u8,
    },

    /// The platform rejected the authentication code.
    #[error("authentication rejected with result {result}")]
    AuthRejected {
        /// Result code from the `0x8001` respond.
        result: u8,
    },

    /// The peer answered with an unexpected message.
    #[error("unexpected respond {msg_id:#06x} during {operation}")]
    UnexpectedRespond {
        /// Message id that arrived.
        msg_id: u16,
        /// Operation awaiting a different respond.
        operation: &'static str,
    },

    /// A read deadline expired.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// Operation that was waiting.
        operation: &'static str,
        /// How long it waited.
        elapsed: Duration,
    },

    /// Frame codec failure on an outbound message.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Socket-level failure; fatal to the session.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl TerminalError {
    /// Whether retrying the operation may succeed.
    ///
    /// Timeouts and transport hiccups are transient; protocol rejections
    /// and state misuse are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let err = TerminalError::Timeout {
            operation: "register",
            elapsed: Duration::from_secs(5),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn rejections_are_fatal() {
        assert!(!TerminalError::RegisterRejected { result: 4 }.is_transient());
        assert!(!TerminalError::AuthRejected { result: 1 }.is_transient());
        assert!(
            !TerminalError::InvalidState { state: SessionState::Init, operation: "run" }
                .is_transient()
        );
    }
}
