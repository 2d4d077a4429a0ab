// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC call results and errors.

use std::fmt;
use std::io;

/// Outcome of one service call, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// The call reached the server and the handler ran.
    Executed,
    /// The call failed (transport error, unknown method, handler error).
    Failed,
    /// The call deadline elapsed; the session stays usable.
    TimedOut,
}

/// Response object returned by every call.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    /// How the call ended.
    pub call_state: CallState,
    /// Human-readable failure description (empty on success).
    pub error_message: String,
    /// Response payload (empty unless executed).
    pub payload: Vec<u8>,
}

impl ServiceResponse {
    /// Successful response.
    #[must_use]
    pub fn executed(payload: Vec<u8>) -> Self {
        Self {
            call_state: CallState::Executed,
            error_message: String::new(),
            payload,
        }
    }

    /// Failed response with a message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            call_state: CallState::Failed,
            error_message: message.into(),
            payload: Vec::new(),
        }
    }

    /// Timed out response.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            call_state: CallState::TimedOut,
            error_message: "call deadline elapsed".to_string(),
            payload: Vec::new(),
        }
    }

    /// Whether the handler ran.
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.call_state == CallState::Executed
    }
}

/// Errors from session and manager operations.
#[derive(Debug)]
pub enum RpcError {
    /// Socket-level failure.
    Io(io::Error),
    /// Frame or payload failed validation.
    Protocol(String),
    /// The manager was stopped.
    Cancelled,
    /// No connection to the peer.
    NotConnected,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "socket error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Cancelled => write!(f, "manager stopped"),
            Self::NotConnected => write!(f, "session not connected"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_state() {
        assert!(ServiceResponse::executed(vec![1]).is_executed());
        let failed = ServiceResponse::failed("nope");
        assert_eq!(failed.call_state, CallState::Failed);
        assert_eq!(failed.error_message, "nope");
        assert_eq!(ServiceResponse::timed_out().call_state, CallState::TimedOut);
    }
}
