// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type.
//!
//! Subsystems define their own error enums (`ShmError`, `WireError`,
//! `RpcError`); this type is the surface the public API reports through.

use std::fmt;

/// Errors reported by the public API.
#[derive(Debug)]
pub enum Error {
    /// Invalid options (zero buffer count, out-of-range values, ...).
    Configuration(String),

    /// A kernel or memory resource could not be created.
    ResourceExhaustion(String),

    /// No matching peer reachable via any enabled layer.
    TransportUnavailable(String),

    /// A wire header or sample failed validation.
    ProtocolViolation(String),

    /// An ack, call or registration deadline elapsed.
    Timeout(&'static str),

    /// Operation aborted by `stop()` / `shutdown()`.
    Cancelled,

    /// A named primitive's previous holder died.
    Abandoned(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::ResourceExhaustion(msg) => write!(f, "resource exhaustion: {msg}"),
            Self::TransportUnavailable(msg) => write!(f, "no transport available: {msg}"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::Timeout(what) => write!(f, "timeout waiting for {what}"),
            Self::Cancelled => write!(f, "operation cancelled by shutdown"),
            Self::Abandoned(name) => write!(f, "named primitive abandoned: {name}"),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_detail() {
        let e = Error::Configuration("buffer_count must be 1..=64".into());
        assert!(e.to_string().contains("buffer_count"));
        let e = Error::Timeout("read ack");
        assert!(e.to_string().contains("read ack"));
    }
}
