//! Error taxonomy for the engine.
//!
//! Transport and protocol errors surface to the session coordinator, which
//! decides the state change. Telemetry and log errors are recovered where they
//! happen and only reported.

use std::fmt;
use thiserror::Error;

use crate::types::{CommandId, Operation, SessionState};

/// Errors from the TCP link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    /// Connect attempt or controller reply exceeded its deadline
    #[error("controller did not respond in time (check that it is in remote mode)")]
    Timeout,

    /// The link dropped or was closed; the handle is no longer usable
    #[error("connection to controller lost")]
    Lost,

    /// The controller could not be reached at all
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Errors while decoding the controller byte stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed reply{}: {detail}", fmt_command(.command_id))]
    Malformed {
        /// Command the record was paired with, if any
        command_id: Option<CommandId>,
        detail: String,
    },
}

fn fmt_command(id: &Option<CommandId>) -> String {
    match id {
        Some(id) => format!(" to {}", id),
        None => String::new(),
    }
}

/// Implausible telemetry readings. The sample is dropped, never propagated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("spin reading {frequency_hz} Hz outside plausible range [{min_hz}, {max_hz}]")]
    OutOfRange {
        frequency_hz: f64,
        min_hz: f64,
        max_hz: f64,
    },
}

/// Rejected operator requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("cannot {attempted} while {from}")]
    InvalidTransition {
        from: SessionState,
        attempted: Operation,
    },

    #[error("automatic control is active; switch to manual control first")]
    AutoActive,

    #[error("invalid control target: {0}")]
    InvalidTarget(String),
}

/// Spin log failures. These never affect telemetry or control delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("spin log queue full ({capacity} samples); sample dropped from log")]
    Backpressure { capacity: usize },

    #[error("spin log write failed: {0}")]
    WriteFailed(String),
}

/// Configuration loading and connection resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("missing {0}")]
    Missing(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Errors returned by coordinator entry points.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Discriminant handed to `on_error` observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Telemetry,
    State,
    ControlStall,
    Command,
    Log,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Telemetry => "telemetry",
            ErrorKind::State => "state",
            ErrorKind::ControlStall => "control-stall",
            ErrorKind::Command => "command",
            ErrorKind::Log => "log",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_names_transition() {
        let err = StateError::InvalidTransition {
            from: SessionState::Disconnected,
            attempted: Operation::ManualCommand,
        };
        assert_eq!(err.to_string(), "cannot manual_command while Disconnected");
    }

    #[test]
    fn test_malformed_mentions_command() {
        let err = ProtocolError::Malformed {
            command_id: Some(CommandId(7)),
            detail: "bad".to_string(),
        };
        assert_eq!(err.to_string(), "malformed reply to #7: bad");

        let unsolicited = ProtocolError::Malformed {
            command_id: None,
            detail: "bad".to_string(),
        };
        assert_eq!(unsolicited.to_string(), "malformed reply: bad");
    }
}
