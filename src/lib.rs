//! # MAS Control Engine
//!
//! Remote monitoring and spin-rate control for a Bruker Magic-Angle-Spinning
//! controller reached over TCP.
//!
//! Data path:
//! - [`connection`]: TCP socket lifetime, bounded connect, fail-fast close
//! - [`protocol`]: high-bit ASCII command encoding and reply framing
//! - [`telemetry`]: timestamped samples, plot history, on-disk spin logs
//! - [`control`]: automatic drive-pressure loop with a stall safety stop
//! - [`session`]: the coordinator state machine and its telemetry sources
//!
//! The coordinator is the only entry point a front end needs; everything it
//! reports arrives through [`session::SessionObserver`].

pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod types;

pub use config::MasConfig;
pub use error::{
    ConfigError, ConnError, ErrorKind, LogError, ProtocolError, SessionError, StateError,
    TelemetryError,
};
pub use session::{SessionCoordinator, SessionObserver, TelemetrySource};
pub use types::{ConnectionConfig, ControlTarget, MasStatus, Sample, SessionState, Timestamp};
