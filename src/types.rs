//! Core value types shared by every layer of the engine.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{ConfigError, StateError};

// ================================================================================================
// PROCESS CLOCK
// ================================================================================================

struct ProcessClock {
    epoch: Instant,
    wall_epoch: SystemTime,
    last_nanos: AtomicU64,
}

static CLOCK: OnceLock<ProcessClock> = OnceLock::new();

fn clock() -> &'static ProcessClock {
    CLOCK.get_or_init(|| ProcessClock {
        epoch: Instant::now(),
        wall_epoch: SystemTime::now(),
        last_nanos: AtomicU64::new(0),
    })
}

/// A point on the process-wide monotonic clock.
///
/// Every sample in the process is stamped from the same clock, so timestamps
/// keep increasing across reconnects regardless of what the controller does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// Reads the clock. Never returns a value smaller than a previous call.
    pub fn now() -> Self {
        let clock = clock();
        let elapsed = clock.epoch.elapsed().as_nanos() as u64;
        let previous = clock.last_nanos.fetch_max(elapsed, Ordering::SeqCst);
        Timestamp(Duration::from_nanos(previous.max(elapsed)))
    }

    /// Time since the process clock started.
    pub fn since_start(&self) -> Duration {
        self.0
    }

    /// Duration from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// Local wall-clock time corresponding to this timestamp.
    pub fn wall_clock(&self) -> DateTime<Local> {
        DateTime::<Local>::from(clock().wall_epoch + self.0)
    }
}

// ================================================================================================
// CONNECTION
// ================================================================================================

/// Resolved controller address. Immutable once a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ConfigError::Missing("controller host".to_string()));
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }
        Ok(Self { host, port })
    }

    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ================================================================================================
// SAMPLES AND STATUS
// ================================================================================================

/// One calibrated spin-frequency reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub frequency_hz: f64,
}

/// Gas pressures reported alongside the spin rate, in mbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pressures {
    pub drive_mbar: u32,
    pub bearing_mbar: u32,
    pub sense_mbar: u32,
}

/// Full controller status as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MasStatus {
    pub spin_hz: f64,
    pub drive_mbar: u32,
    pub bearing_mbar: u32,
    pub sense_mbar: u32,
    pub spin_set_hz: f64,
}

impl MasStatus {
    pub fn pressures(&self) -> Pressures {
        Pressures {
            drive_mbar: self.drive_mbar,
            bearing_mbar: self.bearing_mbar,
            sense_mbar: self.sense_mbar,
        }
    }
}

// ================================================================================================
// CONTROL TARGET
// ================================================================================================

/// Operator set point for the automatic loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTarget {
    /// Desired spin rate
    pub target_hz: f64,

    /// Allowed deviation before the loop acts
    pub tolerance_hz: f64,

    /// Largest drive-pressure change per command, in mbar
    pub max_step: f64,
}

impl Default for ControlTarget {
    fn default() -> Self {
        ControlTarget {
            target_hz: 0.0,
            tolerance_hz: 10.0,
            max_step: 50.0,
        }
    }
}

impl ControlTarget {
    pub fn validate(&self) -> Result<(), StateError> {
        if !self.target_hz.is_finite() || self.target_hz < 0.0 {
            return Err(StateError::InvalidTarget(format!(
                "target {} Hz must be a finite value >= 0",
                self.target_hz
            )));
        }
        if !self.tolerance_hz.is_finite() || self.tolerance_hz <= 0.0 {
            return Err(StateError::InvalidTarget(format!(
                "tolerance {} Hz must be > 0",
                self.tolerance_hz
            )));
        }
        if !self.max_step.is_finite() || self.max_step <= 0.0 {
            return Err(StateError::InvalidTarget(format!(
                "max step {} mbar must be > 0",
                self.max_step
            )));
        }
        Ok(())
    }

    pub fn with_target(self, target_hz: f64) -> Self {
        ControlTarget { target_hz, ..self }
    }
}

// ================================================================================================
// SESSION STATE
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ManualControl,
    AutoControl,
    Faulted,
}

impl SessionState {
    /// True while the controller accepts operator or loop commands.
    pub fn is_controlling(&self) -> bool {
        matches!(self, SessionState::ManualControl | SessionState::AutoControl)
    }

    /// True while a link to the controller is open.
    pub fn is_linked(&self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Connecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::ManualControl => "ManualControl",
            SessionState::AutoControl => "AutoControl",
            SessionState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// Operator operations, used to name rejected transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    EnableManual,
    EnableAuto,
    Disable,
    Acknowledge,
    ManualCommand,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::EnableManual => "enable_manual",
            Operation::EnableAuto => "enable_auto",
            Operation::Disable => "disable",
            Operation::Acknowledge => "acknowledge",
            Operation::ManualCommand => "manual_command",
        };
        f.write_str(name)
    }
}

// ================================================================================================
// COMMAND IDS
// ================================================================================================

/// Identifies one command transaction with the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared allocator so operator commands and link polls never collide.
#[derive(Debug, Clone, Default)]
pub struct CommandIds {
    next: Arc<AtomicU64>,
}

impl CommandIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CommandId {
        CommandId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
