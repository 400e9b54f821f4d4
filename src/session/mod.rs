//! # Session
//!
//! The coordinator state machine and the telemetry sources it drives.
//!
//! - [`coordinator`]: operator entry points, state transitions, event fan-out
//! - [`source`]: the contract shared by the live link and the simulator
//! - [`link`]: live Bruker controller link (polling, replies, recovery)
//! - [`offline`]: synthetic spinner for running without hardware
//! - [`observer`]: subscription traits for front ends and log sinks

pub mod coordinator;
pub mod link;
pub mod observer;
pub mod offline;
pub mod source;

pub use coordinator::{SessionCoordinator, SessionStats};
pub use link::LinkConfig;
pub use observer::{SampleSink, SessionObserver};
pub use offline::{OfflineConfig, OfflineProfile};
pub use source::{CommandOutcome, CommandRequest, LinkEvent, LinkHandle, TelemetrySource};
