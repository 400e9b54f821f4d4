//! # Telemetry
//!
//! Everything downstream of a decoded status reply:
//! - [`sampler`]: calibration and plausibility filter, one sample per frame
//! - [`history`]: retention-bounded plot feed with gaps on disconnect
//! - [`writer`]: background spin log with bounded queue and rename-on-flush

pub mod history;
pub mod sampler;
pub mod writer;

pub use history::{HistoryPoint, SpinHistory, DEFAULT_RETENTION};
pub use sampler::{SamplerConfig, SamplerStats, TelemetrySampler};
pub use writer::{SpinLogConfig, SpinLogStats, SpinLogger};
