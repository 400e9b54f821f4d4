//! # Telemetry Sampler
//!
//! Turns raw controller spin readings into timestamped [`Sample`]s, one per
//! telemetry frame. Readings outside the plausible range are dropped and
//! reported so a single glitch cannot reach the control loop or the log.

use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;
use crate::types::{Sample, Timestamp};

/// Sampler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Hertz per controller unit (the Bruker controller reports Hz)
    pub calibration_hz_per_unit: f64,

    /// Lowest plausible reading
    pub min_hz: f64,

    /// Hardware ceiling
    pub max_hz: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            calibration_hz_per_unit: 1.0,
            min_hz: 0.0,
            max_hz: 70_000.0,
        }
    }
}

pub struct TelemetrySampler {
    config: SamplerConfig,
    last_frequency_hz: Option<f64>,
    accepted: u64,
    rejected: u64,
}

impl TelemetrySampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            last_frequency_hz: None,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Convert one raw reading.
    pub fn sample(&mut self, frequency_raw: f64) -> Result<Sample, TelemetryError> {
        let frequency_hz = self.calibrate(frequency_raw);

        if !frequency_hz.is_finite()
            || frequency_hz < self.config.min_hz
            || frequency_hz > self.config.max_hz
        {
            self.rejected += 1;
            return Err(TelemetryError::OutOfRange {
                frequency_hz,
                min_hz: self.config.min_hz,
                max_hz: self.config.max_hz,
            });
        }

        self.accepted += 1;
        self.last_frequency_hz = Some(frequency_hz);
        Ok(Sample {
            timestamp: Timestamp::now(),
            frequency_hz,
        })
    }

    pub fn calibrate(&self, frequency_raw: f64) -> f64 {
        frequency_raw * self.config.calibration_hz_per_unit
    }

    /// Last reading that passed the plausibility check
    pub fn last_frequency(&self) -> Option<f64> {
        self.last_frequency_hz
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            accepted: self.accepted,
            rejected: self.rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerStats {
    pub accepted: u64,
    pub rejected: u64,
}
