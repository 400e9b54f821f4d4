//! # Auto-Control Loop
//!
//! Proportional drive-pressure stepping toward a target spin rate.
//!
//! Every `cycle_samples` accepted samples the loop compares the measured rate
//! with the target. Outside the tolerance band it proposes one bounded
//! drive-pressure step in the direction that reduces the error. While a step
//! is unacknowledged it proposes nothing.
//!
//! ## Stall stop
//!
//! A cycle that does not shrink the error by at least `min_progress_hz` counts
//! as stalled. After `stall_limit` consecutive stalled cycles the loop faults
//! and stays silent until it is rebuilt.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::types::{CommandId, ControlTarget, Sample};

/// Auto-control configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoControlConfig {
    /// Accepted samples per control cycle
    pub cycle_samples: usize,

    /// Proportional gain (mbar of drive per Hz of error)
    pub gain_mbar_per_hz: f64,

    /// Drive pressure granularity accepted by the controller
    pub drive_resolution_mbar: u32,

    /// Highest drive pressure the loop will ever command
    pub drive_ceiling_mbar: u32,

    /// Error reduction per cycle below which the cycle counts as stalled
    pub min_progress_hz: f64,

    /// Consecutive stalled cycles before the loop faults
    pub stall_limit: u32,
}

impl Default for AutoControlConfig {
    fn default() -> Self {
        AutoControlConfig {
            cycle_samples: 2,
            gain_mbar_per_hz: 0.02,
            drive_resolution_mbar: 10,
            drive_ceiling_mbar: 5000,
            min_progress_hz: 5.0,
            stall_limit: 3,
        }
    }
}

/// A drive-pressure command proposed by the loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveAdjustment {
    /// New absolute drive pressure
    pub drive_mbar: u16,
    /// Signed change from the current drive
    pub step_mbar: i32,
    /// `target - measured` when the step was computed
    pub error_hz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlDecision {
    /// Mid-cycle, awaiting an ack, or faulted
    Idle,
    /// Measured rate is within tolerance
    InBand,
    Adjust(DriveAdjustment),
    /// Drive already at a limit; nothing to send
    Saturated { drive_mbar: u32 },
    /// Stall limit reached; the loop is now faulted
    Stalled { cycles: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    id: CommandId,
    drive_mbar: u32,
}

pub struct AutoController {
    config: AutoControlConfig,
    target: ControlTarget,
    drive_mbar: u32,
    outstanding: Option<Outstanding>,
    samples_in_cycle: usize,
    previous_error: Option<f64>,
    stalled_cycles: u32,
    faulted: bool,
    commands_issued: u64,
}

impl AutoController {
    /// Start a loop from the controller's current drive pressure.
    pub fn new(config: AutoControlConfig, target: ControlTarget, initial_drive_mbar: u32) -> Self {
        let drive_mbar = initial_drive_mbar.min(config.drive_ceiling_mbar);
        Self {
            config,
            target,
            drive_mbar,
            outstanding: None,
            samples_in_cycle: 0,
            previous_error: None,
            stalled_cycles: 0,
            faulted: false,
            commands_issued: 0,
        }
    }

    pub fn target(&self) -> &ControlTarget {
        &self.target
    }

    /// Change the set point. Stall tracking starts over.
    pub fn retarget(&mut self, target: ControlTarget) {
        self.target = target;
        self.previous_error = None;
        self.stalled_cycles = 0;
        self.samples_in_cycle = 0;
    }

    pub fn drive_mbar(&self) -> u32 {
        self.drive_mbar
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn awaiting_ack(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn stalled_cycles(&self) -> u32 {
        self.stalled_cycles
    }

    pub fn commands_issued(&self) -> u64 {
        self.commands_issued
    }

    /// Feed one accepted sample.
    pub fn on_sample(&mut self, sample: &Sample) -> ControlDecision {
        if self.faulted || self.outstanding.is_some() {
            return ControlDecision::Idle;
        }

        self.samples_in_cycle += 1;
        if self.samples_in_cycle < self.config.cycle_samples.max(1) {
            return ControlDecision::Idle;
        }
        self.samples_in_cycle = 0;

        let error_hz = self.target.target_hz - sample.frequency_hz;
        if error_hz.abs() <= self.target.tolerance_hz {
            self.previous_error = None;
            self.stalled_cycles = 0;
            return ControlDecision::InBand;
        }

        if let Some(previous) = self.previous_error {
            if previous.abs() - error_hz.abs() < self.config.min_progress_hz {
                self.stalled_cycles += 1;
            } else {
                self.stalled_cycles = 0;
            }
        }
        self.previous_error = Some(error_hz);

        if self.stalled_cycles >= self.config.stall_limit {
            self.faulted = true;
            warn!(
                "Auto control stalled for {} cycles at {:.0} Hz (target {:.0} Hz)",
                self.stalled_cycles, sample.frequency_hz, self.target.target_hz
            );
            return ControlDecision::Stalled {
                cycles: self.stalled_cycles,
            };
        }

        let step = self.step_for(error_hz);
        let ceiling = self.config.drive_ceiling_mbar.min(u32::from(u16::MAX));
        let proposed =
            (i64::from(self.drive_mbar) + i64::from(step)).clamp(0, i64::from(ceiling)) as u32;

        if proposed == self.drive_mbar {
            debug!("Drive saturated at {} mbar", self.drive_mbar);
            return ControlDecision::Saturated {
                drive_mbar: self.drive_mbar,
            };
        }

        ControlDecision::Adjust(DriveAdjustment {
            drive_mbar: proposed as u16,
            step_mbar: proposed as i32 - self.drive_mbar as i32,
            error_hz,
        })
    }

    /// Proportional step, bounded by `max_step` and rounded toward zero to
    /// the drive resolution.
    fn step_for(&self, error_hz: f64) -> i32 {
        let max_step = self.target.max_step.floor();
        let resolution = f64::from(self.config.drive_resolution_mbar.max(1));

        let raw = (self.config.gain_mbar_per_hz * error_hz).clamp(-max_step, max_step);
        let quantized = (raw / resolution).trunc() * resolution;
        let step = if quantized == 0.0 {
            resolution.min(max_step).copysign(error_hz)
        } else {
            quantized
        };
        step as i32
    }

    /// Record the id of the command sent for a proposed adjustment.
    pub fn issued(&mut self, id: CommandId, drive_mbar: u16) {
        self.outstanding = Some(Outstanding {
            id,
            drive_mbar: u32::from(drive_mbar),
        });
        self.commands_issued += 1;
    }

    /// Complete the outstanding command. Returns false for an unrelated id.
    pub fn on_outcome(&mut self, id: CommandId, acked: bool) -> bool {
        match self.outstanding {
            Some(outstanding) if outstanding.id == id => {
                self.outstanding = None;
                self.samples_in_cycle = 0;
                if acked {
                    self.drive_mbar = outstanding.drive_mbar;
                } else {
                    debug!("Drive command {} not applied", id);
                }
                true
            }
            _ => false,
        }
    }
}

/// Round an operator pressure request to the controller's granularity and
/// clamp it to `[0, ceiling]`.
pub fn quantize_pressure(mbar: i64, resolution: u32, ceiling: u32) -> u16 {
    let resolution = i64::from(resolution.max(1));
    let rounded = ((mbar as f64 / resolution as f64).round() as i64) * resolution;
    rounded.clamp(0, i64::from(ceiling.min(u32::from(u16::MAX)))) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn at(hz: f64) -> Sample {
        Sample {
            timestamp: Timestamp::now(),
            frequency_hz: hz,
        }
    }

    fn controller(target_hz: f64) -> AutoController {
        AutoController::new(
            AutoControlConfig {
                cycle_samples: 1,
                ..AutoControlConfig::default()
            },
            ControlTarget::default().with_target(target_hz),
            0,
        )
    }

    #[test]
    fn test_stalled_spinner_faults_after_three_cycles() {
        let mut ctl = controller(12_000.0);
        let mut ids = 0;
        let mut drives = Vec::new();

        loop {
            match ctl.on_sample(&at(0.0)) {
                ControlDecision::Adjust(adj) => {
                    ids += 1;
                    drives.push(adj.drive_mbar);
                    ctl.issued(CommandId(ids), adj.drive_mbar);
                    assert!(ctl.on_outcome(CommandId(ids), true));
                }
                ControlDecision::Stalled { cycles } => {
                    assert_eq!(cycles, 3);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(drives, vec![50, 100, 150]);
        assert!(ctl.is_faulted());
        assert_eq!(ctl.on_sample(&at(0.0)), ControlDecision::Idle);
        assert_eq!(ctl.commands_issued(), 3);
    }

    #[test]
    fn test_step_never_exceeds_max_step() {
        for max_step in [5.0, 10.0, 35.0, 50.0, 500.0] {
            let mut ctl = AutoController::new(
                AutoControlConfig {
                    cycle_samples: 1,
                    ..AutoControlConfig::default()
                },
                ControlTarget {
                    target_hz: 30_000.0,
                    tolerance_hz: 10.0,
                    max_step,
                },
                2000,
            );
            for measured in [0.0, 29_000.0, 29_985.0, 31_000.0, 60_000.0] {
                ctl.retarget(*ctl.target());
                if let ControlDecision::Adjust(adj) = ctl.on_sample(&at(measured)) {
                    assert!(f64::from(adj.step_mbar.abs()) <= max_step);
                    assert_eq!(adj.step_mbar.signum() as f64, adj.error_hz.signum());
                }
            }
        }
    }

    #[test]
    fn test_no_second_command_before_ack() {
        let mut ctl = controller(10_000.0);
        let ControlDecision::Adjust(adj) = ctl.on_sample(&at(5000.0)) else {
            panic!("expected an adjustment");
        };
        ctl.issued(CommandId(1), adj.drive_mbar);

        for _ in 0..10 {
            assert_eq!(ctl.on_sample(&at(5000.0)), ControlDecision::Idle);
        }
        assert!(!ctl.on_outcome(CommandId(2), true));
        assert!(ctl.awaiting_ack());

        // A timed-out command releases the loop without moving the drive.
        assert!(ctl.on_outcome(CommandId(1), false));
        assert_eq!(ctl.drive_mbar(), 0);
        assert!(matches!(ctl.on_sample(&at(5000.0)), ControlDecision::Adjust(_)));
    }

    #[test]
    fn test_in_band_resets_stall_count() {
        let mut ctl = controller(5000.0);
        let mut id = 0;
        for _ in 0..2 {
            if let ControlDecision::Adjust(adj) = ctl.on_sample(&at(4000.0)) {
                id += 1;
                ctl.issued(CommandId(id), adj.drive_mbar);
                ctl.on_outcome(CommandId(id), true);
            }
        }
        assert_eq!(ctl.stalled_cycles(), 1);
        assert_eq!(ctl.on_sample(&at(4995.0)), ControlDecision::InBand);
        assert_eq!(ctl.stalled_cycles(), 0);
    }

    #[test]
    fn test_small_error_uses_one_resolution_step() {
        let mut ctl = controller(5000.0);
        // 0.02 mbar/Hz * 20 Hz = 0.4 mbar, below the 10 mbar resolution.
        let ControlDecision::Adjust(adj) = ctl.on_sample(&at(4980.0)) else {
            panic!("expected an adjustment");
        };
        assert_eq!(adj.step_mbar, 10);
    }

    #[test]
    fn test_drive_saturates_at_limits() {
        let mut ctl = AutoController::new(
            AutoControlConfig {
                cycle_samples: 1,
                ..AutoControlConfig::default()
            },
            ControlTarget::default().with_target(1000.0),
            0,
        );
        assert_eq!(
            ctl.on_sample(&at(8000.0)),
            ControlDecision::Saturated { drive_mbar: 0 }
        );

        let mut ctl = AutoController::new(
            AutoControlConfig {
                cycle_samples: 1,
                ..AutoControlConfig::default()
            },
            ControlTarget::default().with_target(60_000.0),
            5000,
        );
        assert_eq!(
            ctl.on_sample(&at(20_000.0)),
            ControlDecision::Saturated { drive_mbar: 5000 }
        );
    }

    #[test]
    fn test_cycle_waits_for_enough_samples() {
        let mut ctl = AutoController::new(
            AutoControlConfig {
                cycle_samples: 3,
                ..AutoControlConfig::default()
            },
            ControlTarget::default().with_target(5000.0),
            1000,
        );
        assert_eq!(ctl.on_sample(&at(1000.0)), ControlDecision::Idle);
        assert_eq!(ctl.on_sample(&at(1000.0)), ControlDecision::Idle);
        assert!(matches!(ctl.on_sample(&at(1000.0)), ControlDecision::Adjust(_)));
    }

    #[test]
    fn test_quantize_pressure() {
        assert_eq!(quantize_pressure(1234, 10, 5000), 1230);
        assert_eq!(quantize_pressure(1235, 10, 5000), 1240);
        assert_eq!(quantize_pressure(-40, 10, 5000), 0);
        assert_eq!(quantize_pressure(9000, 10, 5000), 5000);
    }
}
