//! Offline spinner simulation.
//!
//! Stands in for the controller link when no hardware is attached. Every
//! command is acknowledged; only the `Plant` profile reacts to drive pressure.

use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use super::source::{CommandOutcome, CommandRequest, LinkEvent, LinkHandle};
use crate::connection::wait_for_shutdown;
use crate::protocol::Command;
use crate::types::{MasStatus, Sample, Timestamp};

/// Length of one fake ramp, in ticks.
const RAMP_TICKS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfflineProfile {
    /// 0, 1, ... 99 Hz, one step per tick, then a one-tick gap
    Ramp,
    /// First-order spinner driven by the commanded drive pressure
    Plant {
        /// Steady-state spin per mbar of drive
        hz_per_mbar: f64,
        /// Fraction of the remaining gap closed each tick (0..1]
        response: f64,
        /// Uniform measurement noise amplitude
        noise_hz: f64,
    },
    /// Constant reading that ignores every command
    Fixed { hz: f64 },
}

impl fmt::Display for OfflineProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfflineProfile::Ramp => f.write_str("ramp"),
            OfflineProfile::Plant { .. } => f.write_str("plant"),
            OfflineProfile::Fixed { hz } => write!(f, "fixed at {} Hz", hz),
        }
    }
}

/// Offline source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub profile: OfflineProfile,

    /// Period between synthetic samples
    pub tick_ms: u64,

    /// Drive pressure the plant starts from
    pub initial_drive_mbar: u32,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        OfflineConfig {
            profile: OfflineProfile::Ramp,
            tick_ms: 50,
            initial_drive_mbar: 0,
        }
    }
}

impl OfflineConfig {
    pub fn plant() -> Self {
        OfflineConfig {
            profile: OfflineProfile::Plant {
                hz_per_mbar: 10.0,
                response: 0.2,
                noise_hz: 2.0,
            },
            ..OfflineConfig::default()
        }
    }

    pub fn fixed(hz: f64) -> Self {
        OfflineConfig {
            profile: OfflineProfile::Fixed { hz },
            ..OfflineConfig::default()
        }
    }
}

struct OfflineSpinner {
    config: OfflineConfig,
    commands: mpsc::UnboundedReceiver<CommandRequest>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<LinkEvent>,
    tick: u32,
    spin_hz: f64,
    status: MasStatus,
    published: Option<MasStatus>,
}

/// Start the simulator task.
pub(crate) fn open_offline(config: OfflineConfig, events: mpsc::Sender<LinkEvent>) -> LinkHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("Offline mode: simulating {} spinner", config.profile);
    let status = MasStatus {
        drive_mbar: config.initial_drive_mbar,
        ..MasStatus::default()
    };
    let spinner = OfflineSpinner {
        config,
        commands: command_rx,
        shutdown: shutdown_rx,
        events,
        tick: 0,
        spin_hz: 0.0,
        status,
        published: None,
    };

    let task = tokio::spawn(spinner.run());
    LinkHandle::new(command_tx, shutdown_tx, task)
}

impl OfflineSpinner {
    async fn run(mut self) {
        let mut ticker = interval(Duration::from_millis(self.config.tick_ms.max(1)));

        loop {
            let delivered = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                request = self.commands.recv() => match request {
                    Some(request) => self.apply(request).await,
                    None => break,
                },
                _ = ticker.tick() => self.step().await,
            };
            if !delivered {
                break;
            }
        }
        debug!("Offline spinner stopped");
    }

    /// Acknowledge a command, updating the model where it matters.
    async fn apply(&mut self, request: CommandRequest) -> bool {
        info!("Offline: {} {}", request.id, request.command);
        match request.command {
            Command::SetDrivePressure(mbar) => self.status.drive_mbar = u32::from(mbar),
            Command::SetBearingPressure(mbar) => self.status.bearing_mbar = u32::from(mbar),
            Command::SetSpinRate(hz) => self.status.spin_set_hz = f64::from(hz),
            _ => {}
        }
        self.emit(LinkEvent::Completed {
            id: request.id,
            command: request.command,
            outcome: CommandOutcome::Acked,
        })
        .await
    }

    async fn step(&mut self) -> bool {
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);

        let reading = match self.config.profile {
            OfflineProfile::Ramp => {
                let phase = tick % (RAMP_TICKS + 1);
                (phase < RAMP_TICKS).then(|| f64::from(phase))
            }
            OfflineProfile::Plant {
                hz_per_mbar,
                response,
                noise_hz,
            } => {
                let steady = f64::from(self.status.drive_mbar) * hz_per_mbar;
                self.spin_hz += response.clamp(0.0, 1.0) * (steady - self.spin_hz);
                let noise = if noise_hz > 0.0 {
                    rand::thread_rng().gen_range(-noise_hz..=noise_hz)
                } else {
                    0.0
                };
                Some((self.spin_hz + noise).max(0.0))
            }
            OfflineProfile::Fixed { hz } => Some(hz.max(0.0)),
        };

        let Some(frequency_hz) = reading else {
            return self.emit(LinkEvent::Gap).await;
        };

        let sample = Sample {
            timestamp: Timestamp::now(),
            frequency_hz,
        };
        if !self.emit(LinkEvent::Sample(sample)).await {
            return false;
        }

        self.status.spin_hz = frequency_hz.round();
        if self.published == Some(self.status) {
            return true;
        }
        self.published = Some(self.status);
        self.emit(LinkEvent::Status(self.status)).await
    }

    async fn emit(&self, event: LinkEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}
