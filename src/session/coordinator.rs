//! # Session Coordinator
//!
//! Owns the session state machine and is the single entry point for a front
//! end:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                               \--failure--> Disconnected
//! Connected --enable_manual--> ManualControl --disable--> Connected
//! Connected --enable_auto----> AutoControl ----disable--> Connected
//! AutoControl --stall--> Faulted --acknowledge--> Connected
//! any --link lost--> Disconnected
//! ```
//!
//! Session state, the control target and the auto loop sit behind one
//! `parking_lot::Mutex`. Every notification is queued while that lock is held
//! and delivered by a single notifier thread, so all observers and sinks see
//! the same events in the same order.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::observer::{SampleSink, SessionObserver};
use super::source::{
    open_link, CommandOutcome, CommandRequest, LinkEvent, LinkHandle, TelemetrySource,
};
use crate::config::MasConfig;
use crate::control::{quantize_pressure, AutoController, ControlDecision};
use crate::error::{ConnError, ErrorKind, SessionError, StateError};
use crate::protocol::Command;
use crate::types::{
    CommandId, CommandIds, ControlTarget, MasStatus, Operation, Sample, SessionState,
};

/// Session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub samples_delivered: u64,
    pub samples_rejected: u64,
    pub commands_sent: u64,
    pub commands_failed: u64,
    pub connects: u64,
    pub sink_errors: u64,
}

enum Notice {
    Sample(Sample),
    State(SessionState),
    Status(MasStatus),
    Error(ErrorKind, String),
    Gap,
    Observer(Arc<dyn SessionObserver>),
    Sink(Arc<dyn SampleSink>),
}

struct Core {
    state: SessionState,
    target: ControlTarget,
    target_explicit: bool,
    auto: Option<AutoController>,
    link: Option<LinkHandle>,
    latest_sample: Option<Sample>,
    status: Option<MasStatus>,
    /// Drive of the newest `DP` sent; the base for relative steps
    manual_drive: u32,
    /// Drive last confirmed by the controller
    acked_drive: u32,
    stats: SessionStats,
    /// Bumped by every connect and close; events from older links are ignored
    generation: u64,
}

struct Shared {
    id: Uuid,
    source: TelemetrySource,
    config: MasConfig,
    ids: CommandIds,
    core: Mutex<Core>,
    notices: mpsc::UnboundedSender<Notice>,
    sink_errors: Arc<AtomicU64>,
}

/// Handle to one controller session. Clones share the session.
#[derive(Clone)]
pub struct SessionCoordinator {
    shared: Arc<Shared>,
}

impl SessionCoordinator {
    pub fn new(source: TelemetrySource, config: MasConfig) -> Self {
        let (notices, rx) = mpsc::unbounded_channel();
        let sink_errors = Arc::new(AtomicU64::new(0));
        spawn_notifier(rx, Arc::clone(&sink_errors));

        let core = Core {
            state: SessionState::Disconnected,
            target: config.target,
            target_explicit: config.target.target_hz > 0.0,
            auto: None,
            link: None,
            latest_sample: None,
            status: None,
            manual_drive: 0,
            acked_drive: 0,
            stats: SessionStats::default(),
            generation: 0,
        };

        let id = Uuid::new_v4();
        info!("Session {} created for {}", id, source);

        SessionCoordinator {
            shared: Arc::new(Shared {
                id,
                source,
                config,
                ids: CommandIds::new(),
                core: Mutex::new(core),
                notices,
                sink_errors,
            }),
        }
    }

    // ============================================================================================
    // SUBSCRIPTIONS
    // ============================================================================================

    /// Register an observer. It sees events from this point on.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        let _core = self.shared.core.lock();
        self.shared.notify(Notice::Observer(observer));
    }

    /// Register a sample sink such as the spin logger.
    pub fn add_sink(&self, sink: Arc<dyn SampleSink>) {
        let _core = self.shared.core.lock();
        self.shared.notify(Notice::Sink(sink));
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn source(&self) -> &TelemetrySource {
        &self.shared.source
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.lock().state
    }

    pub fn target(&self) -> ControlTarget {
        self.shared.core.lock().target
    }

    pub fn latest_sample(&self) -> Option<Sample> {
        self.shared.core.lock().latest_sample
    }

    pub fn status(&self) -> Option<MasStatus> {
        self.shared.core.lock().status
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.shared.core.lock().stats;
        stats.sink_errors = self.shared.sink_errors.load(Ordering::Relaxed);
        stats
    }

    // ============================================================================================
    // OPERATIONS
    // ============================================================================================

    /// Open the telemetry source. Fails if the session is not `Disconnected`
    /// or the source cannot be reached; either way the session ends up
    /// `Connected` or back in `Disconnected`.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let generation = {
            let mut core = self.shared.core.lock();
            if core.state != SessionState::Disconnected {
                return Err(invalid(core.state, Operation::Connect));
            }
            core.generation += 1;
            core.stats.connects += 1;
            self.shared.set_state(&mut core, SessionState::Connecting);
            core.generation
        };

        let (events_tx, events_rx) = mpsc::channel(self.shared.config.link.event_capacity.max(1));
        let opened = open_link(
            &self.shared.source,
            &self.shared.config,
            self.shared.ids.clone(),
            events_tx,
        )
        .await;

        let stale = {
            let mut core = self.shared.core.lock();
            let current = core.generation == generation && core.state == SessionState::Connecting;
            match opened {
                Ok(handle) if current => {
                    core.link = Some(handle);
                    self.shared.set_state(&mut core, SessionState::Connected);
                    tokio::spawn(dispatch(Arc::downgrade(&self.shared), generation, events_rx));
                    return Ok(());
                }
                Ok(handle) => handle,
                Err(e) => {
                    if current {
                        error!("Connect to {} failed: {}", self.shared.source, e);
                        self.shared.set_state(&mut core, SessionState::Disconnected);
                        self.shared
                            .notify(Notice::Error(ErrorKind::Connection, e.to_string()));
                    }
                    return Err(e.into());
                }
            }
        };

        // Closed while the connect was in progress.
        stale.shutdown().await;
        Err(ConnError::Lost.into())
    }

    /// `Connected -> ManualControl`. Puts the controller in manual mode.
    pub fn enable_manual(&self) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock();
        if core.state != SessionState::Connected {
            return Err(invalid(core.state, Operation::EnableManual));
        }
        if let Some(status) = core.status {
            core.manual_drive = status.drive_mbar;
            core.acked_drive = status.drive_mbar;
        }
        self.shared.submit(&mut core, Command::ManualMode)?;
        self.shared.set_state(&mut core, SessionState::ManualControl);
        Ok(())
    }

    /// `Connected -> AutoControl` toward the current target.
    ///
    /// Without an explicitly set target the loop holds the latest measured
    /// spin rate.
    pub fn enable_auto(&self) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock();
        self.start_auto(&mut core, None)
    }

    /// Set the target and enter `AutoControl` in one step. On failure
    /// neither the state nor the target changes.
    pub fn enable_auto_with(&self, target: ControlTarget) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock();
        self.start_auto(&mut core, Some(target))
    }

    fn start_auto(
        &self,
        core: &mut Core,
        requested: Option<ControlTarget>,
    ) -> Result<(), SessionError> {
        if core.state != SessionState::Connected {
            return Err(invalid(core.state, Operation::EnableAuto));
        }

        let target = match requested {
            Some(target) => target,
            None if core.target_explicit => core.target,
            None => {
                let measured = core.latest_sample.map(|s| s.frequency_hz).ok_or_else(|| {
                    StateError::InvalidTarget(
                        "no target set and no spin rate measured yet".to_string(),
                    )
                })?;
                core.target.with_target(measured)
            }
        };
        target.validate()?;

        let initial_drive = core.status.map_or(core.acked_drive, |s| s.drive_mbar);
        self.shared.submit(core, Command::ManualMode)?;

        core.target = target;
        if requested.is_some() {
            core.target_explicit = true;
        }
        core.auto = Some(AutoController::new(
            self.shared.config.auto.clone(),
            target,
            initial_drive,
        ));
        info!(
            "Auto control toward {:.0} Hz (±{:.0} Hz, step ≤ {:.0} mbar)",
            target.target_hz, target.tolerance_hz, target.max_step
        );
        self.shared.set_state(core, SessionState::AutoControl);
        Ok(())
    }

    /// `ManualControl | AutoControl -> Connected`.
    pub fn disable(&self) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock();
        if !core.state.is_controlling() {
            return Err(invalid(core.state, Operation::Disable));
        }
        core.auto = None;
        self.shared.set_state(&mut core, SessionState::Connected);
        Ok(())
    }

    /// `Faulted -> Connected`.
    pub fn acknowledge(&self) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock();
        if core.state != SessionState::Faulted {
            return Err(invalid(core.state, Operation::Acknowledge));
        }
        info!("Fault acknowledged");
        self.shared.set_state(&mut core, SessionState::Connected);
        Ok(())
    }

    /// Change only the target rate, keeping tolerance and step limits.
    pub fn set_target(&self, target_hz: f64) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock();
        let target = core.target.with_target(target_hz);
        Self::apply_target(&mut core, target)
    }

    /// Replace the control target. A running auto loop follows it at once.
    pub fn set_control_target(&self, target: ControlTarget) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock();
        Self::apply_target(&mut core, target)
    }

    fn apply_target(core: &mut Core, target: ControlTarget) -> Result<(), SessionError> {
        target.validate()?;
        core.target = target;
        core.target_explicit = true;
        if let Some(auto) = core.auto.as_mut() {
            auto.retarget(target);
            info!("Auto control retargeted to {:.0} Hz", target.target_hz);
        }
        Ok(())
    }

    /// Step the drive pressure by `delta_mbar` from the last commanded drive.
    ///
    /// Steps issued back to back accumulate; a step the controller does not
    /// accept moves the base back to the last acknowledged drive.
    pub fn manual_command(&self, delta_mbar: i32) -> Result<CommandId, SessionError> {
        let mut core = self.shared.core.lock();
        Self::require_manual(&core)?;
        let drive = self.pressure(i64::from(core.manual_drive) + i64::from(delta_mbar));
        self.command_drive(&mut core, drive)
    }

    /// Absolute drive pressure, rounded to the controller's granularity.
    pub fn set_drive(&self, mbar: u32) -> Result<CommandId, SessionError> {
        let mut core = self.shared.core.lock();
        Self::require_manual(&core)?;
        let drive = self.pressure(i64::from(mbar));
        self.command_drive(&mut core, drive)
    }

    fn command_drive(&self, core: &mut Core, drive: u16) -> Result<CommandId, SessionError> {
        let id = self.shared.submit(core, Command::SetDrivePressure(drive))?;
        core.manual_drive = u32::from(drive);
        Ok(id)
    }

    /// Absolute bearing pressure, rounded to the controller's granularity.
    pub fn set_bearing(&self, mbar: u32) -> Result<CommandId, SessionError> {
        let mut core = self.shared.core.lock();
        Self::require_manual(&core)?;
        let bearing = self.pressure(i64::from(mbar));
        Ok(self
            .shared
            .submit(&mut core, Command::SetBearingPressure(bearing))?)
    }

    /// Spin set point used by the controller's own regulation (`DS`).
    ///
    /// Rates above the plausible ceiling of the sampler are refused.
    pub fn set_spin_rate(&self, hz: u32) -> Result<CommandId, SessionError> {
        let mut core = self.shared.core.lock();
        Self::require_manual(&core)?;
        let ceiling = self.shared.config.sampler.max_hz;
        if f64::from(hz) > ceiling {
            return Err(StateError::InvalidTarget(format!(
                "spin rate {} Hz above the {:.0} Hz ceiling",
                hz, ceiling
            ))
            .into());
        }
        Ok(self.shared.submit(&mut core, Command::SetSpinRate(hz))?)
    }

    /// Hand spin regulation to the controller (`GA`). It then chases the
    /// `DS` set point by itself until the next `GM`, which `enable_manual`
    /// and `enable_auto` send.
    pub fn controller_auto(&self) -> Result<CommandId, SessionError> {
        let mut core = self.shared.core.lock();
        Self::require_manual(&core)?;
        Ok(self.shared.submit(&mut core, Command::AutoMode)?)
    }

    /// End the session. Pending receives are released and the source is
    /// stopped. Safe to call in any state, any number of times.
    pub async fn close(&self) {
        let link = {
            let mut core = self.shared.core.lock();
            core.generation += 1;
            core.auto = None;
            if core.state != SessionState::Disconnected {
                self.shared.set_state(&mut core, SessionState::Disconnected);
            }
            core.link.take()
        };

        if let Some(link) = link {
            link.shutdown().await;
            info!("Session {} closed", self.shared.id);
        }
    }

    fn require_manual(core: &Core) -> Result<(), StateError> {
        match core.state {
            SessionState::ManualControl => Ok(()),
            SessionState::AutoControl => Err(StateError::AutoActive),
            from => Err(StateError::InvalidTransition {
                from,
                attempted: Operation::ManualCommand,
            }),
        }
    }

    fn pressure(&self, mbar: i64) -> u16 {
        let auto = &self.shared.config.auto;
        quantize_pressure(mbar, auto.drive_resolution_mbar, auto.drive_ceiling_mbar)
    }
}

fn invalid(from: SessionState, attempted: Operation) -> SessionError {
    StateError::InvalidTransition { from, attempted }.into()
}

// ================================================================================================
// EVENT HANDLING
// ================================================================================================

impl Shared {
    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            debug!("Notifier stopped; dropping notice");
        }
    }

    fn set_state(&self, core: &mut Core, state: SessionState) {
        if core.state == state {
            return;
        }
        info!("Session {}: {} -> {}", self.id, core.state, state);
        core.state = state;
        self.notify(Notice::State(state));
    }

    fn submit(&self, core: &mut Core, command: Command) -> Result<CommandId, ConnError> {
        let link = core.link.as_ref().ok_or(ConnError::Lost)?;
        let id = self.ids.next_id();
        link.submit(CommandRequest { id, command })?;
        core.stats.commands_sent += 1;
        debug!("Queued {} {}", id, command);
        Ok(id)
    }

    fn apply(&self, generation: u64, event: LinkEvent) {
        let mut core = self.core.lock();
        if core.generation != generation {
            return;
        }

        match event {
            LinkEvent::Sample(sample) => {
                core.latest_sample = Some(sample);
                core.stats.samples_delivered += 1;
                self.notify(Notice::Sample(sample));
                if core.state == SessionState::AutoControl {
                    self.run_auto(&mut core, &sample);
                }
            }
            LinkEvent::Status(status) => {
                if core.status != Some(status) {
                    core.status = Some(status);
                    self.notify(Notice::Status(status));
                }
            }
            LinkEvent::Rejected(e) => {
                core.stats.samples_rejected += 1;
                self.notify(Notice::Error(ErrorKind::Telemetry, e.to_string()));
            }
            LinkEvent::Completed { id, command, outcome } => {
                if let Some(auto) = core.auto.as_mut() {
                    auto.on_outcome(id, outcome.is_acked());
                }
                match outcome {
                    CommandOutcome::Acked => {
                        if let Command::SetDrivePressure(mbar) = command {
                            core.acked_drive = u32::from(mbar);
                            if core.state != SessionState::ManualControl {
                                core.manual_drive = core.acked_drive;
                            }
                        }
                    }
                    failed => {
                        if let Command::SetDrivePressure(_) = command {
                            core.manual_drive = core.acked_drive;
                        }
                        core.stats.commands_failed += 1;
                        warn!("Command {} {} {}", id, command, failed);
                        self.notify(Notice::Error(
                            ErrorKind::Command,
                            format!("{} {} {}", command, id, failed),
                        ));
                    }
                }
            }
            LinkEvent::Gap => self.notify(Notice::Gap),
            LinkEvent::Warning(kind, detail) => {
                self.notify(Notice::Error(kind, detail));
            }
            LinkEvent::Lost(e) => {
                core.auto = None;
                drop(core.link.take());
                self.set_state(&mut core, SessionState::Disconnected);
                self.notify(Notice::Error(ErrorKind::Connection, e.to_string()));
            }
        }
    }

    fn run_auto(&self, core: &mut Core, sample: &Sample) {
        let Some(auto) = core.auto.as_mut() else {
            return;
        };

        match auto.on_sample(sample) {
            ControlDecision::Adjust(adjustment) => {
                let id = self.ids.next_id();
                let command = Command::SetDrivePressure(adjustment.drive_mbar);
                let submitted = core
                    .link
                    .as_ref()
                    .ok_or(ConnError::Lost)
                    .and_then(|link| link.submit(CommandRequest { id, command }));
                match submitted {
                    Ok(()) => {
                        auto.issued(id, adjustment.drive_mbar);
                        core.stats.commands_sent += 1;
                        debug!(
                            "Auto {} {} (error {:+.0} Hz, step {:+} mbar)",
                            id, command, adjustment.error_hz, adjustment.step_mbar
                        );
                    }
                    Err(e) => {
                        self.notify(Notice::Error(ErrorKind::Connection, e.to_string()));
                    }
                }
            }
            ControlDecision::Stalled { cycles } => {
                let detail = format!(
                    "no progress toward {:.0} Hz after {} control cycles at {:.0} Hz; \
                     automatic control stopped",
                    auto.target().target_hz,
                    cycles,
                    sample.frequency_hz
                );
                error!("{}", detail);
                core.auto = None;
                self.set_state(core, SessionState::Faulted);
                self.notify(Notice::Error(ErrorKind::ControlStall, detail));
            }
            ControlDecision::Saturated { drive_mbar } => {
                debug!("Auto control holding at drive limit {} mbar", drive_mbar);
            }
            ControlDecision::Idle | ControlDecision::InBand => {}
        }
    }
}

/// Feeds one link's events into the session until the link stops or the
/// session is dropped.
async fn dispatch(shared: Weak<Shared>, generation: u64, mut events: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(session) = shared.upgrade() else {
            break;
        };
        session.apply(generation, event);
    }
    debug!("Event dispatch for link generation {} finished", generation);
}

// ================================================================================================
// NOTIFIER
// ================================================================================================

fn spawn_notifier(mut rx: mpsc::UnboundedReceiver<Notice>, sink_errors: Arc<AtomicU64>) {
    let spawned = std::thread::Builder::new()
        .name("session-notify".to_string())
        .spawn(move || {
            let mut observers: Vec<Arc<dyn SessionObserver>> = Vec::new();
            let mut sinks: Vec<Arc<dyn SampleSink>> = Vec::new();

            while let Some(notice) = rx.blocking_recv() {
                match notice {
                    Notice::Sample(sample) => {
                        for observer in &observers {
                            observer.on_sample(&sample);
                        }
                        for sink in &sinks {
                            if let Err(e) = sink.on_sample(&sample) {
                                sink_errors.fetch_add(1, Ordering::Relaxed);
                                let detail = e.to_string();
                                for observer in &observers {
                                    observer.on_error(ErrorKind::Log, &detail);
                                }
                            }
                        }
                    }
                    Notice::State(state) => {
                        for observer in &observers {
                            observer.on_state_change(state);
                        }
                    }
                    Notice::Status(status) => {
                        for observer in &observers {
                            observer.on_status(&status);
                        }
                    }
                    Notice::Error(kind, detail) => {
                        for observer in &observers {
                            observer.on_error(kind, &detail);
                        }
                    }
                    Notice::Gap => {
                        for observer in &observers {
                            observer.on_gap();
                        }
                    }
                    Notice::Observer(observer) => observers.push(observer),
                    Notice::Sink(sink) => sinks.push(sink),
                }
            }
        });

    if let Err(e) = spawned {
        error!("Failed to start session notifier: {}", e);
    }
}
