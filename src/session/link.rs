//! # Live Controller Link
//!
//! One tokio task per connection multiplexes, with `select!`:
//! - socket reads, decoded into frames and turned into samples
//! - the reply deadline of the command in flight
//! - operator commands queued by the coordinator
//! - the poll timer (`AS` then `VD` every poll interval)
//! - the shutdown signal
//!
//! Exactly one command is on the wire at a time. Operator commands go ahead
//! of queued polls.
//!
//! # Recovery
//!
//! When a reply misses its deadline the link probes with `MA` for a bounded
//! window. If the controller answers the link settles, discards stray bytes
//! and resumes polling; otherwise it reports [`ConnError::Timeout`] and stops.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use super::source::{CommandOutcome, CommandRequest, LinkEvent, LinkHandle};
use crate::connection::{
    wait_for_shutdown, ChunkReceiver, Connection, DEFAULT_CONNECT_TIMEOUT,
};
use crate::error::{ConnError, ErrorKind, ProtocolError};
use crate::protocol::{encode, Command, Frame, FrameDecoder};
use crate::telemetry::{SamplerConfig, TelemetrySampler};
use crate::types::{CommandId, CommandIds, ConnectionConfig, MasStatus};

/// Live link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bound on the TCP connect
    pub connect_timeout_ms: u64,

    /// Bound on each controller reply
    pub reply_timeout_ms: u64,

    /// Status poll cadence
    pub poll_interval_ms: u64,

    /// Recovery probes run for this many reply timeouts
    pub recovery_factor: u32,

    /// Quiet period after a successful link test; bytes arriving in it are dropped
    pub settle_ms: u64,

    /// Events buffered between the link and the coordinator
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            reply_timeout_ms: 3000,
            poll_interval_ms: 1000,
            recovery_factor: 4,
            settle_ms: 500,
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn recovery_window(&self) -> Duration {
        self.reply_timeout() * self.recovery_factor.max(1)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

// ================================================================================================
// LINK TASK
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Poll,
    Operator,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: CommandId,
    command: Command,
    origin: Origin,
    deadline: Instant,
}

/// Why the link task stopped.
#[derive(Debug)]
enum Exit {
    Shutdown,
    Lost(ConnError),
}

impl From<ConnError> for Exit {
    fn from(e: ConnError) -> Self {
        Exit::Lost(e)
    }
}

/// Result of a single request/response exchange outside the main loop.
enum Exchange {
    Frame(Result<Frame, ProtocolError>),
    TimedOut,
}

struct LivePoller {
    conn: Connection,
    chunks: ChunkReceiver,
    decoder: FrameDecoder,
    sampler: TelemetrySampler,
    config: LinkConfig,
    ids: CommandIds,
    commands: mpsc::UnboundedReceiver<CommandRequest>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<LinkEvent>,
    polls: VecDeque<Command>,
    in_flight: Option<InFlight>,
    status: MasStatus,
    published: Option<MasStatus>,
}

/// Connect, verify the controller answers, and start the link task.
pub(crate) async fn open_live(
    connection: &ConnectionConfig,
    config: LinkConfig,
    sampler: SamplerConfig,
    ids: CommandIds,
    events: mpsc::Sender<LinkEvent>,
) -> Result<LinkHandle, ConnError> {
    let (conn, chunks) = Connection::connect(connection, config.connect_timeout()).await?;
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut poller = LivePoller {
        conn,
        chunks,
        decoder: FrameDecoder::new(),
        sampler: TelemetrySampler::new(sampler),
        config,
        ids,
        commands: command_rx,
        shutdown: shutdown_rx,
        events,
        polls: VecDeque::new(),
        in_flight: None,
        status: MasStatus::default(),
        published: None,
    };

    if let Err(e) = poller.handshake().await {
        warn!("Controller at {} failed the link test: {}", connection.address(), e);
        poller.conn.close().await;
        return Err(e);
    }

    info!("Link to {} established", connection.address());
    let task = tokio::spawn(poller.run());
    Ok(LinkHandle::new(command_tx, shutdown_tx, task))
}

impl LivePoller {
    async fn run(mut self) {
        let exit = match self.serve().await {
            Ok(()) => Exit::Shutdown,
            Err(exit) => exit,
        };

        if let Some(in_flight) = self.in_flight.take() {
            if in_flight.origin == Origin::Operator {
                let _ = self
                    .events
                    .send(LinkEvent::Completed {
                        id: in_flight.id,
                        command: in_flight.command,
                        outcome: CommandOutcome::Failed("link closed".to_string()),
                    })
                    .await;
            }
        }

        match exit {
            Exit::Shutdown => info!("Link to {} shut down", self.conn.peer()),
            Exit::Lost(e) => {
                warn!("Link to {} lost: {}", self.conn.peer(), e);
                let _ = self.events.send(LinkEvent::Lost(e)).await;
            }
        }

        self.conn.close().await;
    }

    /// Main loop. Returns `Ok` on an orderly shutdown.
    async fn serve(&mut self) -> Result<(), Exit> {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.in_flight.is_none() {
                self.dispatch_next().await?;
            }

            let deadline = self.in_flight.map(|f| f.deadline);
            let idle = self.in_flight.is_none();

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => return Ok(()),
                chunk = self.chunks.next_chunk() => {
                    let bytes = chunk?;
                    self.ingest(&bytes).await?;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_reply_timeout().await?;
                }
                request = self.commands.recv(), if idle => match request {
                    Some(request) => {
                        self.dispatch(request.id, request.command, Origin::Operator).await?;
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick(), if idle => {
                    if self.polls.is_empty() {
                        self.polls.extend([Command::AllStatus, Command::ReadSpinSet]);
                    }
                }
            }
        }
    }

    async fn dispatch_next(&mut self) -> Result<(), Exit> {
        if let Ok(request) = self.commands.try_recv() {
            return self
                .dispatch(request.id, request.command, Origin::Operator)
                .await;
        }
        if let Some(command) = self.polls.pop_front() {
            let id = self.ids.next_id();
            return self.dispatch(id, command, Origin::Poll).await;
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        id: CommandId,
        command: Command,
        origin: Origin,
    ) -> Result<(), Exit> {
        debug!("-> {} {}", id, command);
        self.decoder.expect_reply(id, command);

        if let Err(e) = self.conn.send(&encode(&command)).await {
            if origin == Origin::Operator {
                self.emit(LinkEvent::Completed {
                    id,
                    command,
                    outcome: CommandOutcome::Failed(e.to_string()),
                })
                .await?;
            }
            return Err(Exit::Lost(e));
        }

        self.in_flight = Some(InFlight {
            id,
            command,
            origin,
            deadline: Instant::now() + self.config.reply_timeout(),
        });
        Ok(())
    }

    async fn ingest(&mut self, bytes: &[u8]) -> Result<(), Exit> {
        for decoded in self.decoder.decode(bytes) {
            match decoded {
                Ok(frame) => {
                    let in_flight = self.complete(Some(frame.command_id()));
                    self.on_frame(frame, in_flight).await?;
                }
                Err(e) => {
                    let ProtocolError::Malformed { command_id, .. } = &e;
                    if let Some(in_flight) = self.complete(*command_id) {
                        if in_flight.origin == Origin::Operator {
                            self.emit(LinkEvent::Completed {
                                id: in_flight.id,
                                command: in_flight.command,
                                outcome: CommandOutcome::Failed(e.to_string()),
                            })
                            .await?;
                        }
                    }
                    warn!("{}", e);
                    self.emit(LinkEvent::Warning(ErrorKind::Protocol, e.to_string()))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Take the in-flight command if `id` refers to it.
    fn complete(&mut self, id: Option<CommandId>) -> Option<InFlight> {
        match (self.in_flight, id) {
            (Some(in_flight), Some(id)) if in_flight.id == id => self.in_flight.take(),
            _ => None,
        }
    }

    async fn on_frame(&mut self, frame: Frame, in_flight: Option<InFlight>) -> Result<(), Exit> {
        match frame {
            Frame::Telemetry {
                frequency_raw,
                pressures,
                ..
            } => {
                match self.sampler.sample(frequency_raw) {
                    Ok(sample) => {
                        self.status.spin_hz = sample.frequency_hz;
                        self.emit(LinkEvent::Sample(sample)).await?;
                    }
                    Err(e) => {
                        debug!("Dropped reading: {}", e);
                        self.emit(LinkEvent::Rejected(e)).await?;
                    }
                }
                self.status.drive_mbar = pressures.drive_mbar;
                self.status.bearing_mbar = pressures.bearing_mbar;
                self.status.sense_mbar = pressures.sense_mbar;
                self.publish_status().await?;
            }
            Frame::Status { fields, .. } => {
                match fields.last().and_then(|v| v.parse::<f64>().ok()) {
                    Some(set_hz) => {
                        self.status.spin_set_hz = self.sampler.calibrate(set_hz);
                        self.publish_status().await?;
                    }
                    None => debug!("Ignoring set point reply {:?}", fields),
                }
            }
            Frame::Ack { .. } => {
                if let Some(in_flight) = in_flight.filter(|f| f.origin == Origin::Operator) {
                    debug!("<- {} OK", in_flight.id);
                    self.emit(LinkEvent::Completed {
                        id: in_flight.id,
                        command: in_flight.command,
                        outcome: CommandOutcome::Acked,
                    })
                    .await?;
                }
            }
            Frame::Nack { command_id, reason } => match in_flight {
                Some(in_flight) if in_flight.origin == Origin::Operator => {
                    self.emit(LinkEvent::Completed {
                        id: in_flight.id,
                        command: in_flight.command,
                        outcome: CommandOutcome::Nacked(reason),
                    })
                    .await?;
                }
                _ => {
                    self.emit(LinkEvent::Warning(
                        ErrorKind::Command,
                        format!("controller refused {}: {}", command_id, reason),
                    ))
                    .await?;
                }
            },
        }
        Ok(())
    }

    async fn publish_status(&mut self) -> Result<(), Exit> {
        if self.published == Some(self.status) {
            return Ok(());
        }
        self.published = Some(self.status);
        self.emit(LinkEvent::Status(self.status)).await
    }

    async fn on_reply_timeout(&mut self) -> Result<(), Exit> {
        if let Some(in_flight) = self.in_flight.take() {
            warn!(
                "No reply to {} {} within {:?}",
                in_flight.command,
                in_flight.id,
                self.config.reply_timeout()
            );
            if in_flight.origin == Origin::Operator {
                self.emit(LinkEvent::Completed {
                    id: in_flight.id,
                    command: in_flight.command,
                    outcome: CommandOutcome::TimedOut,
                })
                .await?;
            }
            self.emit(LinkEvent::Warning(
                ErrorKind::Connection,
                format!("no reply to {}; testing link", in_flight.command),
            ))
            .await?;
        }
        self.recover().await
    }

    async fn recover(&mut self) -> Result<(), Exit> {
        let window_end = Instant::now() + self.config.recovery_window();

        loop {
            let now = Instant::now();
            if now >= window_end {
                return Err(Exit::Lost(ConnError::Timeout));
            }
            self.decoder.reset();
            let id = self.ids.next_id();
            let deadline = (now + self.config.reply_timeout()).min(window_end);
            match self.exchange(id, Command::LinkTest, deadline).await? {
                Exchange::Frame(Ok(Frame::Ack { .. })) => break,
                Exchange::Frame(other) => debug!("Link test answered with {:?}", other),
                Exchange::TimedOut => debug!("Link test {} unanswered", id),
            }
        }

        // Anything arriving while the controller settles belongs to an
        // abandoned exchange.
        let settled = Instant::now() + self.config.settle();
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => return Err(Exit::Shutdown),
                chunk = self.chunks.next_chunk() => {
                    let stray = chunk?;
                    debug!("Discarding {} stray bytes", stray.len());
                }
                _ = sleep_until(settled) => break,
            }
        }
        self.decoder.reset();
        self.polls.clear();

        info!("Link to {} recovered", self.conn.peer());
        Ok(())
    }

    /// Send one command and wait for its reply outside the main loop.
    async fn exchange(
        &mut self,
        id: CommandId,
        command: Command,
        deadline: Instant,
    ) -> Result<Exchange, Exit> {
        self.decoder.expect_reply(id, command);
        self.conn.send(&encode(&command)).await?;

        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Exchange::Frame(frame));
            }
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => return Err(Exit::Shutdown),
                chunk = self.chunks.next_chunk() => self.decoder.push(&chunk?),
                _ = sleep_until(deadline) => return Ok(Exchange::TimedOut),
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), ConnError> {
        let id = self.ids.next_id();
        let deadline = Instant::now() + self.config.reply_timeout();
        let reply = match self.exchange(id, Command::LinkTest, deadline).await {
            Ok(reply) => reply,
            Err(Exit::Shutdown) => return Err(ConnError::Lost),
            Err(Exit::Lost(e)) => return Err(e),
        };
        self.decoder.reset();

        match reply {
            Exchange::Frame(Ok(Frame::Ack { .. })) => Ok(()),
            Exchange::Frame(Ok(Frame::Nack { reason, .. })) => Err(ConnError::Refused(format!(
                "controller rejected link test: {}",
                reason
            ))),
            Exchange::Frame(Ok(other)) => Err(ConnError::Refused(format!(
                "unexpected link test reply {:?}",
                other
            ))),
            Exchange::Frame(Err(e)) => Err(ConnError::Refused(e.to_string())),
            Exchange::TimedOut => Err(ConnError::Timeout),
        }
    }

    async fn emit(&self, event: LinkEvent) -> Result<(), Exit> {
        self.events.send(event).await.map_err(|_| Exit::Shutdown)
    }
}
