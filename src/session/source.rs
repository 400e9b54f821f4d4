//! Telemetry source contract.
//!
//! A source delivers [`LinkEvent`]s to the coordinator and executes the
//! commands it is handed, one at a time. The live controller link and the
//! offline simulator both satisfy it, so nothing above this layer can tell
//! them apart.

use log::{debug, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::link;
use super::offline::{self, OfflineConfig};
use crate::config::MasConfig;
use crate::error::{ConnError, ErrorKind, TelemetryError};
use crate::protocol::Command;
use crate::types::{CommandId, CommandIds, ConnectionConfig, MasStatus, Sample};

/// Bound on waiting for a source task to stop before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Where samples come from. Chosen once, when the session is built.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetrySource {
    /// A Bruker controller over TCP
    Live(ConnectionConfig),
    /// Synthetic spinner, no hardware
    Offline(OfflineConfig),
}

impl fmt::Display for TelemetrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetrySource::Live(config) => write!(f, "controller at {}", config.address()),
            TelemetrySource::Offline(config) => write!(f, "offline {}", config.profile),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRequest {
    pub id: CommandId,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Acked,
    Nacked(String),
    TimedOut,
    Failed(String),
}

impl CommandOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, CommandOutcome::Acked)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Acked => f.write_str("acknowledged"),
            CommandOutcome::Nacked(reason) => write!(f, "refused ({})", reason),
            CommandOutcome::TimedOut => f.write_str("timed out"),
            CommandOutcome::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Everything a source reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Sample(Sample),
    Status(MasStatus),
    /// Implausible reading, dropped
    Rejected(TelemetryError),
    Completed {
        id: CommandId,
        command: Command,
        outcome: CommandOutcome,
    },
    /// Break in the sample stream that is not a disconnect
    Gap,
    /// Recovered problem worth reporting
    Warning(ErrorKind, String),
    /// The source stopped; no events follow
    Lost(ConnError),
}

/// Control side of a running source task.
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<CommandRequest>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LinkHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<CommandRequest>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            shutdown,
            task: Some(task),
        }
    }

    /// Queue a command. Commands run in submission order.
    pub fn submit(&self, request: CommandRequest) -> Result<(), ConnError> {
        self.commands.send(request).map_err(|_| ConnError::Lost)
    }

    /// Stop the task, aborting it if it does not finish promptly.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => debug!("Telemetry source stopped"),
                Ok(Err(e)) => warn!("Telemetry source task failed: {}", e),
                Err(_) => {
                    warn!("Telemetry source did not stop within {:?}; aborting", SHUTDOWN_GRACE);
                    task.abort();
                }
            }
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Start the configured source. Returns once it is delivering events.
pub(crate) async fn open_link(
    source: &TelemetrySource,
    config: &MasConfig,
    ids: CommandIds,
    events: mpsc::Sender<LinkEvent>,
) -> Result<LinkHandle, ConnError> {
    match source {
        TelemetrySource::Live(connection) => {
            link::open_live(connection, config.link.clone(), config.sampler.clone(), ids, events)
                .await
        }
        TelemetrySource::Offline(offline) => Ok(offline::open_offline(offline.clone(), events)),
    }
}
