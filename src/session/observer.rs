//! Subscription interfaces for front ends and log sinks.

use crate::error::{ErrorKind, LogError};
use crate::types::{MasStatus, Sample, SessionState};

/// Receives everything the coordinator reports.
///
/// Calls arrive on one notification thread in the order events happened, so
/// implementations see samples in arrival order and exactly once. Keep them
/// short; a slow observer delays the ones after it.
pub trait SessionObserver: Send + Sync {
    fn on_sample(&self, _sample: &Sample) {}

    fn on_state_change(&self, _state: SessionState) {}

    fn on_status(&self, _status: &MasStatus) {}

    /// The source paused between samples; plots should break the line here.
    fn on_gap(&self) {}

    fn on_error(&self, _kind: ErrorKind, _detail: &str) {}
}

/// Sample consumer that may refuse a sample, e.g. a full log queue.
///
/// Errors are reported to observers as [`ErrorKind::Log`] and never affect
/// delivery to anyone else.
pub trait SampleSink: Send + Sync {
    fn on_sample(&self, sample: &Sample) -> Result<(), LogError>;
}
