//! Retention-bounded spin history backing the live plot.

use log::{debug, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::writer::{format_line, log_file_name};
use crate::error::LogError;
use crate::session::SessionObserver;
use crate::types::{Sample, SessionState, Timestamp};

/// Default retention: one day of plot data.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// One plot point. `None` breaks the line (link down).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub timestamp: Timestamp,
    pub frequency_hz: Option<f64>,
}

impl HistoryPoint {
    pub fn is_gap(&self) -> bool {
        self.frequency_hz.is_none()
    }
}

pub struct SpinHistory {
    retention: Duration,
    points: Mutex<VecDeque<HistoryPoint>>,
}

impl Default for SpinHistory {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl SpinHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            points: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_sample(&self, sample: &Sample) {
        self.push(HistoryPoint {
            timestamp: sample.timestamp,
            frequency_hz: Some(sample.frequency_hz),
        });
    }

    /// Break the plot line. Repeated gaps collapse into one.
    pub fn push_gap(&self) {
        let mut points = self.points.lock();
        if points.back().map_or(true, HistoryPoint::is_gap) {
            return;
        }
        points.push_back(HistoryPoint {
            timestamp: Timestamp::now(),
            frequency_hz: None,
        });
    }

    fn push(&self, point: HistoryPoint) {
        let mut points = self.points.lock();
        points.push_back(point);

        while let Some(front) = points.front() {
            if point.timestamp.saturating_duration_since(front.timestamp) > self.retention {
                points.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    pub fn points(&self) -> Vec<HistoryPoint> {
        self.points.lock().iter().copied().collect()
    }

    /// Points within `window` of the newest point.
    pub fn active_range(&self, window: Duration) -> Vec<HistoryPoint> {
        let points = self.points.lock();
        let Some(newest) = points.back().map(|p| p.timestamp) else {
            return Vec::new();
        };
        points
            .iter()
            .filter(|p| newest.saturating_duration_since(p.timestamp) <= window)
            .copied()
            .collect()
    }

    pub fn clear(&self) {
        self.points.lock().clear();
    }

    /// Write every retained point to `dir` in spin log format.
    ///
    /// Returns `None` when there is nothing to save.
    pub fn save_history(&self, dir: &Path) -> Result<Option<PathBuf>, LogError> {
        let points = self.points();
        let (Some(first), Some(last)) = (points.first(), points.last()) else {
            debug!("Spin history empty; nothing saved");
            return Ok(None);
        };

        let path = dir.join(log_file_name(
            &first.timestamp.wall_clock(),
            &last.timestamp.wall_clock(),
        ));
        let write_failed =
            |e: std::io::Error| LogError::WriteFailed(format!("{}: {}", path.display(), e));

        let mut writer = BufWriter::new(File::create(&path).map_err(write_failed)?);
        for point in &points {
            let line = format_line(&point.timestamp.wall_clock(), point.frequency_hz);
            writer.write_all(line.as_bytes()).map_err(write_failed)?;
        }
        writer.flush().map_err(write_failed)?;

        info!("Saved {} history points to {}", points.len(), path.display());
        Ok(Some(path))
    }
}

impl SessionObserver for SpinHistory {
    fn on_sample(&self, sample: &Sample) {
        self.push_sample(sample);
    }

    fn on_state_change(&self, state: SessionState) {
        if state == SessionState::Disconnected {
            self.push_gap();
        }
    }

    fn on_gap(&self) {
        self.push_gap();
    }
}
