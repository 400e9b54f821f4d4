//! # Spin Log Writer
//!
//! Appends samples to `{start}__{end}_spin_log.dat` on a dedicated thread.
//! Samples reach the writer through a bounded queue, so a slow disk never
//! slows the live feed: when the queue is full the sample is dropped from the
//! log only and [`LogError::Backpressure`] is returned.

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::LogError;
use crate::session::SampleSink;
use crate::types::Sample;

/// Spin log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinLogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,

    /// Samples buffered between the feed and the writer thread
    pub queue_capacity: usize,

    /// Flush and rename the file every N samples
    pub flush_every: usize,

    /// Gzip the finished log when logging ends
    pub compress_on_close: bool,

    /// Buffer size for writes (bytes)
    pub buffer_size: usize,
}

impl Default for SpinLogConfig {
    fn default() -> Self {
        SpinLogConfig {
            log_dir: PathBuf::from("."),
            queue_capacity: 1024,
            flush_every: 60,
            compress_on_close: false,
            buffer_size: 8192,
        }
    }
}

/// Time format used in file names and log lines
pub const TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Name of a log covering `start` to `end`.
pub fn log_file_name(start: &DateTime<Local>, end: &DateTime<Local>) -> String {
    format!(
        "{}__{}_spin_log.dat",
        start.format(TIME_FORMAT),
        end.format(TIME_FORMAT)
    )
}

/// One log line: wall-clock time and the spin rate right-aligned to 6 columns.
pub fn format_line(time: &DateTime<Local>, frequency_hz: Option<f64>) -> String {
    let value = match frequency_hz {
        Some(hz) => format!("{:.0}", hz),
        None => "--".to_string(),
    };
    format!("{} {:>6}\n", time.format(TIME_FORMAT), value)
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    write_failures: AtomicU64,
}

/// Background spin logger.
pub struct SpinLogger {
    tx: Mutex<Option<mpsc::Sender<Sample>>>,
    worker: Mutex<Option<JoinHandle<Option<PathBuf>>>>,
    failure: Arc<Mutex<Option<LogError>>>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl SpinLogger {
    /// Start logging into `config.log_dir`, creating it if needed.
    pub fn start(config: SpinLogConfig) -> Result<Self, LogError> {
        fs::create_dir_all(&config.log_dir).map_err(|e| {
            LogError::WriteFailed(format!(
                "cannot create log directory {}: {}",
                config.log_dir.display(),
                e
            ))
        })?;

        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let failure = Arc::new(Mutex::new(None));
        let counters = Arc::new(Counters::default());

        let worker = {
            let failure = Arc::clone(&failure);
            let counters = Arc::clone(&counters);
            std::thread::Builder::new()
                .name("spin-log".to_string())
                .spawn(move || run_writer(config, rx, failure, counters))
                .map_err(|e| LogError::WriteFailed(format!("cannot start log writer: {}", e)))?
        };

        info!("Spin logging started");
        Ok(SpinLogger {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            failure,
            counters,
            capacity,
        })
    }

    /// Queue a sample without blocking.
    ///
    /// A write failure on the writer thread is returned once, on the next call.
    pub fn log(&self, sample: &Sample) -> Result<(), LogError> {
        if let Some(failure) = self.failure.lock().take() {
            return Err(failure);
        }

        let tx = self.tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| LogError::WriteFailed("spin log already finished".to_string()))?;

        match tx.try_send(*sample) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(LogError::Backpressure {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(LogError::WriteFailed(
                "spin log writer stopped".to_string(),
            )),
        }
    }

    /// Drain the queue, close the file and return the final path.
    ///
    /// Later calls to [`SpinLogger::log`] fail; a second finish returns `None`.
    pub fn finish(&self) -> Result<Option<PathBuf>, LogError> {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        let path = match worker {
            Some(worker) => worker
                .join()
                .map_err(|_| LogError::WriteFailed("spin log writer panicked".to_string()))?,
            None => None,
        };
        if let Some(failure) = self.failure.lock().take() {
            return Err(failure);
        }
        Ok(path)
    }

    pub fn stats(&self) -> SpinLogStats {
        SpinLogStats {
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SpinLogger {
    fn drop(&mut self) {
        let running = self.worker.lock().is_some();
        if running {
            if let Err(e) = self.finish() {
                warn!("Spin log closed with error: {}", e);
            }
        }
    }
}

impl SampleSink for SpinLogger {
    fn on_sample(&self, sample: &Sample) -> Result<(), LogError> {
        self.log(sample)
    }
}

/// Statistics for the spin log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpinLogStats {
    pub written: u64,
    pub dropped: u64,
    pub write_failures: u64,
}

// ================================================================================================
// WRITER THREAD
// ================================================================================================

struct SpinLogFile {
    writer: BufWriter<File>,
    path: PathBuf,
    start: DateTime<Local>,
    end: DateTime<Local>,
    lines_since_flush: usize,
}

impl SpinLogFile {
    fn open(dir: &Path, start: DateTime<Local>, buffer_size: usize) -> Result<Self, String> {
        let path = dir.join(log_file_name(&start, &start));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;

        Ok(SpinLogFile {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
            start,
            end: start,
            lines_since_flush: 0,
        })
    }

    fn append(&mut self, sample: &Sample) -> Result<(), String> {
        let time = sample.timestamp.wall_clock();
        self.writer
            .write_all(format_line(&time, Some(sample.frequency_hz)).as_bytes())
            .map_err(|e| format!("failed to write {}: {}", self.path.display(), e))?;
        self.end = time;
        self.lines_since_flush += 1;
        Ok(())
    }

    /// Flush and rename the file so its name covers every line written.
    fn checkpoint(&mut self, dir: &Path) -> Result<(), String> {
        self.writer
            .flush()
            .map_err(|e| format!("failed to flush {}: {}", self.path.display(), e))?;
        self.lines_since_flush = 0;

        let renamed = dir.join(log_file_name(&self.start, &self.end));
        if renamed != self.path {
            fs::rename(&self.path, &renamed)
                .map_err(|e| format!("failed to rename {}: {}", self.path.display(), e))?;
            debug!("Spin log now {}", renamed.display());
            self.path = renamed;
        }
        Ok(())
    }
}

fn run_writer(
    config: SpinLogConfig,
    mut rx: mpsc::Receiver<Sample>,
    failure: Arc<Mutex<Option<LogError>>>,
    counters: Arc<Counters>,
) -> Option<PathBuf> {
    let report = |message: String| {
        error!("{}", message);
        counters.write_failures.fetch_add(1, Ordering::Relaxed);
        *failure.lock() = Some(LogError::WriteFailed(message));
    };

    let mut file: Option<SpinLogFile> = None;

    while let Some(sample) = rx.blocking_recv() {
        if file.is_none() {
            match SpinLogFile::open(
                &config.log_dir,
                sample.timestamp.wall_clock(),
                config.buffer_size,
            ) {
                Ok(opened) => file = Some(opened),
                Err(message) => {
                    report(message);
                    continue;
                }
            }
        }

        let Some(current) = file.as_mut() else {
            continue;
        };
        match current.append(&sample) {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(message) => report(message),
        }
        if current.lines_since_flush >= config.flush_every.max(1) {
            if let Err(message) = current.checkpoint(&config.log_dir) {
                report(message);
            }
        }
    }

    let mut current = file?;
    if let Err(message) = current.checkpoint(&config.log_dir) {
        report(message);
        return Some(current.path);
    }
    drop(current.writer);

    if config.compress_on_close {
        match compress_file(&current.path) {
            Ok(compressed) => current.path = compressed,
            Err(message) => report(message),
        }
    }

    info!("Spin log closed: {}", current.path.display());
    Some(current.path)
}

/// Compress a finished log (gzip) and remove the original.
fn compress_file(path: &Path) -> Result<PathBuf, String> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let input = fs::read(path).map_err(|e| format!("Failed to read file for compression: {}", e))?;

    let output_path = path.with_extension("dat.gz");
    let output_file = File::create(&output_path)
        .map_err(|e| format!("Failed to create compressed file: {}", e))?;

    let mut encoder = GzEncoder::new(output_file, Compression::default());
    encoder
        .write_all(&input)
        .map_err(|e| format!("Failed to compress: {}", e))?;
    encoder
        .finish()
        .map_err(|e| format!("Failed to finish compression: {}", e))?;

    fs::remove_file(path).ok();

    Ok(output_path)
}
