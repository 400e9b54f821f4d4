//! # MAS Monitor
//!
//! Command-line front end for the MAS control engine.
//!
//! Usage:
//!   mas-monitor --host mas.lab --port 4001
//!   mas-monitor --symbols ./symbols.sh --log-dir /data/spin
//!   mas-monitor --offline plant --auto 5000 --duration 60

use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mas_control::config::{find_symbols_file, resolve_connection};
use mas_control::session::{OfflineConfig, OfflineProfile};
use mas_control::telemetry::{SpinHistory, SpinLogger};
use mas_control::{
    ErrorKind, MasConfig, MasStatus, Sample, SessionCoordinator, SessionObserver, SessionState,
    TelemetrySource,
};

#[derive(Parser)]
#[command(name = "mas-monitor")]
#[command(about = "Monitor and control a Bruker MAS controller", long_about = None)]
struct Cli {
    /// Controller host (overrides the symbols file)
    #[arg(long)]
    host: Option<String>,

    /// Controller port (overrides the symbols file)
    #[arg(long)]
    port: Option<u16>,

    /// RNMR symbols file with TRM1_TCP_NODE / TRM1_TCP_PORT
    #[arg(long)]
    symbols: Option<PathBuf>,

    /// Write spin logs into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Simulate a spinner instead of connecting
    #[arg(long, value_enum)]
    offline: Option<OfflineMode>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hold this spin rate (Hz) with automatic control
    #[arg(long)]
    auto: Option<f64>,

    /// Stop after this many seconds (runs until Ctrl-C otherwise)
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OfflineMode {
    /// Repeating 0..100 Hz ramp
    Ramp,
    /// Spinner that follows drive pressure
    Plant,
}

/// Prints what the session reports.
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_sample(&self, sample: &Sample) {
        println!(
            "{}  {:>6.0} Hz",
            sample.timestamp.wall_clock().format("%H:%M:%S%.3f"),
            sample.frequency_hz
        );
    }

    fn on_state_change(&self, state: SessionState) {
        println!("-- {}", state);
    }

    fn on_status(&self, status: &MasStatus) {
        println!(
            "   drive {} mbar, bearing {} mbar, sense {} mbar, set point {:.0} Hz",
            status.drive_mbar, status.bearing_mbar, status.sense_mbar, status.spin_set_hz
        );
    }

    fn on_error(&self, kind: ErrorKind, detail: &str) {
        eprintln!("!! {}: {}", kind, detail);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MasConfig::load(path)?,
        None => MasConfig::default(),
    };

    let source = match cli.offline {
        Some(mode) => {
            config.offline = match mode {
                OfflineMode::Ramp => OfflineConfig {
                    profile: OfflineProfile::Ramp,
                    ..config.offline
                },
                OfflineMode::Plant => OfflineConfig::plant(),
            };
            TelemetrySource::Offline(config.offline.clone())
        }
        None => {
            let symbols = match &cli.symbols {
                Some(path) => Some(path.clone()),
                None => {
                    let cwd = std::env::current_dir()?;
                    let specific = std::env::var_os("RNMR_SPECIFIC").map(PathBuf::from);
                    find_symbols_file(&cwd, specific.as_deref())
                }
            };
            TelemetrySource::Live(resolve_connection(
                cli.host.as_deref(),
                cli.port,
                symbols.as_deref(),
            )?)
        }
    };

    println!("=================================================");
    println!("  MAS Monitor");
    println!("=================================================");
    println!("  - Source: {}", source);

    let session = SessionCoordinator::new(source, config.clone());
    println!("  - Session: {}", session.session_id());
    session.subscribe(Arc::new(ConsoleObserver));

    let history = Arc::new(SpinHistory::default());
    session.subscribe(history.clone());

    let logger = match &cli.log_dir {
        Some(dir) => {
            config.spin_log.log_dir = dir.clone();
            let logger = Arc::new(SpinLogger::start(config.spin_log.clone())?);
            session.add_sink(logger.clone());
            println!("  - Logging to: {}", dir.display());
            Some(logger)
        }
        None => None,
    };
    println!();

    session.connect().await?;

    if let Some(target_hz) = cli.auto {
        // Give the controller a moment to report its drive pressure.
        tokio::time::sleep(config.link.poll_interval() * 2).await;
        session.enable_auto_with(config.target.with_target(target_hz))?;
    }

    match cli.duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    session.close().await;
    report(&session, &history, logger, &config.spin_log.log_dir);

    println!("=================================================");
    println!("  MAS Monitor Shut Down");
    println!("=================================================");

    Ok(())
}

fn report(
    session: &SessionCoordinator,
    history: &SpinHistory,
    logger: Option<Arc<SpinLogger>>,
    log_dir: &Path,
) {
    let stats = session.stats();
    println!();
    println!("Session Statistics:");
    println!("  - Samples delivered: {}", stats.samples_delivered);
    println!("  - Samples rejected: {}", stats.samples_rejected);
    println!("  - Commands sent: {}", stats.commands_sent);
    println!("  - Commands failed: {}", stats.commands_failed);
    println!("  - History points: {}", history.len());

    let Some(logger) = logger else {
        return;
    };
    let log_stats = logger.stats();
    println!("  - Log lines written: {}", log_stats.written);
    println!("  - Log samples dropped: {}", log_stats.dropped);

    match logger.finish() {
        Ok(Some(path)) => println!("  - Spin log: {}", path.display()),
        Ok(None) => println!("  - Spin log: no samples in {}", log_dir.display()),
        Err(e) => eprintln!("✗ Spin log: {}", e),
    }
}
