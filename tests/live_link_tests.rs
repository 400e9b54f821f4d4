//! Live link tests against a scripted controller on a local socket.
//!
//! Tests verify:
//! - Polled samples arrive in controller order with non-decreasing timestamps
//! - An implausible reading is dropped without disturbing its neighbours
//! - A dropped connection leaves the session `Disconnected` and reconnectable
//! - Refused and silent controllers fail `connect` with the right error
//! - A host that never completes the TCP handshake fails `connect` with a timeout
//! - Closing a connection releases a pending receive
//! - A missed reply is recovered with a link test; a dead controller is not
//! - Manual and automatic control put the expected commands on the wire
//! - Spin set point and controller regulation commands go out in order
//! - A refused drive step rebases the next step on the last accepted drive

use mas_control::connection::{Connection, DEFAULT_CONNECT_TIMEOUT};
use mas_control::control::AutoControlConfig;
use mas_control::protocol::{encode_reply, COMMAND_TERMINATOR, HIGH_BIT};
use mas_control::session::LinkConfig;
use mas_control::{
    ConnError, ConnectionConfig, ControlTarget, ErrorKind, MasConfig, MasStatus, Sample,
    SessionCoordinator, SessionError, SessionObserver, SessionState, TelemetrySource,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

// ============================================================================
// SCRIPTED CONTROLLER
// ============================================================================

/// How the fake controller behaves.
#[derive(Debug, Clone, Default)]
struct Script {
    /// Spin field of successive `AS` replies; the last one repeats
    spins: Vec<&'static str>,
    /// Answer `MA` with a refusal
    refuse_link_test: bool,
    /// Never answer `MA`
    ignore_link_test: bool,
    /// Drop the first connection instead of answering this `AS` (0-based)
    hang_up_at_status: Option<usize>,
    /// `AS` requests (0-based) left unanswered
    ignore_status: Vec<usize>,
    /// Stop answering anything from this `AS` on
    silent_from_status: Option<usize>,
    /// Refuse `DP` above this drive
    max_drive: Option<u32>,
}

#[derive(Default)]
struct Controller {
    script: Script,
    commands: Mutex<Vec<String>>,
    status_requests: AtomicUsize,
    connections: AtomicUsize,
    drive_mbar: AtomicU32,
    silent: AtomicBool,
}

impl Controller {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Reply to one command, or `None` to stay quiet. `Err` hangs up.
    fn answer(&self, command: &str, connection: usize) -> Result<Option<String>, ()> {
        self.commands.lock().push(command.to_string());
        if self.silent.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut parts = command.split_whitespace();
        let reply = match parts.next() {
            Some("MA") if self.script.ignore_link_test => None,
            Some("MA") if self.script.refuse_link_test => Some("ER 1".to_string()),
            Some("AS") => {
                let idx = self.status_requests.fetch_add(1, Ordering::SeqCst);
                if self.script.hang_up_at_status == Some(idx) && connection == 1 {
                    return Err(());
                }
                if self.script.silent_from_status.map_or(false, |n| idx >= n) {
                    self.silent.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
                if self.script.ignore_status.contains(&idx) {
                    return Ok(None);
                }
                let spin = self
                    .script
                    .spins
                    .get(idx)
                    .or(self.script.spins.last())
                    .copied()
                    .unwrap_or("0");
                Some(format!(
                    "AS {} {} 2500 2400",
                    spin,
                    self.drive_mbar.load(Ordering::SeqCst)
                ))
            }
            Some("VD") => Some("VD 5000".to_string()),
            Some("DP") => match parts.next().and_then(|v| v.parse::<u32>().ok()) {
                Some(mbar) if self.script.max_drive.map_or(false, |max| mbar > max) => {
                    Some("ER 2".to_string())
                }
                Some(mbar) => {
                    self.drive_mbar.store(mbar, Ordering::SeqCst);
                    Some("OK".to_string())
                }
                None => Some("OK".to_string()),
            },
            _ => Some("OK".to_string()),
        };
        Ok(reply)
    }
}

async fn spawn_controller(script: Script) -> (Arc<Controller>, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let controller = Arc::new(Controller {
        script,
        ..Controller::default()
    });

    let serving = controller.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let connection = serving.connections.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(serve(serving.clone(), socket, connection));
        }
    });

    (controller, ConnectionConfig::new("127.0.0.1", port).unwrap())
}

async fn serve(controller: Arc<Controller>, mut socket: TcpStream, connection: usize) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(end) = pending.iter().position(|&b| b == COMMAND_TERMINATOR) {
            let raw: Vec<u8> = pending.drain(..=end).collect();
            let text: String = raw[..end].iter().map(|b| (b & !HIGH_BIT) as char).collect();
            match controller.answer(&text, connection) {
                Err(()) => return,
                Ok(Some(reply)) => {
                    if socket.write_all(&encode_reply(&reply)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
            }
        }
    }
}

// ============================================================================
// SESSION HARNESS
// ============================================================================

#[derive(Default)]
struct Recorder {
    samples: Mutex<Vec<Sample>>,
    states: Mutex<Vec<SessionState>>,
    statuses: Mutex<Vec<MasStatus>>,
    errors: Mutex<Vec<(ErrorKind, String)>>,
}

impl Recorder {
    fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    fn errors_of(&self, kind: ErrorKind) -> usize {
        self.errors.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl SessionObserver for Recorder {
    fn on_sample(&self, sample: &Sample) {
        self.samples.lock().push(*sample);
    }

    fn on_state_change(&self, state: SessionState) {
        self.states.lock().push(state);
    }

    fn on_status(&self, status: &MasStatus) {
        self.statuses.lock().push(*status);
    }

    fn on_error(&self, kind: ErrorKind, detail: &str) {
        self.errors.lock().push((kind, detail.to_string()));
    }
}

async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn fast_link() -> LinkConfig {
    LinkConfig {
        connect_timeout_ms: 1000,
        reply_timeout_ms: 200,
        poll_interval_ms: 20,
        recovery_factor: 2,
        settle_ms: 20,
        ..LinkConfig::default()
    }
}

fn live_session(
    connection: ConnectionConfig,
    auto: AutoControlConfig,
) -> (SessionCoordinator, Arc<Recorder>) {
    let config = MasConfig {
        link: fast_link(),
        auto,
        ..MasConfig::default()
    };
    let session = SessionCoordinator::new(TelemetrySource::Live(connection), config);
    let recorder = Arc::new(Recorder::default());
    session.subscribe(recorder.clone());
    (session, recorder)
}

// ============================================================================
// TELEMETRY
// ============================================================================

#[tokio::test]
async fn test_samples_arrive_in_controller_order() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["1000", "1010", "1020", "1030", "1040"],
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert!(wait_until(Duration::from_secs(3), || recorder.sample_count() >= 6).await);
    session.close().await;

    let samples = recorder.samples.lock().clone();
    let values: Vec<f64> = samples.iter().take(6).map(|s| s.frequency_hz).collect();
    assert_eq!(values, vec![1000.0, 1010.0, 1020.0, 1030.0, 1040.0, 1040.0]);
    assert!(samples
        .windows(2)
        .all(|pair| pair[1].timestamp >= pair[0].timestamp));

    let status = session.status().unwrap();
    assert_eq!(status.bearing_mbar, 2500);
    assert_eq!(status.sense_mbar, 2400);
    assert_eq!(controller.commands().first().map(String::as_str), Some("MA"));
    assert!(controller.count("VD") > 0);
}

#[tokio::test]
async fn test_implausible_reading_is_dropped() {
    let (_controller, connection) = spawn_controller(Script {
        spins: vec!["5000", "-5", "5010"],
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || recorder.sample_count() >= 2).await);
    assert!(
        wait_until(Duration::from_secs(1), || recorder.errors_of(ErrorKind::Telemetry) == 1)
            .await
    );
    session.close().await;

    let values: Vec<f64> = recorder
        .samples
        .lock()
        .iter()
        .take(2)
        .map(|s| s.frequency_hz)
        .collect();
    assert_eq!(values, vec![5000.0, 5010.0]);
    assert_eq!(session.stats().samples_rejected, 1);
    assert_eq!(session.state(), SessionState::Disconnected);
}

// ============================================================================
// CONNECTION LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_lost_connection_then_reconnect() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["3000"],
        hang_up_at_status: Some(3),
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || session.state() == SessionState::Disconnected)
            .await
    );
    assert!(
        wait_until(Duration::from_secs(1), || recorder.errors_of(ErrorKind::Connection) >= 1)
            .await
    );
    let before = recorder.sample_count();
    assert_eq!(before, 3);

    session.connect().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || recorder.sample_count() >= before + 3).await);
    session.close().await;

    assert_eq!(controller.connections.load(Ordering::SeqCst), 2);
    let samples = recorder.samples.lock();
    assert!(samples
        .windows(2)
        .all(|pair| pair[1].timestamp >= pair[0].timestamp));
    assert_eq!(session.stats().connects, 2);
}

#[tokio::test]
async fn test_refused_connection_reports_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let connection = ConnectionConfig::new("127.0.0.1", port).unwrap();
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    let result = session.connect().await;
    assert!(matches!(result, Err(SessionError::Conn(ConnError::Refused(_)))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(
        wait_until(Duration::from_secs(1), || recorder.errors_of(ErrorKind::Connection) == 1)
            .await
    );
    assert_eq!(
        *recorder.states.lock(),
        vec![SessionState::Connecting, SessionState::Disconnected]
    );
}

#[tokio::test]
async fn test_link_test_refusal_and_silence() {
    let (_controller, connection) = spawn_controller(Script {
        refuse_link_test: true,
        ..Script::default()
    })
    .await;
    let (session, _recorder) = live_session(connection, AutoControlConfig::default());
    let result = session.connect().await;
    assert!(matches!(result, Err(SessionError::Conn(ConnError::Refused(_)))));
    assert_eq!(session.state(), SessionState::Disconnected);

    let (_controller, connection) = spawn_controller(Script {
        ignore_link_test: true,
        ..Script::default()
    })
    .await;
    let (session, _recorder) = live_session(connection, AutoControlConfig::default());
    assert_eq!(
        session.connect().await,
        Err(SessionError::Conn(ConnError::Timeout))
    );
    assert_eq!(session.state(), SessionState::Disconnected);
}

/// A listener that never accepts, with its accept queue already full.
async fn saturated_listener() -> (TcpListener, Vec<TcpStream>, u16) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut held = Vec::new();
    for _ in 0..64 {
        match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => held.push(stream),
            _ => break,
        }
    }
    (listener, held, addr.port())
}

#[tokio::test]
async fn test_unanswered_handshake_times_out() {
    let (_listener, _held, port) = saturated_listener().await;
    let connection = ConnectionConfig::new("127.0.0.1", port).unwrap();

    let started = tokio::time::Instant::now();
    let result = Connection::connect(&connection, Duration::from_millis(200)).await;
    assert!(matches!(result, Err(ConnError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(2));

    let config = MasConfig {
        link: LinkConfig {
            connect_timeout_ms: 200,
            ..fast_link()
        },
        ..MasConfig::default()
    };
    let session = SessionCoordinator::new(TelemetrySource::Live(connection), config);
    let recorder = Arc::new(Recorder::default());
    session.subscribe(recorder.clone());

    assert_eq!(
        session.connect().await,
        Err(SessionError::Conn(ConnError::Timeout))
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(
        wait_until(Duration::from_secs(1), || recorder.errors_of(ErrorKind::Connection) == 1)
            .await
    );
}

#[tokio::test]
async fn test_close_releases_pending_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        // Hold the socket open without ever writing.
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let config = ConnectionConfig::new("127.0.0.1", port).unwrap();
    let (conn, mut chunks) = Connection::connect(&config, DEFAULT_CONNECT_TIMEOUT)
        .await
        .unwrap();
    let pending = tokio::spawn(async move { chunks.next_chunk().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close().await;

    let received = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("pending receive was not released")
        .unwrap();
    assert_eq!(received, Err(ConnError::Lost));
    assert_eq!(conn.send(b"AS").await, Err(ConnError::Lost));
    assert!(conn.is_lost());
    server.abort();
}

// ============================================================================
// RECOVERY
// ============================================================================

#[tokio::test]
async fn test_missed_reply_recovers_with_link_test() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["4000"],
        ignore_status: vec![2],
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || recorder.errors_of(ErrorKind::Connection) >= 1)
            .await
    );
    let before = recorder.sample_count();
    assert!(wait_until(Duration::from_secs(3), || recorder.sample_count() >= before + 3).await);

    assert_eq!(session.state(), SessionState::Connected);
    // Handshake plus at least one recovery link test.
    assert!(controller.count("MA") >= 2);
    assert_eq!(controller.connections.load(Ordering::SeqCst), 1);
    session.close().await;
}

#[tokio::test]
async fn test_dead_controller_disconnects_after_recovery_window() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["4000"],
        silent_from_status: Some(2),
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || session.state() == SessionState::Disconnected)
            .await
    );
    assert_eq!(recorder.sample_count(), 2);
    assert!(controller.count("MA") >= 2);
    assert!(wait_until(Duration::from_secs(1), || {
        recorder
            .errors
            .lock()
            .iter()
            .any(|(kind, detail)| *kind == ErrorKind::Connection && detail.contains("in time"))
    })
    .await);
    session.close().await;
}

// ============================================================================
// CONTROL
// ============================================================================

#[tokio::test]
async fn test_manual_commands_reach_controller() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["2000"],
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || session.status().is_some()).await);
    session.enable_manual().unwrap();
    session.manual_command(100).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            recorder.statuses.lock().last().map(|s| s.drive_mbar) == Some(100)
        })
        .await
    );
    let commands = controller.commands();
    let gm = commands.iter().position(|c| c == "GM").unwrap();
    let dp = commands.iter().position(|c| c == "DP 100").unwrap();
    assert!(gm < dp);
    assert_eq!(session.stats().commands_failed, 0);
    session.close().await;
}

#[tokio::test]
async fn test_auto_stall_on_live_link() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["0"],
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(
        connection,
        AutoControlConfig {
            cycle_samples: 1,
            ..AutoControlConfig::default()
        },
    );

    session.connect().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || recorder.sample_count() > 0).await);
    session
        .enable_auto_with(ControlTarget {
            target_hz: 12_000.0,
            tolerance_hz: 10.0,
            max_step: 50.0,
        })
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || session.state() == SessionState::Faulted).await
    );
    assert_eq!(session.stats().commands_sent, 4);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.count("GM"), 1);
    assert_eq!(controller.count("DP"), 3);
    assert_eq!(recorder.errors_of(ErrorKind::ControlStall), 1);
    session.close().await;
}

#[tokio::test]
async fn test_spin_rate_and_controller_regulation_on_wire() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["2000"],
        ..Script::default()
    })
    .await;
    let (session, _recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    session.enable_manual().unwrap();
    session.set_spin_rate(5000).unwrap();
    session.controller_auto().unwrap();

    assert!(wait_until(Duration::from_secs(2), || controller.count("GA") == 1).await);
    let commands = controller.commands();
    let gm = commands.iter().position(|c| c == "GM").unwrap();
    let ds = commands.iter().position(|c| c == "DS 5000").unwrap();
    let ga = commands.iter().position(|c| c == "GA").unwrap();
    assert!(gm < ds && ds < ga);

    // Taking manual control back hands regulation to the host again.
    session.disable().unwrap();
    session.enable_manual().unwrap();
    assert!(wait_until(Duration::from_secs(2), || controller.count("GM") == 2).await);
    assert_eq!(session.stats().commands_failed, 0);
    session.close().await;
}

#[tokio::test]
async fn test_refused_drive_step_rebases_on_accepted_drive() {
    let (controller, connection) = spawn_controller(Script {
        spins: vec!["2000"],
        max_drive: Some(1000),
        ..Script::default()
    })
    .await;
    let (session, recorder) = live_session(connection, AutoControlConfig::default());

    session.connect().await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || session.status().is_some()).await);
    session.enable_manual().unwrap();

    session.manual_command(100).unwrap();
    session.manual_command(2000).unwrap();
    assert!(wait_until(Duration::from_secs(2), || session.stats().commands_failed == 1).await);
    assert!(
        wait_until(Duration::from_secs(1), || recorder.errors_of(ErrorKind::Command) == 1).await
    );

    session.manual_command(50).unwrap();
    assert!(wait_until(Duration::from_secs(2), || controller.count("DP 150") == 1).await);
    let drives: Vec<String> = controller
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("DP"))
        .collect();
    assert_eq!(drives, vec!["DP 100", "DP 2100", "DP 150"]);
    assert!(
        wait_until(Duration::from_secs(2), || {
            recorder.statuses.lock().last().map(|s| s.drive_mbar) == Some(150)
        })
        .await
    );
    session.close().await;
}
