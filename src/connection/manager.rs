//! # Connection Manager
//!
//! Owns the socket to the controller. A connect yields a [`Connection`] (the
//! write side) and a [`ChunkReceiver`] (the read side). They share one link
//! state: once the link is lost or closed, every further send and receive
//! fails with [`ConnError::Lost`].

use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use crate::error::ConnError;
use crate::types::ConnectionConfig;

/// Default bound on a connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on a single write once connected.
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Read buffer; controller replies are short.
const READ_CHUNK: usize = 256;

struct LinkState {
    lost: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl LinkState {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }
}

/// Write side of a controller link.
pub struct Connection {
    peer: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    link: Arc<LinkState>,
}

/// Read side of a controller link, yielding raw byte chunks in arrival order.
pub struct ChunkReceiver {
    reader: OwnedReadHalf,
    link: Arc<LinkState>,
    shutdown: watch::Receiver<bool>,
    buf: Vec<u8>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("lost", &self.link.is_lost())
            .finish()
    }
}

impl Connection {
    /// Open a TCP connection, failing with [`ConnError::Timeout`] if it takes
    /// longer than `timeout`.
    pub async fn connect(
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<(Connection, ChunkReceiver), ConnError> {
        let peer = config.address();
        debug!("Connecting to MAS controller at {}", peer);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&peer)).await {
            Err(_) => {
                warn!("Connect to {} timed out after {:?}", peer, timeout);
                return Err(ConnError::Timeout);
            }
            Ok(Err(e)) => return Err(connect_error(&peer, e)),
            Ok(Ok(stream)) => stream,
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to disable Nagle on {}: {}", peer, e);
        }

        let (reader, writer) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = Arc::new(LinkState {
            lost: AtomicBool::new(false),
            shutdown: shutdown_tx,
        });

        info!("Connected to MAS controller at {}", peer);

        Ok((
            Connection {
                peer,
                writer: Mutex::new(Some(writer)),
                link: Arc::clone(&link),
            },
            ChunkReceiver {
                reader,
                link,
                shutdown: shutdown_rx,
                buf: vec![0u8; READ_CHUNK],
            },
        ))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_lost(&self) -> bool {
        self.link.is_lost()
    }

    /// Write one encoded command. Fails fast once the link is closed.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ConnError> {
        if self.link.is_lost() {
            return Err(ConnError::Lost);
        }

        let mut shutdown = self.link.shutdown.subscribe();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnError::Lost)?;

        let write = tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(bytes));
        let result = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => Err(ConnError::Lost),
            written = write => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!("Write to {} failed: {}", self.peer, e);
                    Err(ConnError::Lost)
                }
                Err(_) => {
                    warn!("Write to {} stalled for {:?}", self.peer, WRITE_TIMEOUT);
                    Err(ConnError::Lost)
                }
            },
        };

        if result.is_err() {
            self.link.mark_lost();
        }
        result
    }

    /// Close the link. Pending receives return [`ConnError::Lost`] and later
    /// sends fail immediately.
    pub async fn close(&self) {
        self.link.mark_lost();
        self.link.shutdown.send_replace(true);

        // A send stuck in the kernel holds the writer; it observes the shutdown
        // signal and fails on its own.
        if let Ok(mut guard) = self.writer.try_lock() {
            if let Some(mut writer) = guard.take() {
                if let Err(e) = writer.shutdown().await {
                    debug!("Socket shutdown for {} reported: {}", self.peer, e);
                }
            }
        }
        info!("Closed connection to {}", self.peer);
    }
}

impl ChunkReceiver {
    /// Wait for the next chunk of bytes.
    ///
    /// Suspends only while no data has arrived. Returns [`ConnError::Lost`]
    /// on EOF, socket error or close, and on every call after that.
    pub async fn next_chunk(&mut self) -> Result<Vec<u8>, ConnError> {
        if self.link.is_lost() {
            return Err(ConnError::Lost);
        }

        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => Err(ConnError::Lost),
            read = self.reader.read(&mut self.buf) => match read {
                Ok(0) => {
                    info!("Controller closed the connection");
                    self.link.mark_lost();
                    Err(ConnError::Lost)
                }
                Ok(n) => Ok(self.buf[..n].to_vec()),
                Err(e) => {
                    warn!("Read from controller failed: {}", e);
                    self.link.mark_lost();
                    Err(ConnError::Lost)
                }
            },
        }
    }
}

/// Resolves once the watched flag turns true or its sender goes away.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn connect_error(peer: &str, e: io::Error) -> ConnError {
    match e.kind() {
        io::ErrorKind::TimedOut => ConnError::Timeout,
        io::ErrorKind::ConnectionRefused => {
            ConnError::Refused(format!("{} refused the connection", peer))
        }
        _ => ConnError::Refused(format!("{}: {}", peer, e)),
    }
}
