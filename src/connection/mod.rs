//! TCP link to the controller.
//!
//! The connection never reconnects on its own: it reports loss and the
//! session coordinator decides what happens next.

pub mod manager;

pub use manager::{wait_for_shutdown, ChunkReceiver, Connection, DEFAULT_CONNECT_TIMEOUT};
