//! Connection management for both roles.
//!
//! The master dials workers and keeps one reader task per peer; the worker
//! listens and serves a single master connection at a time. Both sides hand
//! incoming messages to their session layer through an mpsc channel, so no
//! handler ever runs while a connection table lock is held.

pub mod master;
pub mod worker;

use std::time::Duration;

use crate::protocol::codec::{ProtocolError, DEFAULT_MAX_LINE_BYTES};
use crate::tls::TlsError;

pub use master::{MasterNetwork, NetworkEvent, PeerInfo};
pub use worker::{MasterLink, WorkerEvent, WorkerNetwork};

/// Capacity of the event channels between the network and session layers.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("TLS handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Authentication with {0} failed")]
    AuthFailed(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkOptions {
    /// Bound on TCP connect, TLS handshake and the auth handshake.
    pub connection_timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}
