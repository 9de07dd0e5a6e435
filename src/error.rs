use thiserror::Error;

use crate::config::ConfigError;
use crate::network::NetworkError;
use crate::protocol::auth::AuthError;
use crate::protocol::codec::ProtocolError;
use crate::scheduler::{SchedulerError, TaskError};
use crate::store::StoreError;
use crate::tls::TlsError;

#[derive(Error, Debug)]
pub enum WinlinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = WinlinkError> = std::result::Result<T, E>;
