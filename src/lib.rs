pub mod config;
pub mod dashboard;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod tls;
pub mod worker;

pub use error::{Result, WinlinkError};
