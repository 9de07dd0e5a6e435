//! Session managers for the two roles.
//!
//! Each node owns the network half of its role and routes every incoming
//! message to the scheduler (master) or the executor (worker). Handlers run
//! on the node's event loop, never inside the network's reader tasks.

mod master;
mod worker;

pub use master::MasterNode;
pub use worker::WorkerNode;
