//! Worker-side collaborators.
//!
//! - [`TaskExecutor`]: runs a task request and returns a result payload,
//!   reporting progress along the way. [`ProcessExecutor`] hands the code to
//!   an interpreter process.
//! - [`ResourceProbe`]: produces the `resource_data` snapshot the master uses
//!   for load balancing. [`SystemProbe`] reads the host through `sysinfo`.

pub mod executor;
pub mod telemetry;

pub use executor::{ProcessExecutor, ProgressReporter, TaskExecutor};
pub use telemetry::{ResourceProbe, StaticProbe, SystemProbe};
