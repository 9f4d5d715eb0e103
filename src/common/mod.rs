//! Common infrastructure shared across modules
//!
//! Errors, best-effort outcomes, bounded polling, Ctrl+C handling and the
//! command-line surface.

pub mod cli;
pub mod deadline;
pub mod error;
pub mod outcome;
pub mod shutdown;

pub use deadline::{PollTimer, Tick};
pub use error::{BenchError, BenchResult};
pub use outcome::BestEffort;
pub use shutdown::{
    setup_shutdown, shutdown_channel, shutdown_requested, ShutdownReceiver, ShutdownSender,
    ShutdownSignal,
};
