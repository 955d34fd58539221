//! Scheduler
//!
//! Worker pool driving allocation and submission, the confirmation board,
//! the HTTP drive-daemon client and the [`Vdqm`] facade that wires every
//! subsystem together.

pub mod board;
pub mod daemon;
pub mod orchestrator;
pub mod worker;

pub use board::ConfirmationBoard;
pub use daemon::{DaemonConfig, HttpDriveDaemon};
pub use orchestrator::{Vdqm, VdqmStatus};
pub use worker::{SchedulerWorker, WorkerConfig};
