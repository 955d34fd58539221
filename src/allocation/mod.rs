//! Allocation
//!
//! Allocate / reuse (pair binding) and the submit / confirm / reset /
//! complete protocol with the drive daemon.

pub mod engine;
pub mod submission;

pub use engine::{AllocationEngine, AllocationOutcome, EngineStatsSnapshot};
