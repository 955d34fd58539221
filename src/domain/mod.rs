//! Domain layer - Core records and port definitions
//!
//! Records shared by every scheduler subsystem, plus the traits (ports) that
//! persistence and drive-daemon adapters implement.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
