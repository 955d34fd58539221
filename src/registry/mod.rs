//! Drive Registry
//!
//! Drive records, the drive state machine with its legacy flag projection,
//! dedication constraints and lifecycle events.

pub mod dedication;
pub mod drive;
pub mod drive_registry;
pub mod events;
pub mod status;

pub use dedication::{Dedication, TimeWindow};
pub use drive::{Drive, DriveSnapshot, PairReport, RequestSnapshot};
pub use drive_registry::{
    DriveRegistry, DriveReport, DriveView, NewDrive, RegistryStatsSnapshot,
    DEFAULT_UPDATE_ATTEMPTS,
};
pub use events::RegistryEvent;
pub use status::{legacy_flags_for_code, DriveStatus, LegacyFlags};
