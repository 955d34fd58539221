//! VDQM - Volume & Drive Queue Manager
//!
//! Scheduler for a tape hierarchical storage system: queues requests to
//! mount tape volumes, matches them to free compatible tape drives and
//! drives each (drive, request) pair through submission, confirmation,
//! mount, release and unmount, recovering pairs whose confirmation never
//! arrives.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         REST API (axum)                           │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                        Vdqm facade                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐   │
//! │  │ Request      │  │ Drive        │  │ Scheduler workers      │   │
//! │  │ Queue        │  │ Registry     │  │ + Liveness monitor     │   │
//! │  └──────┬───────┘  └──────┬───────┘  └───────────┬────────────┘   │
//! │         └─────────────────┼──────────────────────┘                │
//! │                  ┌────────┴─────────┐                             │
//! │                  │ Allocation Engine │  (conditional commits)     │
//! │                  └────────┬─────────┘                             │
//! ├───────────────────────────┴───────────────────────────────────────┤
//! │       Catalogue / Compatibility  ·  Volume Priorities             │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                     VdqmStore (MemoryStore)                       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: Core types and the store / drive-daemon ports
//! - [`store`]: In-memory store with versioned conditional commits
//! - [`catalogue`]: Volumes, tape servers, device groups, compatibility
//! - [`priority`]: Volume priority overrides
//! - [`queue`]: Request admission and ordering
//! - [`registry`]: Drives, their state machine and dedications
//! - [`allocation`]: Allocation engine and submission protocol
//! - [`liveness`]: Recovery of lost submissions and silent drives
//! - [`scheduler`]: Worker pool and the [`Vdqm`] facade
//! - [`api`]: REST API
//! - [`error`]: Error types and handling

pub mod allocation;
pub mod api;
pub mod catalogue;
pub mod config;
pub mod domain;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod priority;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use allocation::{AllocationEngine, AllocationOutcome, EngineStatsSnapshot};
pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use catalogue::{Catalogue, CompatibilityResolver};
pub use config::VdqmConfig;

pub use domain::ports::{
    DriveDaemon, DriveDaemonRef, DriveJob, VdqmStore, VdqmStoreRef, Versioned, WriteBatch,
    WriteOp,
};
pub use domain::types::{
    AccessMode, AccessSpecification, ClientIdentity, DeviceGroup, DriveCompatibility, DriveId,
    Lifespan, MountRequest, PriorityKey, RequestId, RequestStatus, TapeServer, Volume,
    VolumePriority,
};

pub use error::{Error, ErrorAction, ErrorKind, Result};
pub use liveness::{LivenessConfig, LivenessMonitor, SweepReport};
pub use metrics::SchedulerMetrics;
pub use priority::{EffectivePriorities, EffectivePriority, PriorityStore};
pub use queue::{NewMountRequest, QueueEntry, QueueFilter, RequestQueue};

pub use registry::{
    Dedication, Drive, DriveRegistry, DriveReport, DriveStatus, DriveView, LegacyFlags, NewDrive,
    PairReport, RegistryEvent,
};

pub use scheduler::{ConfirmationBoard, DaemonConfig, HttpDriveDaemon, Vdqm, VdqmStatus};
pub use store::{MemoryStore, MemoryStoreConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
