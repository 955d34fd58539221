//! Registry Events
//!
//! Events emitted on drive and pair lifecycle changes, for external
//! consumers (metrics, log shippers, tests) to react to.

use super::status::DriveStatus;
use crate::domain::types::{DriveId, RequestId};
use serde::{Deserialize, Serialize};

/// Events emitted by the drive registry and the allocation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A drive was registered
    DriveRegistered { drive: DriveId, unit: String },

    /// A drive was deleted
    DriveRemoved { drive: DriveId, unit: String },

    /// A drive moved along a state machine edge
    StatusChanged {
        drive: DriveId,
        from: DriveStatus,
        to: DriveStatus,
    },

    /// A drive's dedication was replaced
    Dedicated { drive: DriveId, dedication: String },

    /// A pair was bound by allocation or reuse
    PairAllocated {
        drive: DriveId,
        request: RequestId,
        reused: bool,
    },

    /// The drive daemon accepted the job
    PairConfirmed { drive: DriveId, request: RequestId },

    /// A pair was returned to UP / pending
    PairReset { drive: DriveId, request: RequestId },

    /// A bound request finished and was removed
    RequestCompleted { drive: DriveId, request: RequestId },
}

impl RegistryEvent {
    /// Drive this event concerns
    pub fn drive(&self) -> DriveId {
        match self {
            RegistryEvent::DriveRegistered { drive, .. }
            | RegistryEvent::DriveRemoved { drive, .. }
            | RegistryEvent::StatusChanged { drive, .. }
            | RegistryEvent::Dedicated { drive, .. }
            | RegistryEvent::PairAllocated { drive, .. }
            | RegistryEvent::PairConfirmed { drive, .. }
            | RegistryEvent::PairReset { drive, .. }
            | RegistryEvent::RequestCompleted { drive, .. } => *drive,
        }
    }

    /// Request this event concerns, for pair-level events
    pub fn request(&self) -> Option<RequestId> {
        match self {
            RegistryEvent::PairAllocated { request, .. }
            | RegistryEvent::PairConfirmed { request, .. }
            | RegistryEvent::PairReset { request, .. }
            | RegistryEvent::RequestCompleted { request, .. } => Some(*request),
            _ => None,
        }
    }

    /// Check if this is a pair-level event
    pub fn is_pair_event(&self) -> bool {
        self.request().is_some()
    }
}
