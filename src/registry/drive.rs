//! Drive Records

use super::dedication::Dedication;
use super::status::{DriveStatus, LegacyFlags};
use crate::domain::types::{DriveId, RequestId, RequestStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A physical tape drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drive {
    pub id: DriveId,
    /// Unit name, unique per server
    pub name: String,
    pub server: String,
    pub device_group: String,
    /// Physical drive model, resolved against drive compatibilities
    pub model: String,
    pub status: DriveStatus,
    pub mounted_vid: Option<String>,
    pub bound_request: Option<RequestId>,
    pub dedication: Option<Dedication>,
    pub use_count: u64,
    pub error_count: u64,
    pub bytes_transferred: u64,
    pub modified_at: DateTime<Utc>,
    pub reset_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Drive {
    pub fn new(
        id: DriveId,
        name: impl Into<String>,
        server: impl Into<String>,
        device_group: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            server: server.into(),
            device_group: device_group.into(),
            model: model.into(),
            status: DriveStatus::Up,
            mounted_vid: None,
            bound_request: None,
            dedication: None,
            use_count: 0,
            error_count: 0,
            bytes_transferred: 0,
            modified_at: now,
            reset_at: None,
            last_heartbeat: now,
        }
    }

    /// `name@server`, the form operators refer to drives by
    pub fn unit(&self) -> String {
        format!("{}@{}", self.name, self.server)
    }

    /// Idle, unbound and eligible for a new allocation
    pub fn is_free(&self) -> bool {
        self.status == DriveStatus::Up && self.bound_request.is_none()
    }

    pub fn legacy_flags(&self) -> LegacyFlags {
        self.status.legacy_flags()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Drive state as seen immediately before or after a protocol step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveSnapshot {
    pub exists: bool,
    pub status: Option<DriveStatus>,
    pub bound_request: Option<RequestId>,
}

impl DriveSnapshot {
    pub fn of(drive: Option<&Drive>) -> Self {
        match drive {
            Some(d) => Self {
                exists: true,
                status: Some(d.status),
                bound_request: d.bound_request,
            },
            None => Self {
                exists: false,
                status: None,
                bound_request: None,
            },
        }
    }
}

/// Request state as seen immediately before or after a protocol step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub exists: bool,
    pub status: Option<RequestStatus>,
    pub bound_drive: Option<DriveId>,
}

impl RequestSnapshot {
    pub fn of(request: Option<&crate::domain::types::MountRequest>) -> Self {
        match request {
            Some(r) => Self {
                exists: true,
                status: Some(r.status),
                bound_drive: r.bound_drive,
            },
            None => Self {
                exists: false,
                status: None,
                bound_drive: None,
            },
        }
    }
}

/// Before/after view of a (drive, request) pair around one protocol step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairReport {
    pub drive_before: DriveSnapshot,
    pub request_before: RequestSnapshot,
    pub drive_after: DriveSnapshot,
    pub request_after: RequestSnapshot,
    /// Whether this call changed anything
    pub applied: bool,
}
