//! Domain Ports - Persistence and drive-daemon contracts
//!
//! The scheduler never holds a global lock. Everything it needs from
//! persistence is captured by [`VdqmStore`]: versioned reads, an all-or-nothing
//! conditional [`WriteBatch`] commit that fails with `Error::Contended` on any
//! version mismatch, and unique-insert-or-fetch for identity records.

use crate::domain::types::*;
use crate::error::Result;
use crate::registry::Drive;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Versioned Records
// =============================================================================

/// A record together with the generation it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

impl<T> Versioned<T> {
    pub fn new(version: u64, record: T) -> Self {
        Self { version, record }
    }

    pub fn into_inner(self) -> T {
        self.record
    }
}

impl<T> std::ops::Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.record
    }
}

// =============================================================================
// Write Batches
// =============================================================================

/// A single conditional mutation
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert (`expected == None`) or replace at the observed version
    PutDrive { drive: Drive, expected: Option<u64> },
    /// Insert (`expected == None`) or replace at the observed version
    PutRequest {
        request: MountRequest,
        expected: Option<u64>,
    },
    DeleteDrive { id: DriveId, expected: u64 },
    DeleteRequest { id: RequestId, expected: u64 },
    /// Remove the priority override last written at `observed`; conflicts
    /// when it has since been rewritten or removed
    ConsumePriority {
        key: PriorityKey,
        observed: DateTime<Utc>,
    },
}

/// A set of mutations applied atomically: all or none
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_drive(mut self, drive: Drive, expected: Option<u64>) -> Self {
        self.ops.push(WriteOp::PutDrive { drive, expected });
        self
    }

    pub fn put_request(mut self, request: MountRequest, expected: Option<u64>) -> Self {
        self.ops.push(WriteOp::PutRequest { request, expected });
        self
    }

    pub fn delete_drive(mut self, id: DriveId, expected: u64) -> Self {
        self.ops.push(WriteOp::DeleteDrive { id, expected });
        self
    }

    pub fn delete_request(mut self, id: RequestId, expected: u64) -> Self {
        self.ops.push(WriteOp::DeleteRequest { id, expected });
        self
    }

    pub fn consume_priority(mut self, key: PriorityKey, observed: DateTime<Utc>) -> Self {
        self.ops.push(WriteOp::ConsumePriority { key, observed });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

// =============================================================================
// Persistence Port
// =============================================================================

/// Persistence contract required by the scheduler
#[async_trait]
pub trait VdqmStore: Send + Sync {
    // ---- identity records (unique insert-or-fetch) ----

    async fn select_or_create_volume(&self, vid: &str) -> Result<Volume>;

    async fn select_or_create_server(&self, name: &str) -> Result<TapeServer>;

    // ---- reference data ----

    async fn device_groups(&self) -> Result<Vec<DeviceGroup>>;

    async fn put_device_group(&self, group: DeviceGroup) -> Result<()>;

    async fn drive_compatibilities(&self) -> Result<Vec<DriveCompatibility>>;

    async fn put_drive_compatibility(&self, compatibility: DriveCompatibility) -> Result<()>;

    async fn access_specifications(&self) -> Result<Vec<AccessSpecification>>;

    async fn put_access_specification(&self, spec: AccessSpecification) -> Result<()>;

    // ---- versioned records ----

    async fn drive(&self, id: DriveId) -> Result<Option<Versioned<Drive>>>;

    /// Consistent snapshot of every drive
    async fn drives(&self) -> Result<Vec<Versioned<Drive>>>;

    async fn request(&self, id: RequestId) -> Result<Option<Versioned<MountRequest>>>;

    /// Consistent snapshot of every live request
    async fn requests(&self) -> Result<Vec<Versioned<MountRequest>>>;

    async fn next_drive_id(&self) -> Result<DriveId>;

    async fn next_request_id(&self) -> Result<RequestId>;

    /// Apply `batch` atomically. Fails with `Error::Contended` if any expected
    /// version no longer matches or a drive (name, server) pair is taken.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    // ---- priority overrides ----

    /// Overrides ordered by (vid, mode, lifespan)
    async fn priorities(&self) -> Result<Vec<VolumePriority>>;

    /// Upsert; returns the replaced entry
    async fn upsert_priority(&self, priority: VolumePriority) -> Result<Option<VolumePriority>>;

    /// Atomic get-and-remove
    async fn take_priority(&self, key: &PriorityKey) -> Result<Option<VolumePriority>>;

    /// Remove overrides of `lifespan` last modified before `cutoff`
    async fn expire_priorities(&self, lifespan: Lifespan, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Shared handle to a store
pub type VdqmStoreRef = Arc<dyn VdqmStore>;

// =============================================================================
// Drive Daemon Port
// =============================================================================

/// Job handed to the drive-side daemon once a pair is allocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveJob {
    pub drive: DriveId,
    pub unit: String,
    pub server: String,
    pub device_group: String,
    pub request: RequestId,
    pub vid: String,
    pub mode: AccessMode,
    pub client: ClientIdentity,
}

impl DriveJob {
    pub fn new(drive: &Drive, request: &MountRequest) -> Self {
        Self {
            drive: drive.id,
            unit: drive.name.clone(),
            server: drive.server.clone(),
            device_group: drive.device_group.clone(),
            request: request.id,
            vid: request.vid.clone(),
            mode: request.access_mode,
            client: request.client.clone(),
        }
    }
}

/// Drive-side daemon that starts the job on the tape server
#[async_trait]
pub trait DriveDaemon: Send + Sync {
    /// Hand a job over. Acceptance is reported back asynchronously through
    /// `confirm_submission`.
    async fn submit(&self, job: &DriveJob) -> Result<()>;
}

/// Shared handle to a drive daemon client
pub type DriveDaemonRef = Arc<dyn DriveDaemon>;
