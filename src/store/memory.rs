//! In-Memory Store
//!
//! Process-local [`VdqmStore`] used by the daemon and by tests. Drive,
//! request and priority tables sit behind one `RwLock` so a [`WriteBatch`]
//! validates and applies as a unit; identity tables use `DashMap`'s entry API
//! for insert-or-fetch.

use crate::domain::ports::{VdqmStore, Versioned, WriteBatch, WriteOp};
use crate::domain::types::*;
use crate::error::{Error, Result};
use crate::registry::Drive;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// =============================================================================
// Memory Store Configuration
// =============================================================================

/// Configuration for the memory store
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Number of shards for the identity maps (0 = auto)
    pub shard_count: usize,
    /// First id handed out for drives and requests
    pub first_id: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            shard_count: 0,
            first_id: 1,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct StoreStats {
    commits: AtomicU64,
    conflicts: AtomicU64,
}

/// Point-in-time copy of the store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub commits: u64,
    pub conflicts: u64,
}

// =============================================================================
// Memory Store
// =============================================================================

#[derive(Debug, Default)]
struct Tables {
    drives: BTreeMap<DriveId, Versioned<Drive>>,
    requests: BTreeMap<RequestId, Versioned<MountRequest>>,
    priorities: BTreeMap<PriorityKey, VolumePriority>,
}

impl Tables {
    fn validate(&self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::PutDrive { drive, expected } => {
                check_version(
                    self.drives.get(&drive.id).map(|d| d.version),
                    *expected,
                    || format!("drive {}", drive.id),
                )?;
                let taken = self.drives.values().any(|d| {
                    d.id != drive.id && d.name == drive.name && d.server == drive.server
                });
                if taken {
                    return Err(Error::contended(format!("drive {}", drive.unit())));
                }
                Ok(())
            }
            WriteOp::PutRequest { request, expected } => check_version(
                self.requests.get(&request.id).map(|r| r.version),
                *expected,
                || format!("request {}", request.id),
            ),
            WriteOp::DeleteDrive { id, expected } => check_version(
                self.drives.get(id).map(|d| d.version),
                Some(*expected),
                || format!("drive {}", id),
            ),
            WriteOp::DeleteRequest { id, expected } => check_version(
                self.requests.get(id).map(|r| r.version),
                Some(*expected),
                || format!("request {}", id),
            ),
            WriteOp::ConsumePriority { key, observed } => {
                match self.priorities.get(key) {
                    Some(p) if p.modified_at == *observed => Ok(()),
                    _ => Err(Error::contended(format!("volume priority {}", key))),
                }
            }
        }
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::PutDrive { drive, expected } => {
                let version = expected.map_or(1, |v| v + 1);
                self.drives.insert(drive.id, Versioned::new(version, drive));
            }
            WriteOp::PutRequest { request, expected } => {
                let version = expected.map_or(1, |v| v + 1);
                self.requests.insert(request.id, Versioned::new(version, request));
            }
            WriteOp::DeleteDrive { id, .. } => {
                self.drives.remove(&id);
            }
            WriteOp::DeleteRequest { id, .. } => {
                self.requests.remove(&id);
            }
            WriteOp::ConsumePriority { key, .. } => {
                self.priorities.remove(&key);
            }
        }
    }
}

fn check_version(
    current: Option<u64>,
    expected: Option<u64>,
    record: impl FnOnce() -> String,
) -> Result<()> {
    match (current, expected) {
        (None, None) => Ok(()),
        (Some(c), Some(e)) if c == e => Ok(()),
        _ => Err(Error::contended(record())),
    }
}

/// In-process scheduler store
pub struct MemoryStore {
    tables: RwLock<Tables>,
    volumes: DashMap<String, Volume>,
    servers: DashMap<String, TapeServer>,
    device_groups: RwLock<Vec<DeviceGroup>>,
    compatibilities: RwLock<Vec<DriveCompatibility>>,
    access_specs: RwLock<Vec<AccessSpecification>>,
    next_id: AtomicU64,
    stats: StoreStats,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a new store with the given config
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let (volumes, servers) = if config.shard_count > 0 {
            (
                DashMap::with_shard_amount(config.shard_count),
                DashMap::with_shard_amount(config.shard_count),
            )
        } else {
            (DashMap::new(), DashMap::new())
        };

        Self {
            tables: RwLock::new(Tables::default()),
            volumes,
            servers,
            device_groups: RwLock::new(Vec::new()),
            compatibilities: RwLock::new(Vec::new()),
            access_specs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(config.first_id),
            stats: StoreStats::default(),
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            commits: self.stats.commits.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
        }
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VdqmStore for MemoryStore {
    async fn select_or_create_volume(&self, vid: &str) -> Result<Volume> {
        if vid.is_empty() {
            return Err(Error::InvalidArgument("empty volume id".into()));
        }
        let entry = self
            .volumes
            .entry(vid.to_string())
            .or_insert_with(|| Volume {
                vid: vid.to_string(),
                created_at: Utc::now(),
            });
        Ok(entry.value().clone())
    }

    async fn select_or_create_server(&self, name: &str) -> Result<TapeServer> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty tape server name".into()));
        }
        let entry = self
            .servers
            .entry(name.to_string())
            .or_insert_with(|| TapeServer {
                name: name.to_string(),
                created_at: Utc::now(),
            });
        Ok(entry.value().clone())
    }

    async fn device_groups(&self) -> Result<Vec<DeviceGroup>> {
        Ok(self.device_groups.read().clone())
    }

    async fn put_device_group(&self, group: DeviceGroup) -> Result<()> {
        let mut groups = self.device_groups.write();
        match groups.iter_mut().find(|g| g.name == group.name) {
            Some(existing) => *existing = group,
            None => groups.push(group),
        }
        Ok(())
    }

    async fn drive_compatibilities(&self) -> Result<Vec<DriveCompatibility>> {
        Ok(self.compatibilities.read().clone())
    }

    async fn put_drive_compatibility(&self, compatibility: DriveCompatibility) -> Result<()> {
        let mut all = self.compatibilities.write();
        match all
            .iter_mut()
            .find(|c| c.drive_model == compatibility.drive_model)
        {
            Some(existing) => *existing = compatibility,
            None => all.push(compatibility),
        }
        Ok(())
    }

    async fn access_specifications(&self) -> Result<Vec<AccessSpecification>> {
        Ok(self.access_specs.read().clone())
    }

    async fn put_access_specification(&self, spec: AccessSpecification) -> Result<()> {
        let mut specs = self.access_specs.write();
        if !specs.contains(&spec) {
            specs.push(spec);
        }
        Ok(())
    }

    async fn drive(&self, id: DriveId) -> Result<Option<Versioned<Drive>>> {
        Ok(self.tables.read().drives.get(&id).cloned())
    }

    async fn drives(&self) -> Result<Vec<Versioned<Drive>>> {
        Ok(self.tables.read().drives.values().cloned().collect())
    }

    async fn request(&self, id: RequestId) -> Result<Option<Versioned<MountRequest>>> {
        Ok(self.tables.read().requests.get(&id).cloned())
    }

    async fn requests(&self) -> Result<Vec<Versioned<MountRequest>>> {
        Ok(self.tables.read().requests.values().cloned().collect())
    }

    async fn next_drive_id(&self) -> Result<DriveId> {
        Ok(DriveId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    async fn next_request_id(&self) -> Result<RequestId> {
        Ok(RequestId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write();

        if let Some(err) = batch.ops().iter().find_map(|op| tables.validate(op).err()) {
            self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            trace!(error = %err, "commit rejected");
            return Err(err);
        }

        for op in batch.into_ops() {
            tables.apply(op);
        }
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn priorities(&self) -> Result<Vec<VolumePriority>> {
        Ok(self.tables.read().priorities.values().cloned().collect())
    }

    async fn upsert_priority(&self, priority: VolumePriority) -> Result<Option<VolumePriority>> {
        let mut tables = self.tables.write();
        let key = priority.key();
        let previous = tables.priorities.get(&key).cloned();
        let priority = match &previous {
            Some(old) => VolumePriority {
                created_at: old.created_at,
                ..priority
            },
            None => priority,
        };
        tables.priorities.insert(key, priority);
        Ok(previous)
    }

    async fn take_priority(&self, key: &PriorityKey) -> Result<Option<VolumePriority>> {
        Ok(self.tables.write().priorities.remove(key))
    }

    async fn expire_priorities(&self, lifespan: Lifespan, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let before = tables.priorities.len();
        tables
            .priorities
            .retain(|key, p| key.lifespan != lifespan || p.modified_at >= cutoff);
        Ok((before - tables.priorities.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drive(id: u64, name: &str) -> Drive {
        Drive::new(DriveId(id), name, "tpsrv01", "T10K", "T10000C")
    }

    #[tokio::test]
    async fn test_insert_and_versioned_update() {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch::new().put_drive(drive(1, "D1"), None))
            .await
            .unwrap();

        let v = store.drive(DriveId(1)).await.unwrap().unwrap();
        assert_eq!(v.version, 1);

        let mut updated = v.record.clone();
        updated.use_count = 5;
        store
            .commit(WriteBatch::new().put_drive(updated.clone(), Some(1)))
            .await
            .unwrap();

        // Stale writer loses
        let err = store
            .commit(WriteBatch::new().put_drive(updated, Some(1)))
            .await
            .unwrap_err();
        assert!(err.is_contended());
        assert_eq!(store.drive(DriveId(1)).await.unwrap().unwrap().version, 2);
        assert_eq!(store.stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch::new().put_drive(drive(1, "D1"), None))
            .await
            .unwrap();

        // Second op conflicts, so the first must not land either
        let batch = WriteBatch::new()
            .put_drive(drive(2, "D2"), None)
            .put_drive(drive(1, "D1"), Some(7));
        assert!(store.commit(batch).await.is_err());
        assert!(store.drive(DriveId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unique_drive_name_per_server() {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch::new().put_drive(drive(1, "D1"), None))
            .await
            .unwrap();
        let err = store
            .commit(WriteBatch::new().put_drive(drive(2, "D1"), None))
            .await
            .unwrap_err();
        assert!(err.is_contended());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_select_or_create_volume_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.select_or_create_volume("I10547").await.unwrap()
            }));
        }
        let mut created = Vec::new();
        for h in handles {
            created.push(h.await.unwrap().created_at);
        }
        assert_eq!(store.volume_count(), 1);
        assert!(created.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_expire_only_touches_lifespan() {
        let store = MemoryStore::new();
        let old = Utc::now() - chrono::Duration::hours(2);
        let client = ClientIdentity::new("h", "u", 1, 1);
        for lifespan in [Lifespan::SingleMount, Lifespan::Persistent] {
            store
                .upsert_priority(VolumePriority {
                    vid: "V1".into(),
                    mode: AccessMode::Read,
                    lifespan,
                    priority: 10,
                    client: client.clone(),
                    created_at: old,
                    modified_at: old,
                })
                .await
                .unwrap();
        }
        let n = store
            .expire_priorities(Lifespan::SingleMount, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let left = store.priorities().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].lifespan, Lifespan::Persistent);
    }
}
