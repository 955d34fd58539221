//! Volume Priority Store
//!
//! Administrative priority overrides keyed by (volume, mode, lifespan).
//! Single-mount overrides are consumed by the next successful allocation of
//! the volume or reclaimed by [`PriorityStore::expire_older_than`];
//! persistent overrides stay until deleted.

use crate::domain::ports::VdqmStoreRef;
use crate::domain::types::{
    AccessMode, ClientIdentity, Lifespan, MountRequest, PriorityKey, VolumePriority,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

// =============================================================================
// Effective Priorities
// =============================================================================

/// The override that wins for one (volume, mode)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePriority {
    pub vid: String,
    pub mode: AccessMode,
    pub priority: i32,
    pub lifespan: Lifespan,
    /// When the winning override was last written
    pub modified_at: DateTime<Utc>,
}

/// Override table folded for lookup during ordering
#[derive(Debug, Clone, Default)]
pub struct EffectivePriorities {
    by_volume: BTreeMap<(String, AccessMode), EffectivePriority>,
}

impl EffectivePriorities {
    /// Fold overrides: a single-mount override beats a persistent one
    pub fn from_overrides(overrides: impl IntoIterator<Item = VolumePriority>) -> Self {
        let mut by_volume: BTreeMap<(String, AccessMode), EffectivePriority> = BTreeMap::new();
        for p in overrides {
            let key = (p.vid.clone(), p.mode);
            let wins = match by_volume.get(&key) {
                Some(current) => p.lifespan == Lifespan::SingleMount
                    && current.lifespan == Lifespan::Persistent,
                None => true,
            };
            if wins {
                by_volume.insert(
                    key,
                    EffectivePriority {
                        vid: p.vid,
                        mode: p.mode,
                        priority: p.priority,
                        lifespan: p.lifespan,
                        modified_at: p.modified_at,
                    },
                );
            }
        }
        Self { by_volume }
    }

    pub fn get(&self, vid: &str, mode: AccessMode) -> Option<&EffectivePriority> {
        self.by_volume.get(&(vid.to_string(), mode))
    }

    /// Base priority merged with the winning override
    pub fn resolve(&self, request: &MountRequest) -> i32 {
        self.get(&request.vid, request.access_mode)
            .map_or(request.priority, |p| p.priority)
    }

    /// The single-mount override a successful allocation of `request` consumes
    /// together with the write time it was ranked with
    pub fn single_mount_key(&self, request: &MountRequest) -> Option<(PriorityKey, DateTime<Utc>)> {
        self.get(&request.vid, request.access_mode)
            .filter(|p| p.lifespan == Lifespan::SingleMount)
            .map(|p| (PriorityKey::new(p.vid.clone(), p.mode, p.lifespan), p.modified_at))
    }

    /// Ordered by (vid, mode)
    pub fn entries(&self) -> Vec<EffectivePriority> {
        self.by_volume.values().cloned().collect()
    }
}

// =============================================================================
// Priority Store
// =============================================================================

/// Upsert / delete / expire / list priority overrides
#[derive(Clone)]
pub struct PriorityStore {
    store: VdqmStoreRef,
}

impl PriorityStore {
    pub fn new(store: VdqmStoreRef) -> Self {
        Self { store }
    }

    /// Upsert an override; last write wins. Returns the replaced entry.
    pub async fn set_priority(
        &self,
        vid: &str,
        mode: AccessMode,
        lifespan: Lifespan,
        priority: i32,
        client: ClientIdentity,
    ) -> Result<Option<VolumePriority>> {
        let volume = self.store.select_or_create_volume(vid).await?;
        let now = Utc::now();
        let previous = self
            .store
            .upsert_priority(VolumePriority {
                vid: volume.vid,
                mode,
                lifespan,
                priority,
                client: client.clone(),
                created_at: now,
                modified_at: now,
            })
            .await?;

        info!(
            "Set {} priority {} for {} ({}) by {}@{}",
            lifespan, priority, vid, mode, client.user, client.host
        );
        Ok(previous)
    }

    /// Atomic get-and-remove; returns the removed override for audit
    pub async fn delete_priority(
        &self,
        vid: &str,
        mode: AccessMode,
        lifespan: Lifespan,
    ) -> Result<VolumePriority> {
        let key = PriorityKey::new(vid, mode, lifespan);
        let removed = self
            .store
            .take_priority(&key)
            .await?
            .ok_or_else(|| Error::not_found("volume priority", &key))?;

        info!(
            "Deleted {} priority {} for {} ({}), set by {}@{}",
            lifespan, removed.priority, vid, mode, removed.client.user, removed.client.host
        );
        Ok(removed)
    }

    /// Reclaim single-mount overrides older than `max_age`
    pub async fn expire_older_than(&self, max_age: Duration) -> Result<u64> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::InvalidArgument(format!("max age out of range: {}", e)))?;
        let expired = self
            .store
            .expire_priorities(Lifespan::SingleMount, Utc::now() - max_age)
            .await?;
        if expired > 0 {
            info!("Expired {} single-mount volume priorities", expired);
        }
        Ok(expired)
    }

    /// Full override table ordered by (vid, mode, lifespan)
    pub async fn list(&self) -> Result<Vec<VolumePriority>> {
        let mut all = self.store.priorities().await?;
        all.sort_by_key(|p| p.key());
        Ok(all)
    }

    /// Overrides of one lifespan ordered by (vid, mode)
    pub async fn list_by_lifespan(&self, lifespan: Lifespan) -> Result<Vec<VolumePriority>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|p| p.lifespan == lifespan)
            .collect())
    }

    /// Folded view used by ordering
    pub async fn effective(&self) -> Result<EffectivePriorities> {
        Ok(EffectivePriorities::from_overrides(self.store.priorities().await?))
    }
}
