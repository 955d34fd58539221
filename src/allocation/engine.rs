//! Allocation Engine
//!
//! Matches pending mount requests to free drives. There is no engine-wide
//! lock: each attempt works on a snapshot and binds a (drive, request) pair
//! with one conditional commit against both observed versions, so two
//! allocators racing for the same pair cannot both win. The loser observes
//! [`AllocationOutcome::Contended`] and is expected to try again.

use crate::catalogue::CompatibilityResolver;
use crate::domain::ports::{VdqmStoreRef, Versioned, WriteBatch};
use crate::domain::types::{AccessMode, DriveId, MountRequest, RequestStatus};
use crate::error::{Error, Result};
use crate::priority::{EffectivePriorities, PriorityStore};
use crate::queue::{canonical_order, QueueFilter, RankedRequest};
use crate::registry::{Drive, DriveRegistry, DriveStatus, RegistryEvent};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Outcome
// =============================================================================

/// Tri-state result of `allocate` and `reuse`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// The pair was bound; drive is STARTING, request is Allocated
    Allocated(Drive, MountRequest),
    /// No compatible (free drive, pending request) pair exists
    NoneAvailable,
    /// A concurrent caller claimed one side first; call again
    Contended,
}

impl AllocationOutcome {
    pub fn is_allocated(&self) -> bool {
        matches!(self, AllocationOutcome::Allocated(..))
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub(crate) allocations: AtomicU64,
    pub(crate) reuses: AtomicU64,
    pub(crate) contended: AtomicU64,
    pub(crate) submissions: AtomicU64,
    pub(crate) confirmations: AtomicU64,
    pub(crate) resets: AtomicU64,
    pub(crate) completions: AtomicU64,
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub allocations: u64,
    pub reuses: u64,
    pub contended: u64,
    pub submissions: u64,
    pub confirmations: u64,
    pub resets: u64,
    pub completions: u64,
}

// =============================================================================
// Allocation Engine
// =============================================================================

/// Allocation engine and submission protocol
pub struct AllocationEngine {
    pub(crate) store: VdqmStoreRef,
    pub(crate) registry: Arc<DriveRegistry>,
    resolver: Arc<CompatibilityResolver>,
    priorities: PriorityStore,
    pub(crate) max_attempts: usize,
    pub(crate) stats: EngineStats,
}

impl AllocationEngine {
    pub fn new(
        store: VdqmStoreRef,
        registry: Arc<DriveRegistry>,
        resolver: Arc<CompatibilityResolver>,
        priorities: PriorityStore,
        max_attempts: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            resolver,
            priorities,
            max_attempts: max_attempts.max(1),
            stats: EngineStats::default(),
        })
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            allocations: self.stats.allocations.load(Ordering::Relaxed),
            reuses: self.stats.reuses.load(Ordering::Relaxed),
            contended: self.stats.contended.load(Ordering::Relaxed),
            submissions: self.stats.submissions.load(Ordering::Relaxed),
            confirmations: self.stats.confirmations.load(Ordering::Relaxed),
            resets: self.stats.resets.load(Ordering::Relaxed),
            completions: self.stats.completions.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Allocate
    // =========================================================================

    /// Bind the best pending request to a free drive.
    ///
    /// Free drives are tried in ascending id order; each takes the first
    /// compatible request in canonical queue order. Requests for a volume
    /// already mounted or bound on some drive are left to [`Self::reuse`].
    pub async fn allocate(&self) -> Result<AllocationOutcome> {
        let drives = self.store.drives().await?;
        let requests = self.store.requests().await?;
        let effective = self.priorities.effective().await?;
        let now = Utc::now();

        let bound_vids: HashMap<_, _> = requests
            .iter()
            .filter(|r| r.bound_drive.is_some())
            .map(|r| (r.id, r.vid.clone()))
            .collect();
        let busy_vids: HashSet<String> = drives
            .iter()
            .flat_map(|d| {
                let bound = d.bound_request.and_then(|r| bound_vids.get(&r).cloned());
                d.mounted_vid.clone().into_iter().chain(bound)
            })
            .collect();

        let pending = canonical_order(
            requests
                .into_iter()
                .filter(|r| r.is_pending() && !busy_vids.contains(&r.vid)),
            &effective,
            &QueueFilter::default(),
        );
        if pending.is_empty() {
            return Ok(AllocationOutcome::NoneAvailable);
        }

        let mut free: Vec<&Versioned<Drive>> = drives.iter().filter(|d| d.is_free()).collect();
        free.sort_by_key(|d| d.id);

        for drive in free {
            let groups = self.resolver.device_groups_for_model(&drive.model).await?;
            if let Some(candidate) = pending
                .iter()
                .find(|r| eligible(drive, &r.request, &groups, now))
            {
                debug!(
                    drive = %drive.id,
                    request = %candidate.request.id,
                    priority = candidate.effective_priority,
                    "allocation candidate"
                );
                return self.bind(drive, candidate, &effective, false).await;
            }
        }

        Ok(AllocationOutcome::NoneAvailable)
    }

    // =========================================================================
    // Reuse
    // =========================================================================

    /// Bind a pending request for `vid`/`mode` to a drive that still holds
    /// that volume, skipping the unmount/remount cycle
    pub async fn reuse(
        &self,
        drive_id: DriveId,
        vid: &str,
        mode: AccessMode,
    ) -> Result<AllocationOutcome> {
        let drive = self
            .store
            .drive(drive_id)
            .await?
            .ok_or_else(|| Error::not_found("drive", drive_id))?;

        let reusable = drive.bound_request.is_none()
            && drive.mounted_vid.as_deref() == Some(vid)
            && matches!(drive.status, DriveStatus::Mounted | DriveStatus::WaitUnmount);
        if !reusable {
            return Ok(AllocationOutcome::NoneAvailable);
        }

        let effective = self.priorities.effective().await?;
        let groups = self.resolver.device_groups_for_model(&drive.model).await?;
        let now = Utc::now();

        let candidates = self
            .store
            .requests()
            .await?
            .into_iter()
            .filter(|r| r.is_pending() && r.vid == vid && r.access_mode == mode);
        let ranked = canonical_order(candidates, &effective, &QueueFilter::default());

        match ranked
            .iter()
            .find(|r| eligible(&drive, &r.request, &groups, now))
        {
            Some(candidate) => self.bind(&drive, candidate, &effective, true).await,
            None => Ok(AllocationOutcome::NoneAvailable),
        }
    }

    // =========================================================================
    // Volume Queries
    // =========================================================================

    /// A drive is bound to a request for `vid`, or holds it while UNKNOWN
    pub async fn has_drive_with_volume_in_use(&self, vid: &str) -> Result<bool> {
        let requests: HashMap<_, _> = self
            .store
            .requests()
            .await?
            .into_iter()
            .map(|r| (r.id, r.into_inner()))
            .collect();

        Ok(self.store.drives().await?.iter().any(|d| {
            let bound = d
                .bound_request
                .and_then(|r| requests.get(&r))
                .map_or(false, |r| r.vid == vid);
            let stranded =
                d.status == DriveStatus::Unknown && d.mounted_vid.as_deref() == Some(vid);
            bound || stranded
        }))
    }

    /// Some drive has `vid` loaded
    pub async fn has_drive_with_volume_mounted(&self, vid: &str) -> Result<bool> {
        Ok(self
            .store
            .drives()
            .await?
            .iter()
            .any(|d| d.mounted_vid.as_deref() == Some(vid)))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Single conditional commit binding both sides of the pair
    async fn bind(
        &self,
        drive: &Versioned<Drive>,
        candidate: &RankedRequest,
        effective: &EffectivePriorities,
        reused: bool,
    ) -> Result<AllocationOutcome> {
        let now = Utc::now();
        let request = &candidate.request;

        let mut next_drive = drive.record.clone();
        next_drive.status = next_drive.status.transition(DriveStatus::Starting)?;
        next_drive.bound_request = Some(request.id);
        next_drive.modified_at = now;

        let mut next_request = request.record.clone();
        next_request.status = RequestStatus::Allocated;
        next_request.bound_drive = Some(drive.id);
        next_request.modified_at = now;

        let mut batch = WriteBatch::new()
            .put_drive(next_drive.clone(), Some(drive.version))
            .put_request(next_request.clone(), Some(request.version));
        let consumed = effective.single_mount_key(&next_request);
        if let Some((key, observed)) = consumed.clone() {
            batch = batch.consume_priority(key, observed);
        }

        match self.store.commit(batch).await {
            Ok(()) => {
                let counter = if reused {
                    &self.stats.reuses
                } else {
                    &self.stats.allocations
                };
                counter.fetch_add(1, Ordering::Relaxed);

                info!(
                    drive = %next_drive.id,
                    request = %next_request.id,
                    vid = %next_request.vid,
                    "{} {} for {} on {} (priority {})",
                    if reused { "Reused" } else { "Allocated" },
                    next_drive.unit(),
                    next_request.access_mode,
                    next_request.device_group,
                    candidate.effective_priority
                );
                if let Some((key, _)) = consumed {
                    debug!(key = %key, "single-mount priority consumed");
                }
                self.registry.emit(RegistryEvent::StatusChanged {
                    drive: next_drive.id,
                    from: drive.status,
                    to: next_drive.status,
                });
                self.registry.emit(RegistryEvent::PairAllocated {
                    drive: next_drive.id,
                    request: next_request.id,
                    reused,
                });
                Ok(AllocationOutcome::Allocated(next_drive, next_request))
            }
            Err(e) if e.is_contended() => {
                self.stats.contended.fetch_add(1, Ordering::Relaxed);
                debug!(drive = %drive.id, request = %request.id, "lost allocation race");
                Ok(AllocationOutcome::Contended)
            }
            Err(e) => Err(e),
        }
    }
}

/// Hard filters: device group, explicit drive/server, dedication
fn eligible(drive: &Drive, request: &MountRequest, groups: &[String], now: DateTime<Utc>) -> bool {
    if request.device_group != drive.device_group || !groups.contains(&request.device_group) {
        return false;
    }
    if let Some(name) = &request.requested_drive {
        if *name != drive.name {
            return false;
        }
    }
    if let Some(server) = &request.requested_server {
        if *server != drive.server {
            return false;
        }
    }
    drive
        .dedication
        .as_ref()
        .map_or(true, |d| d.admits(request, now))
}
