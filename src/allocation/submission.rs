//! Submission Protocol
//!
//! Hand-off of allocated pairs to the drive daemon, confirmation, reset and
//! completion. Along with allocation and reuse these are the only paths
//! that write the drive/request cross-pointers.

use super::engine::AllocationEngine;
use crate::domain::ports::{Versioned, WriteBatch};
use crate::domain::types::{DriveId, MountRequest, RequestId, RequestStatus};
use crate::error::{Error, Result};
use crate::registry::{Drive, DriveSnapshot, DriveStatus, PairReport, RegistryEvent, RequestSnapshot};
use chrono::Utc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl AllocationEngine {
    // =========================================================================
    // Next To Submit
    // =========================================================================

    /// Claim the oldest Allocated pair for hand-off and mark its request
    /// Submitted. Returns `None` when nothing is waiting.
    pub async fn next_to_submit(&self) -> Result<Option<(Drive, MountRequest)>> {
        let mut allocated: Vec<Versioned<MountRequest>> = self
            .store
            .requests()
            .await?
            .into_iter()
            .filter(|r| r.status == RequestStatus::Allocated)
            .collect();
        allocated.sort_by_key(|r| (r.modified_at, r.id));

        for request in allocated {
            let Some(drive_id) = request.bound_drive else {
                continue;
            };
            let Some(drive) = self.store.drive(drive_id).await? else {
                continue;
            };
            if drive.bound_request != Some(request.id) || drive.status != DriveStatus::Starting {
                debug!(drive = %drive_id, request = %request.id, "skipping inconsistent pair");
                continue;
            }

            let mut next = request.record.clone();
            next.status = RequestStatus::Submitted;
            next.modified_at = Utc::now();

            match self
                .store
                .commit(WriteBatch::new().put_request(next.clone(), Some(request.version)))
                .await
            {
                Ok(()) => {
                    self.stats.submissions.fetch_add(1, Ordering::Relaxed);
                    debug!(drive = %drive_id, request = %next.id, "pair handed to submission");
                    return Ok(Some((drive.into_inner(), next)));
                }
                Err(e) if e.is_contended() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Confirm
    // =========================================================================

    /// Record the daemon's acceptance: drive STARTING -> ASSIGNED and request
    /// Submitted -> Confirmed, only if both still point at each other.
    /// `applied == false` means the caller's view was stale.
    pub async fn confirm_submission(
        &self,
        drive_id: DriveId,
        request_id: RequestId,
    ) -> Result<PairReport> {
        for _ in 0..self.max_attempts {
            let drive = self.store.drive(drive_id).await?;
            let request = self.store.request(request_id).await?;
            let drive_before = DriveSnapshot::of(drive.as_deref());
            let request_before = RequestSnapshot::of(request.as_deref());

            let (drive, request) = match (drive, request) {
                (Some(d), Some(r))
                    if d.bound_request == Some(request_id)
                        && r.bound_drive == Some(drive_id)
                        && d.status == DriveStatus::Starting
                        && r.status == RequestStatus::Submitted =>
                {
                    (d, r)
                }
                _ => {
                    warn!(
                        drive = %drive_id,
                        request = %request_id,
                        "Confirmation does not match pair state {:?} / {:?}",
                        drive_before.status,
                        request_before.status
                    );
                    return Ok(PairReport {
                        drive_after: drive_before.clone(),
                        request_after: request_before.clone(),
                        drive_before,
                        request_before,
                        applied: false,
                    });
                }
            };

            let now = Utc::now();
            let mut next_drive = drive.record.clone();
            next_drive.status = next_drive.status.transition(DriveStatus::Assigned)?;
            next_drive.modified_at = now;
            next_drive.last_heartbeat = now;
            let mut next_request = request.record.clone();
            next_request.status = RequestStatus::Confirmed;
            next_request.modified_at = now;

            let batch = WriteBatch::new()
                .put_drive(next_drive.clone(), Some(drive.version))
                .put_request(next_request.clone(), Some(request.version));
            match self.store.commit(batch).await {
                Ok(()) => {
                    self.stats.confirmations.fetch_add(1, Ordering::Relaxed);
                    info!(
                        drive = %drive_id,
                        request = %request_id,
                        "Drive daemon accepted job on {}",
                        next_drive.unit()
                    );
                    self.registry.emit(RegistryEvent::StatusChanged {
                        drive: drive_id,
                        from: drive.status,
                        to: next_drive.status,
                    });
                    self.registry.emit(RegistryEvent::PairConfirmed {
                        drive: drive_id,
                        request: request_id,
                    });
                    return Ok(PairReport {
                        drive_before,
                        request_before,
                        drive_after: DriveSnapshot::of(Some(&next_drive)),
                        request_after: RequestSnapshot::of(Some(&next_request)),
                        applied: true,
                    });
                }
                Err(e) if e.is_contended() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::contended(format!("pair {}/{}", drive_id, request_id)))
    }

    // =========================================================================
    // Reset
    // =========================================================================

    /// Idempotent recovery: drive back to UP (a DOWN drive stays DOWN) and
    /// request back to Pending, unbinding both. A side is only touched when
    /// it is bound to the other, or unbound; a second call is a no-op.
    pub async fn reset_pair(&self, drive_id: DriveId, request_id: RequestId) -> Result<PairReport> {
        for _ in 0..self.max_attempts {
            let drive = self.store.drive(drive_id).await?;
            let request = self.store.request(request_id).await?;
            let drive_before = DriveSnapshot::of(drive.as_deref());
            let request_before = RequestSnapshot::of(request.as_deref());
            let now = Utc::now();

            let next_drive = drive.as_ref().and_then(|d| {
                let owns = d.bound_request == Some(request_id)
                    || (d.bound_request.is_none() && d.status.is_active());
                if !owns {
                    return None;
                }
                let mut next = d.record.clone();
                next.bound_request = None;
                if next.status != DriveStatus::Down {
                    next.status = DriveStatus::Up;
                    next.mounted_vid = None;
                }
                let changed = next.status != d.status
                    || next.bound_request != d.bound_request
                    || next.mounted_vid != d.mounted_vid;
                changed.then(|| {
                    next.modified_at = now;
                    next.reset_at = Some(now);
                    (d.version, next)
                })
            });
            let next_request = request.as_ref().and_then(|r| {
                let owns = r.bound_drive == Some(drive_id) || r.bound_drive.is_none();
                if !owns || (r.bound_drive.is_none() && r.is_pending()) {
                    return None;
                }
                let mut next = r.record.clone();
                next.bound_drive = None;
                next.status = RequestStatus::Pending;
                next.modified_at = now;
                Some((r.version, next))
            });

            if next_drive.is_none() && next_request.is_none() {
                return Ok(PairReport {
                    drive_after: drive_before.clone(),
                    request_after: request_before.clone(),
                    drive_before,
                    request_before,
                    applied: false,
                });
            }

            let mut batch = WriteBatch::new();
            if let Some((version, d)) = &next_drive {
                batch = batch.put_drive(d.clone(), Some(*version));
            }
            if let Some((version, r)) = &next_request {
                batch = batch.put_request(r.clone(), Some(*version));
            }

            match self.store.commit(batch).await {
                Ok(()) => {
                    let drive_after = match &next_drive {
                        Some((_, d)) => DriveSnapshot::of(Some(d)),
                        None => drive_before.clone(),
                    };
                    let request_after = match &next_request {
                        Some((_, r)) => RequestSnapshot::of(Some(r)),
                        None => request_before.clone(),
                    };

                    self.stats.resets.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        drive = %drive_id,
                        request = %request_id,
                        "Reset pair: drive {:?} -> {:?}, request {:?} -> {:?}",
                        drive_before.status,
                        drive_after.status,
                        request_before.status,
                        request_after.status
                    );
                    if let (Some(from), Some(to)) = (drive_before.status, drive_after.status) {
                        if from != to {
                            self.registry.emit(RegistryEvent::StatusChanged {
                                drive: drive_id,
                                from,
                                to,
                            });
                        }
                    }
                    self.registry.emit(RegistryEvent::PairReset {
                        drive: drive_id,
                        request: request_id,
                    });
                    return Ok(PairReport {
                        drive_before,
                        request_before,
                        drive_after,
                        request_after,
                        applied: true,
                    });
                }
                Err(e) if e.is_contended() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::contended(format!("pair {}/{}", drive_id, request_id)))
    }

    // =========================================================================
    // Completion / Cancellation
    // =========================================================================

    /// Remove a finished request and clear the drive's pointer in one commit.
    /// The drive keeps its status and mounted volume.
    pub async fn complete_request(
        &self,
        drive_id: DriveId,
        request_id: RequestId,
    ) -> Result<MountRequest> {
        for _ in 0..self.max_attempts {
            let drive = self
                .store
                .drive(drive_id)
                .await?
                .ok_or_else(|| Error::not_found("drive", drive_id))?;
            let request = self
                .store
                .request(request_id)
                .await?
                .ok_or_else(|| Error::not_found("request", request_id))?;
            if drive.bound_request != Some(request_id) || request.bound_drive != Some(drive_id) {
                return Err(Error::InvalidArgument(format!(
                    "request {} is not running on drive {}",
                    request_id,
                    drive.unit()
                )));
            }

            let mut next_drive = drive.record.clone();
            next_drive.bound_request = None;
            next_drive.modified_at = Utc::now();

            let batch = WriteBatch::new()
                .put_drive(next_drive, Some(drive.version))
                .delete_request(request_id, request.version);
            match self.store.commit(batch).await {
                Ok(()) => {
                    self.stats.completions.fetch_add(1, Ordering::Relaxed);
                    info!(
                        drive = %drive_id,
                        request = %request_id,
                        vid = %request.vid,
                        "Request finished on {}",
                        drive.unit()
                    );
                    self.registry.emit(RegistryEvent::RequestCompleted {
                        drive: drive_id,
                        request: request_id,
                    });
                    return Ok(request.into_inner());
                }
                Err(e) if e.is_contended() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::contended(format!("pair {}/{}", drive_id, request_id)))
    }

    /// Drop a request from the queue, resetting its pair first if bound
    pub async fn cancel_request(&self, request_id: RequestId) -> Result<MountRequest> {
        for _ in 0..self.max_attempts {
            let request = self
                .store
                .request(request_id)
                .await?
                .ok_or_else(|| Error::not_found("request", request_id))?;

            if let Some(drive_id) = request.bound_drive {
                self.reset_pair(drive_id, request_id).await?;
                continue;
            }

            match self
                .store
                .commit(WriteBatch::new().delete_request(request_id, request.version))
                .await
            {
                Ok(()) => {
                    info!(request = %request_id, vid = %request.vid, "Cancelled request");
                    return Ok(request.into_inner());
                }
                Err(e) if e.is_contended() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::contended(format!("request {}", request_id)))
    }
}
