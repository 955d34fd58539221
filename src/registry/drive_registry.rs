//! Drive Registry
//!
//! Owns drive records: registration, administrative status changes,
//! dedications, deletion and the drive daemon's unit status reports. Every
//! update is a read-modify-commit against the observed version and is
//! retried a bounded number of times when another writer got there first.
//!
//! The registry never sets or clears the drive/request cross-pointers; that
//! is reserved to the allocation engine.

use super::dedication::Dedication;
use super::drive::Drive;
use super::events::RegistryEvent;
use super::status::{DriveStatus, LegacyFlags};
use crate::catalogue::{Catalogue, CompatibilityResolver};
use crate::domain::ports::{VdqmStoreRef, WriteBatch};
use crate::domain::types::DriveId;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default number of attempts for a contended drive update
pub const DEFAULT_UPDATE_ATTEMPTS: usize = 16;

// =============================================================================
// Registration / Reports
// =============================================================================

/// A drive as declared by configuration or an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDrive {
    pub name: String,
    pub server: String,
    pub device_group: String,
    pub model: String,
    /// Legacy dedication string, e.g. `vid=I10547,mode=read`
    #[serde(default)]
    pub dedication: Option<String>,
}

/// Unit status report sent by the drive-side daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DriveReport {
    Up,
    Down,
    Mount { vid: String },
    Release,
    Unmount,
    Heartbeat,
    Transfer { bytes: u64, errors: u64 },
    ForceUnmount,
}

impl std::fmt::Display for DriveReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveReport::Up => write!(f, "up"),
            DriveReport::Down => write!(f, "down"),
            DriveReport::Mount { vid } => write!(f, "mount {}", vid),
            DriveReport::Release => write!(f, "release"),
            DriveReport::Unmount => write!(f, "unmount"),
            DriveReport::Heartbeat => write!(f, "heartbeat"),
            DriveReport::Transfer { bytes, errors } => {
                write!(f, "transfer {} bytes, {} errors", bytes, errors)
            }
            DriveReport::ForceUnmount => write!(f, "force-unmount"),
        }
    }
}

/// Drive record with its legacy flag projection, for listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveView {
    #[serde(flatten)]
    pub drive: Drive,
    pub legacy_flags: LegacyFlags,
    pub flag_names: Vec<&'static str>,
}

impl From<Drive> for DriveView {
    fn from(drive: Drive) -> Self {
        let flags = drive.legacy_flags();
        Self {
            drive,
            legacy_flags: flags,
            flag_names: flags.names(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct RegistryStats {
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    status_changes: AtomicU64,
    contended_updates: AtomicU64,
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub registrations: u64,
    pub deregistrations: u64,
    pub status_changes: u64,
    pub contended_updates: u64,
}

// =============================================================================
// Drive Registry
// =============================================================================

/// Drive records and their state machine
pub struct DriveRegistry {
    store: VdqmStoreRef,
    catalogue: Catalogue,
    resolver: Arc<CompatibilityResolver>,
    max_attempts: usize,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DriveRegistry {
    /// Create a new drive registry
    pub fn new(store: VdqmStoreRef, resolver: Arc<CompatibilityResolver>) -> Arc<Self> {
        Self::with_attempts(store, resolver, DEFAULT_UPDATE_ATTEMPTS)
    }

    pub fn with_attempts(
        store: VdqmStoreRef,
        resolver: Arc<CompatibilityResolver>,
        max_attempts: usize,
    ) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            catalogue: Catalogue::new(store.clone()),
            store,
            resolver,
            max_attempts: max_attempts.max(1),
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    pub(crate) fn emit(&self, event: RegistryEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            registrations: self.stats.registrations.load(Ordering::Relaxed),
            deregistrations: self.stats.deregistrations.load(Ordering::Relaxed),
            status_changes: self.stats.status_changes.load(Ordering::Relaxed),
            contended_updates: self.stats.contended_updates.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a drive, or return the existing record for (name, server)
    pub async fn register(&self, new: NewDrive) -> Result<Drive> {
        if new.name.is_empty() {
            return Err(Error::InvalidArgument("empty drive name".into()));
        }
        let dedication = match new.dedication.as_deref() {
            Some(s) => Some(Dedication::parse(s)?).filter(|d| !d.is_unrestricted()),
            None => None,
        };
        self.catalogue.device_group(&new.device_group).await?;
        self.catalogue.tape_server(&new.server).await?;
        if !self.resolver.drive_serves(&new.model, &new.device_group).await? {
            return Err(Error::InvalidArgument(format!(
                "drive model {} cannot serve device group {}",
                new.model, new.device_group
            )));
        }

        for _ in 0..self.max_attempts {
            if let Some(existing) = self.find(&new.name, &new.server).await? {
                return Ok(existing);
            }

            let mut drive = Drive::new(
                self.store.next_drive_id().await?,
                new.name.clone(),
                new.server.clone(),
                new.device_group.clone(),
                new.model.clone(),
            );
            drive.dedication = dedication.clone();

            match self
                .store
                .commit(WriteBatch::new().put_drive(drive.clone(), None))
                .await
            {
                Ok(()) => {
                    self.stats.registrations.fetch_add(1, Ordering::Relaxed);
                    info!("Registered drive {} ({}) in {}", drive.unit(), drive.id, drive.device_group);
                    self.emit(RegistryEvent::DriveRegistered {
                        drive: drive.id,
                        unit: drive.unit(),
                    });
                    return Ok(drive);
                }
                Err(e) if e.is_contended() => {
                    self.stats.contended_updates.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::contended(format!("drive {}@{}", new.name, new.server)))
    }

    /// Delete an unbound drive
    pub async fn delete(&self, id: DriveId) -> Result<Drive> {
        for _ in 0..self.max_attempts {
            let current = self
                .store
                .drive(id)
                .await?
                .ok_or_else(|| Error::not_found("drive", id))?;
            if let Some(request) = current.bound_request {
                return Err(Error::ResourceBusy {
                    drive: current.unit(),
                    request: request.to_string(),
                });
            }

            match self
                .store
                .commit(WriteBatch::new().delete_drive(id, current.version))
                .await
            {
                Ok(()) => {
                    let drive = current.into_inner();
                    self.stats.deregistrations.fetch_add(1, Ordering::Relaxed);
                    info!("Deleted drive {} ({})", drive.unit(), drive.id);
                    self.emit(RegistryEvent::DriveRemoved {
                        drive: drive.id,
                        unit: drive.unit(),
                    });
                    return Ok(drive);
                }
                Err(e) if e.is_contended() => {
                    self.stats.contended_updates.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::contended(format!("drive {}", id)))
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn get(&self, id: DriveId) -> Result<Drive> {
        self.store
            .drive(id)
            .await?
            .map(|v| v.into_inner())
            .ok_or_else(|| Error::not_found("drive", id))
    }

    pub async fn find(&self, name: &str, server: &str) -> Result<Option<Drive>> {
        Ok(self
            .store
            .drives()
            .await?
            .into_iter()
            .find(|d| d.name == name && d.server == server)
            .map(|v| v.into_inner()))
    }

    /// Drives ordered by (device group, server, name), optionally filtered
    pub async fn listing(
        &self,
        device_group: Option<&str>,
        server: Option<&str>,
    ) -> Result<Vec<DriveView>> {
        let mut drives: Vec<Drive> = self
            .store
            .drives()
            .await?
            .into_iter()
            .map(|v| v.into_inner())
            .filter(|d| device_group.map_or(true, |g| d.device_group == g))
            .filter(|d| server.map_or(true, |s| d.server == s))
            .collect();
        drives.sort_by(|a, b| {
            (&a.device_group, &a.server, &a.name).cmp(&(&b.device_group, &b.server, &b.name))
        });
        Ok(drives.into_iter().map(DriveView::from).collect())
    }

    // =========================================================================
    // Administrative Updates
    // =========================================================================

    /// Replace a drive's dedication; an empty or all-wildcard string clears it
    pub async fn dedicate(&self, id: DriveId, dedication: &str) -> Result<Drive> {
        let parsed = Dedication::parse(dedication)?;
        let parsed = Some(parsed).filter(|d| !d.is_unrestricted());

        let (_, drive) = self
            .update(id, |d| {
                d.dedication = parsed.clone();
                Ok(())
            })
            .await?;

        let rendered = drive
            .dedication
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        info!("Dedicated drive {} to '{}'", drive.unit(), rendered);
        self.emit(RegistryEvent::Dedicated {
            drive: id,
            dedication: rendered,
        });
        Ok(drive)
    }

    /// Operator status change. Only UP, DOWN and FORCED_UNMOUNT may be set
    /// directly; bringing a bound drive back up needs a pair reset first and
    /// fails with `ResourceBusy`.
    pub async fn set_status(&self, id: DriveId, to: DriveStatus) -> Result<Drive> {
        if !to.is_admin_target() {
            return Err(Error::InvalidArgument(format!(
                "drive status {} cannot be set by an operator",
                to
            )));
        }
        self.move_to(id, to).await
    }

    /// Heartbeat loss: move to UNKNOWN
    pub async fn mark_unknown(&self, id: DriveId) -> Result<Drive> {
        self.move_to(id, DriveStatus::Unknown).await
    }

    /// Follow a state machine edge. A drive that goes UP holds no volume.
    async fn move_to(&self, id: DriveId, to: DriveStatus) -> Result<Drive> {
        let (_, drive) = self
            .update(id, |d| {
                if to == DriveStatus::Up {
                    if let Some(request) = d.bound_request {
                        return Err(Error::ResourceBusy {
                            drive: d.unit(),
                            request: request.to_string(),
                        });
                    }
                    d.mounted_vid = None;
                }
                d.status = d.status.transition(to)?;
                Ok(())
            })
            .await?;
        Ok(drive)
    }

    // =========================================================================
    // Drive Daemon Reports
    // =========================================================================

    /// Reject reports a host is not allowed to send for this drive
    pub fn authorize(&self, drive: &Drive, report: &DriveReport, host: &str) -> Result<()> {
        if matches!(report, DriveReport::Down) && drive.server != host {
            warn!(
                "Unauthorized DOWN report for {} from {}",
                drive.unit(),
                host
            );
            return Err(Error::InvalidArgument(format!(
                "unauthorized: {} may only be set down from {}",
                drive.unit(),
                drive.server
            )));
        }
        Ok(())
    }

    /// Apply the drive-local part of a unit status report. Pair handling
    /// (reset on up/down, completion on release) happens before this call.
    pub async fn apply_report(&self, id: DriveId, report: &DriveReport) -> Result<Drive> {
        debug!(drive = %id, report = %report, "applying drive report");

        match report {
            DriveReport::Up => {
                let (_, drive) = self
                    .update(id, |d| {
                        ensure_unbound(d, report)?;
                        d.status = d.status.transition(DriveStatus::Up)?;
                        d.mounted_vid = None;
                        d.last_heartbeat = Utc::now();
                        Ok(())
                    })
                    .await?;
                Ok(drive)
            }
            DriveReport::Down => self.move_to(id, DriveStatus::Down).await,
            DriveReport::Mount { vid } => {
                let current = self.get(id).await?;
                let request = match current.bound_request {
                    Some(r) => self.store.request(r).await?,
                    None => None,
                };
                match &request {
                    Some(r) if r.vid == *vid => {}
                    Some(r) => {
                        return Err(Error::InvalidArgument(format!(
                            "mounted volume {} does not match request {} for {}",
                            vid, r.id, r.vid
                        )))
                    }
                    None => {
                        return Err(Error::InvalidArgument(format!(
                            "mount of {} on {} without a job",
                            vid,
                            current.unit()
                        )))
                    }
                }
                let (_, drive) = self
                    .update(id, |d| {
                        d.status = d.status.transition(DriveStatus::Mounted)?;
                        d.mounted_vid = Some(vid.clone());
                        d.use_count += 1;
                        Ok(())
                    })
                    .await?;
                info!(vid = %vid, "Volume mounted on {}", drive.unit());
                Ok(drive)
            }
            DriveReport::Release => {
                // A loaded volume waits for its unmount (or a reuse); an
                // empty drive is free again unless an unmount was forced
                let (_, drive) = self
                    .update(id, |d| {
                        ensure_unbound(d, report)?;
                        d.status = match (d.status, d.mounted_vid.is_some()) {
                            (DriveStatus::Down, _) => {
                                return Err(Error::InvalidArgument(format!(
                                    "release reported for {} while down",
                                    d.unit()
                                )))
                            }
                            (status, true) => status.transition(DriveStatus::WaitUnmount)?,
                            (DriveStatus::ForcedUnmount, false) => DriveStatus::ForcedUnmount,
                            (status, false) => status.transition(DriveStatus::Up)?,
                        };
                        Ok(())
                    })
                    .await?;
                Ok(drive)
            }
            DriveReport::Unmount => {
                let current = self.get(id).await?;
                if !matches!(
                    current.status,
                    DriveStatus::WaitUnmount | DriveStatus::ForcedUnmount
                ) {
                    self.move_to(id, DriveStatus::Unknown).await?;
                    return Err(Error::InvalidArgument(format!(
                        "bad status: unmount reported for {} in {}",
                        current.unit(),
                        current.status
                    )));
                }
                let (_, drive) = self
                    .update(id, |d| {
                        ensure_unbound(d, report)?;
                        d.status = d.status.transition(DriveStatus::Up)?;
                        d.mounted_vid = None;
                        Ok(())
                    })
                    .await?;
                Ok(drive)
            }
            DriveReport::Heartbeat => {
                let (_, drive) = self
                    .update(id, |d| {
                        d.last_heartbeat = Utc::now();
                        if d.status == DriveStatus::Unknown
                            && d.bound_request.is_none()
                            && d.mounted_vid.is_none()
                        {
                            d.status = DriveStatus::Up;
                        }
                        Ok(())
                    })
                    .await?;
                Ok(drive)
            }
            DriveReport::Transfer { bytes, errors } => {
                let (_, drive) = self
                    .update(id, |d| {
                        d.bytes_transferred = d.bytes_transferred.saturating_add(*bytes);
                        d.error_count = d.error_count.saturating_add(*errors);
                        Ok(())
                    })
                    .await?;
                Ok(drive)
            }
            DriveReport::ForceUnmount => self.move_to(id, DriveStatus::ForcedUnmount).await,
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Read-modify-commit with bounded retry. Returns (before, after).
    async fn update<F>(&self, id: DriveId, mut mutate: F) -> Result<(Drive, Drive)>
    where
        F: FnMut(&mut Drive) -> Result<()> + Send,
    {
        for _ in 0..self.max_attempts {
            let current = self
                .store
                .drive(id)
                .await?
                .ok_or_else(|| Error::not_found("drive", id))?;

            let mut next = current.record.clone();
            mutate(&mut next)?;
            if next == current.record {
                return Ok((current.record, next));
            }
            next.modified_at = Utc::now();

            match self
                .store
                .commit(WriteBatch::new().put_drive(next.clone(), Some(current.version)))
                .await
            {
                Ok(()) => {
                    let before = current.into_inner();
                    if before.status != next.status {
                        self.stats.status_changes.fetch_add(1, Ordering::Relaxed);
                        info!("Drive {}: {} -> {}", next.unit(), before.status, next.status);
                        self.emit(RegistryEvent::StatusChanged {
                            drive: id,
                            from: before.status,
                            to: next.status,
                        });
                    }
                    return Ok((before, next));
                }
                Err(e) if e.is_contended() => {
                    self.stats.contended_updates.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::contended(format!("drive {}", id)))
    }
}

fn ensure_unbound(drive: &Drive, report: &DriveReport) -> Result<()> {
    match drive.bound_request {
        Some(request) => Err(Error::ResourceBusy {
            drive: drive.unit(),
            request: format!("{} (pending {})", request, report),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::seeded_store;
    use assert_matches::assert_matches;

    async fn registry() -> Arc<DriveRegistry> {
        let store = seeded_store().await;
        let resolver = Arc::new(CompatibilityResolver::new(store.clone()));
        DriveRegistry::new(store, resolver)
    }

    fn t10(name: &str) -> NewDrive {
        NewDrive {
            name: name.into(),
            server: "tpsrv01".into(),
            device_group: "G".into(),
            model: "T10000C".into(),
            dedication: None,
        }
    }

    #[tokio::test]
    async fn test_register_is_get_or_create() {
        let registry = registry().await;
        let mut events = registry.subscribe();
        let first = registry.register(t10("T10D1")).await.unwrap();
        let again = registry.register(t10("T10D1")).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(registry.stats().registrations, 1);
        assert_matches!(events.try_recv(), Ok(RegistryEvent::DriveRegistered { .. }));
    }

    #[tokio::test]
    async fn test_register_rejects_incompatible_model() {
        let registry = registry().await;
        let mut lto = t10("LTO1");
        lto.model = "LTO5-HH".into();
        assert_matches!(registry.register(lto).await, Err(Error::InvalidArgument(_)));

        let mut bad_group = t10("T10D2");
        bad_group.device_group = "NOPE".into();
        assert_matches!(registry.register(bad_group).await, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_dedicate_and_clear() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        let dedicated = registry.dedicate(d.id, "vid=I10547,mode=0").await.unwrap();
        assert_eq!(dedicated.dedication.as_ref().unwrap().vid.as_deref(), Some("I10547"));

        assert!(registry.dedicate(d.id, "uid=100").await.is_err());

        let cleared = registry.dedicate(d.id, "vid=.*").await.unwrap();
        assert!(cleared.dedication.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_vs_busy() {
        let registry = registry().await;
        assert_matches!(
            registry.delete(DriveId(404)).await,
            Err(Error::NotFound { kind: "drive", .. })
        );

        let d = registry.register(t10("T10D1")).await.unwrap();
        registry.delete(d.id).await.unwrap();
        assert!(registry.find("T10D1", "tpsrv01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_admin_status_changes() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();

        let down = registry.set_status(d.id, DriveStatus::Down).await.unwrap();
        assert_eq!(down.status, DriveStatus::Down);
        let up = registry.set_status(d.id, DriveStatus::Up).await.unwrap();
        assert!(up.is_free());
        assert_matches!(
            registry.set_status(d.id, DriveStatus::ForcedUnmount).await,
            Err(Error::IllegalTransition { .. })
        );
    }

    #[tokio::test]
    async fn test_operator_cannot_set_bound_states() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        for target in [
            DriveStatus::Starting,
            DriveStatus::Assigned,
            DriveStatus::Mounted,
            DriveStatus::WaitUnmount,
            DriveStatus::Unknown,
        ] {
            assert_matches!(
                registry.set_status(d.id, target).await,
                Err(Error::InvalidArgument(_)),
                "{} accepted",
                target
            );
        }
        let d = registry.get(d.id).await.unwrap();
        assert!(d.is_free());
        assert_eq!(registry.stats().status_changes, 0);
    }

    #[tokio::test]
    async fn test_up_clears_mounted_volume() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        registry
            .update(d.id, |d| {
                d.status = DriveStatus::Unknown;
                d.mounted_vid = Some("V1".into());
                Ok(())
            })
            .await
            .unwrap();

        let up = registry.set_status(d.id, DriveStatus::Up).await.unwrap();
        assert!(up.is_free());
        assert_eq!(up.mounted_vid, None);
    }

    /// Put an unbound drive in `status` holding `vid`
    async fn strand(registry: &DriveRegistry, id: DriveId, status: DriveStatus, vid: Option<&str>) {
        registry
            .update(id, |d| {
                d.status = status;
                d.mounted_vid = vid.map(str::to_string);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_without_volume_frees_drive() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        for status in [
            DriveStatus::Starting,
            DriveStatus::Assigned,
            DriveStatus::Unknown,
            DriveStatus::WaitUnmount,
        ] {
            strand(&registry, d.id, status, None).await;
            let released = registry.apply_report(d.id, &DriveReport::Release).await.unwrap();
            assert!(released.is_free(), "release from {} left {}", status, released.status);
        }
    }

    #[tokio::test]
    async fn test_release_with_volume_waits_for_unmount() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        for status in [
            DriveStatus::Assigned,
            DriveStatus::Mounted,
            DriveStatus::Unknown,
            DriveStatus::ForcedUnmount,
        ] {
            strand(&registry, d.id, status, Some("V1")).await;
            let released = registry.apply_report(d.id, &DriveReport::Release).await.unwrap();
            assert_eq!(released.status, DriveStatus::WaitUnmount, "release from {}", status);

            let unmounted = registry.apply_report(d.id, &DriveReport::Unmount).await.unwrap();
            assert!(unmounted.is_free());
            assert_eq!(unmounted.mounted_vid, None);
        }
    }

    #[tokio::test]
    async fn test_release_keeps_forced_unmount_and_down() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();

        strand(&registry, d.id, DriveStatus::ForcedUnmount, None).await;
        let released = registry.apply_report(d.id, &DriveReport::Release).await.unwrap();
        assert_eq!(released.status, DriveStatus::ForcedUnmount);
        let unmounted = registry.apply_report(d.id, &DriveReport::Unmount).await.unwrap();
        assert!(unmounted.is_free());

        registry.set_status(d.id, DriveStatus::Down).await.unwrap();
        assert_matches!(
            registry.apply_report(d.id, &DriveReport::Release).await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(registry.get(d.id).await.unwrap().status, DriveStatus::Down);
    }

    #[tokio::test]
    async fn test_down_report_only_from_own_server() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        assert!(registry.authorize(&d, &DriveReport::Down, "tpsrv01").is_ok());
        assert_matches!(
            registry.authorize(&d, &DriveReport::Down, "intruder"),
            Err(Error::InvalidArgument(_))
        );
        assert!(registry.authorize(&d, &DriveReport::Heartbeat, "intruder").is_ok());
    }

    #[tokio::test]
    async fn test_unmount_in_wrong_state_goes_unknown() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        assert_matches!(
            registry.apply_report(d.id, &DriveReport::Unmount).await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(registry.get(d.id).await.unwrap().status, DriveStatus::Unknown);

        // Heartbeat brings an idle unknown drive back
        let back = registry.apply_report(d.id, &DriveReport::Heartbeat).await.unwrap();
        assert_eq!(back.status, DriveStatus::Up);
    }

    #[tokio::test]
    async fn test_transfer_accumulates() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        for _ in 0..3 {
            registry
                .apply_report(d.id, &DriveReport::Transfer { bytes: 1000, errors: 1 })
                .await
                .unwrap();
        }
        let d = registry.get(d.id).await.unwrap();
        assert_eq!(d.bytes_transferred, 3000);
        assert_eq!(d.error_count, 3);
    }

    #[tokio::test]
    async fn test_mount_without_job_rejected() {
        let registry = registry().await;
        let d = registry.register(t10("T10D1")).await.unwrap();
        assert_matches!(
            registry
                .apply_report(d.id, &DriveReport::Mount { vid: "V1".into() })
                .await,
            Err(Error::InvalidArgument(_))
        );
    }
}
