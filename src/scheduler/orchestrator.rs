//! VDQM Facade
//!
//! Wires the store, catalogue, priority store, queue, drive registry,
//! allocation engine and liveness monitor together, and owns the
//! background tasks (scheduler workers and the liveness sweep).
//!
//! Operations that touch both a drive and its request (drive reports,
//! cancellation, confirmation) go through here so the pair protocol runs
//! before the drive-local update.

use super::board::ConfirmationBoard;
use super::daemon::HttpDriveDaemon;
use super::worker::{SchedulerWorker, WorkerConfig};
use crate::allocation::{AllocationEngine, AllocationOutcome};
use crate::catalogue::{Catalogue, CompatibilityResolver};
use crate::config::VdqmConfig;
use crate::domain::ports::{DriveDaemonRef, VdqmStoreRef};
use crate::domain::types::{
    AccessMode, ClientIdentity, DriveId, Lifespan, MountRequest, RequestId, VolumePriority,
};
use crate::error::{Error, Result};
use crate::liveness::{LivenessMonitor, SweepReport};
use crate::metrics::SchedulerMetrics;
use crate::priority::{EffectivePriority, PriorityStore};
use crate::queue::{NewMountRequest, QueueEntry, QueueFilter, RequestQueue};
use crate::registry::{
    Drive, DriveRegistry, DriveReport, DriveStatus, DriveView, NewDrive, PairReport,
};
use crate::store::MemoryStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time summary for the status endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VdqmStatus {
    pub version: String,
    pub running: bool,
    pub workers: usize,
    pub queued_requests: usize,
    pub drives: usize,
    pub free_drives: usize,
    pub pending_confirmations: usize,
}

/// Volume & drive queue manager
pub struct Vdqm {
    config: VdqmConfig,
    store: VdqmStoreRef,
    catalogue: Catalogue,
    resolver: Arc<CompatibilityResolver>,
    priorities: PriorityStore,
    queue: RequestQueue,
    registry: Arc<DriveRegistry>,
    engine: Arc<AllocationEngine>,
    liveness: Arc<LivenessMonitor>,
    daemon: DriveDaemonRef,
    board: Arc<ConfirmationBoard>,
    metrics: SchedulerMetrics,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Vdqm {
    /// Build over an existing store and drive daemon
    pub fn new(store: VdqmStoreRef, daemon: DriveDaemonRef, config: VdqmConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = SchedulerMetrics::new()?;
        let resolver = Arc::new(CompatibilityResolver::new(store.clone()));
        let priorities = PriorityStore::new(store.clone());
        let registry =
            DriveRegistry::with_attempts(store.clone(), resolver.clone(), config.max_reset_attempts);
        let queue = RequestQueue::new(store.clone(), resolver.clone(), priorities.clone());
        let engine = AllocationEngine::new(
            store.clone(),
            registry.clone(),
            resolver.clone(),
            priorities.clone(),
            config.max_reset_attempts,
        );
        let liveness = Arc::new(
            LivenessMonitor::new(
                store.clone(),
                engine.clone(),
                registry.clone(),
                priorities.clone(),
                config.liveness(),
            )
            .with_metrics(metrics.clone()),
        );

        Ok(Arc::new(Self {
            catalogue: Catalogue::new(store.clone()),
            config,
            store,
            resolver,
            priorities,
            queue,
            registry,
            engine,
            liveness,
            daemon,
            board: Arc::new(ConfirmationBoard::new()),
            metrics,
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// In-memory store, HTTP drive daemons, reference data and drives from
    /// the configuration
    pub async fn from_config(config: VdqmConfig) -> Result<Arc<Self>> {
        let daemon: DriveDaemonRef = Arc::new(HttpDriveDaemon::new(config.daemon.clone())?);
        let store: VdqmStoreRef = Arc::new(MemoryStore::new());
        let vdqm = Self::new(store, daemon, config)?;
        vdqm.seed().await?;
        Ok(vdqm)
    }

    /// Load the configured reference data and drive inventory
    pub async fn seed(&self) -> Result<()> {
        for group in &self.config.device_groups {
            self.catalogue.add_device_group(group.clone()).await?;
        }
        for spec in &self.config.access_specifications {
            self.resolver.add_access_specification(spec.clone()).await?;
        }
        for compatibility in &self.config.drive_compatibilities {
            self.resolver
                .add_drive_compatibility(compatibility.clone())
                .await?;
        }
        for drive in &self.config.drives {
            self.registry.register(drive.clone()).await?;
        }
        info!(
            "Loaded {} device groups, {} access specifications, {} drive models, {} drives",
            self.config.device_groups.len(),
            self.config.access_specifications.len(),
            self.config.drive_compatibilities.len(),
            self.config.drives.len()
        );
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &VdqmConfig {
        &self.config
    }

    pub fn store(&self) -> &VdqmStoreRef {
        &self.store
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    pub fn resolver(&self) -> &Arc<CompatibilityResolver> {
        &self.resolver
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<DriveRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<AllocationEngine> {
        &self.engine
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }

    pub fn board(&self) -> &Arc<ConfirmationBoard> {
        &self.board
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Admit a mount request and wake the workers
    pub async fn submit_request(&self, new: NewMountRequest) -> Result<MountRequest> {
        match self.queue.submit(new).await {
            Ok(request) => {
                self.metrics.admissions.inc();
                self.wake.notify_waiters();
                Ok(request)
            }
            Err(e) => {
                if matches!(e, Error::DuplicateRequest { .. }) {
                    self.metrics.duplicates.inc();
                }
                Err(e)
            }
        }
    }

    pub async fn request(&self, id: RequestId) -> Result<MountRequest> {
        self.queue.get(id).await
    }

    pub async fn queue_listing(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>> {
        self.queue.listing(filter).await
    }

    pub async fn queue_position(&self, id: RequestId) -> Result<i64> {
        self.queue.position(id).await
    }

    /// Drop a request, resetting its pair first if it was bound
    pub async fn cancel_request(&self, id: RequestId) -> Result<MountRequest> {
        let request = self.engine.cancel_request(id).await?;
        self.board.forget(id);
        self.wake.notify_waiters();
        Ok(request)
    }

    // =========================================================================
    // Drives
    // =========================================================================

    pub async fn register_drive(&self, new: NewDrive) -> Result<Drive> {
        let drive = self.registry.register(new).await?;
        self.wake.notify_waiters();
        Ok(drive)
    }

    pub async fn delete_drive(&self, id: DriveId) -> Result<Drive> {
        self.registry.delete(id).await
    }

    pub async fn drive(&self, id: DriveId) -> Result<Drive> {
        self.registry.get(id).await
    }

    pub async fn drive_listing(
        &self,
        device_group: Option<&str>,
        server: Option<&str>,
    ) -> Result<Vec<DriveView>> {
        self.registry.listing(device_group, server).await
    }

    pub async fn dedicate_drive(&self, id: DriveId, dedication: &str) -> Result<Drive> {
        let drive = self.registry.dedicate(id, dedication).await?;
        self.wake.notify_waiters();
        Ok(drive)
    }

    /// Operator status change: UP, DOWN or FORCED_UNMOUNT. Taking a bound
    /// drive down resets its pair.
    pub async fn set_drive_status(&self, id: DriveId, status: DriveStatus) -> Result<Drive> {
        if !status.is_admin_target() {
            return Err(Error::InvalidArgument(format!(
                "drive status {} cannot be set by an operator",
                status
            )));
        }
        if status == DriveStatus::Down {
            self.release_pair(id).await?;
        }
        let drive = self.registry.set_status(id, status).await?;
        if drive.is_free() {
            self.wake.notify_waiters();
        }
        Ok(drive)
    }

    /// Unit status report from the drive daemon on `host`
    pub async fn report(&self, id: DriveId, report: DriveReport, host: &str) -> Result<Drive> {
        let current = self.registry.get(id).await?;
        if !self.config.admin_hosts.iter().any(|h| h == host) {
            self.registry.authorize(&current, &report, host)?;
        }

        let finished = match (&report, current.bound_request) {
            // The daemon restarted or the drive went away: the job is lost
            (DriveReport::Up | DriveReport::Down, Some(_)) => {
                self.release_pair(id).await?;
                None
            }
            (DriveReport::Release, Some(request)) => {
                let done = self.engine.complete_request(id, request).await?;
                self.board.forget(request);
                Some(done)
            }
            _ => None,
        };

        let mut drive = self.registry.apply_report(id, &report).await?;

        // A finished job leaves its volume loaded: hand it to the next
        // request for it, unless the drive was lost or force-unmounted
        let loaded = drive.mounted_vid.is_some();
        if let (DriveReport::Release, Some(done), true) = (&report, finished, loaded) {
            let reusable = !matches!(
                current.status,
                DriveStatus::Unknown | DriveStatus::ForcedUnmount
            );
            drive = self
                .reuse_or_drop_priority(drive, &done.vid, done.access_mode, reusable)
                .await?;
        }
        if drive.is_free() {
            self.wake.notify_waiters();
        }
        Ok(drive)
    }

    /// Keep the volume loaded for the next request that wants it, otherwise
    /// reclaim the single-mount override it was scheduled with
    async fn reuse_or_drop_priority(
        &self,
        drive: Drive,
        vid: &str,
        mode: AccessMode,
        reusable: bool,
    ) -> Result<Drive> {
        if reusable {
            match self.engine.reuse(drive.id, vid, mode).await? {
                AllocationOutcome::Allocated(reused, request) => {
                    self.metrics.reuses.inc();
                    debug!(drive = %reused.id, request = %request.id, vid = %vid, "volume reused");
                    self.wake.notify_waiters();
                    return Ok(reused);
                }
                AllocationOutcome::Contended => {
                    warn!(drive = %drive.id, vid = %vid, "Reuse lost a race, volume will be unmounted");
                }
                AllocationOutcome::NoneAvailable => {}
            }
        } else {
            info!(drive = %drive.id, vid = %vid, "Drive lost or force-unmounted, volume will be unmounted");
        }
        match self
            .priorities
            .delete_priority(vid, mode, Lifespan::SingleMount)
            .await
        {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(drive),
            Err(e) => Err(e),
        }
    }

    async fn release_pair(&self, id: DriveId) -> Result<()> {
        let drive = self.registry.get(id).await?;
        if let Some(request) = drive.bound_request {
            self.reset_pair(id, request).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Pair Protocol
    // =========================================================================

    /// Drive daemon accepted the job
    pub async fn confirm(&self, drive: DriveId, request: RequestId) -> Result<PairReport> {
        let report = self.engine.confirm_submission(drive, request).await?;
        if report.applied {
            self.metrics.confirmations.inc();
            self.board.notify(request, report.clone());
        }
        Ok(report)
    }

    pub async fn reset_pair(&self, drive: DriveId, request: RequestId) -> Result<PairReport> {
        let report = self.engine.reset_pair(drive, request).await?;
        if report.applied {
            self.metrics.resets.inc();
            self.board.notify(request, report.clone());
            self.wake.notify_waiters();
        }
        Ok(report)
    }

    /// For an external submitter: claim the next allocated pair
    pub async fn next_to_submit(&self) -> Result<Option<(Drive, MountRequest)>> {
        self.engine.next_to_submit().await
    }

    pub async fn volume_in_use(&self, vid: &str) -> Result<bool> {
        self.engine.has_drive_with_volume_in_use(vid).await
    }

    pub async fn volume_mounted(&self, vid: &str) -> Result<bool> {
        self.engine.has_drive_with_volume_mounted(vid).await
    }

    // =========================================================================
    // Priorities
    // =========================================================================

    pub async fn set_priority(
        &self,
        vid: &str,
        mode: AccessMode,
        lifespan: Lifespan,
        priority: i32,
        client: ClientIdentity,
    ) -> Result<Option<VolumePriority>> {
        self.priorities
            .set_priority(vid, mode, lifespan, priority, client)
            .await
    }

    pub async fn delete_priority(
        &self,
        vid: &str,
        mode: AccessMode,
        lifespan: Lifespan,
    ) -> Result<VolumePriority> {
        self.priorities.delete_priority(vid, mode, lifespan).await
    }

    pub async fn priorities(&self, lifespan: Option<Lifespan>) -> Result<Vec<VolumePriority>> {
        match lifespan {
            Some(l) => self.priorities.list_by_lifespan(l).await,
            None => self.priorities.list().await,
        }
    }

    pub async fn effective_priorities(&self) -> Result<Vec<EffectivePriority>> {
        Ok(self.priorities.effective().await?.entries())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.liveness.sweep().await
    }

    /// Spawn the scheduler workers and the liveness monitor
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Scheduler already running");
            return;
        }

        let worker_config = WorkerConfig {
            submission_timeout: self.config.submission_timeout(),
            ..Default::default()
        };
        for id in 0..self.config.workers {
            let worker = SchedulerWorker::new(
                id,
                self.engine.clone(),
                self.daemon.clone(),
                self.board.clone(),
                self.metrics.clone(),
                self.wake.clone(),
                worker_config.clone(),
            );
            tasks.push(tokio::spawn(worker.run(self.cancel.child_token())));
        }
        tasks.push(tokio::spawn(
            self.liveness.clone().run(self.cancel.child_token()),
        ));
        info!("Scheduler started with {} workers", self.config.workers);
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty() && !self.cancel.is_cancelled()
    }

    /// Stop background tasks and wait for them
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Refresh gauges ahead of a scrape
    pub async fn refresh_metrics(&self) -> Result<()> {
        self.metrics.queue_length.set(self.queue.len().await? as i64);
        Ok(())
    }

    pub async fn status(&self) -> Result<VdqmStatus> {
        let drives = self.store.drives().await?;
        Ok(VdqmStatus {
            version: crate::VERSION.to_string(),
            running: self.is_running(),
            workers: self.config.workers,
            queued_requests: self.queue.len().await?,
            drives: drives.len(),
            free_drives: drives.iter().filter(|d| d.is_free()).count(),
            pending_confirmations: self.board.pending(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::types::{AccessSpecification, DeviceGroup, DriveCompatibility, RequestStatus};
    use crate::queue::tests::new_request;
    use crate::scheduler::worker::tests::RecordingDaemon;
    use std::time::Duration;

    pub(crate) fn test_config() -> VdqmConfig {
        VdqmConfig {
            workers: 1,
            server_addresses: [("tpsrv01".to_string(), vec!["127.0.0.1".parse().unwrap()])]
                .into_iter()
                .collect(),
            admin_hosts: vec!["vdqmadm01".into()],
            device_groups: vec![DeviceGroup {
                name: "G".into(),
                library: None,
            }],
            access_specifications: [AccessMode::Read, AccessMode::Write]
                .into_iter()
                .map(|mode| AccessSpecification {
                    tape_model: "T10000".into(),
                    density: "1000GC".into(),
                    mode,
                })
                .collect(),
            drive_compatibilities: vec![DriveCompatibility {
                drive_model: "T10000C".into(),
                device_groups: vec!["G".into()],
            }],
            drives: vec![NewDrive {
                name: "D1".into(),
                server: "tpsrv01".into(),
                device_group: "G".into(),
                model: "T10000C".into(),
                dedication: None,
            }],
            ..Default::default()
        }
    }

    pub(crate) async fn vdqm_with(daemon: Arc<RecordingDaemon>) -> Arc<Vdqm> {
        let store: VdqmStoreRef = Arc::new(MemoryStore::new());
        let vdqm = Vdqm::new(store, daemon, test_config()).unwrap();
        vdqm.seed().await.unwrap();
        vdqm
    }

    async fn first_drive(vdqm: &Vdqm) -> Drive {
        vdqm.drive_listing(None, None).await.unwrap()[0].drive.clone()
    }

    /// Allocate, submit and confirm the next pair by hand
    async fn run_to_assigned(vdqm: &Vdqm) -> (Drive, MountRequest) {
        assert!(vdqm.engine().allocate().await.unwrap().is_allocated());
        let (drive, request) = vdqm.next_to_submit().await.unwrap().unwrap();
        assert!(vdqm.confirm(drive.id, request.id).await.unwrap().applied);
        (drive, request)
    }

    #[tokio::test]
    async fn test_mount_cycle_through_reports() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let request = vdqm
            .submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;

        let mounted = vdqm
            .report(drive.id, DriveReport::Mount { vid: "V1".into() }, "tpsrv01")
            .await
            .unwrap();
        assert_eq!(mounted.status, DriveStatus::Mounted);
        assert!(vdqm.volume_mounted("V1").await.unwrap());

        let released = vdqm
            .report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();
        assert_eq!(released.status, DriveStatus::WaitUnmount);
        assert_eq!(released.bound_request, None);
        assert!(matches!(
            vdqm.request(request.id).await,
            Err(Error::NotFound { .. })
        ));

        let unmounted = vdqm
            .report(drive.id, DriveReport::Unmount, "tpsrv01")
            .await
            .unwrap();
        assert!(unmounted.is_free());
        assert_eq!(unmounted.mounted_vid, None);
    }

    #[tokio::test]
    async fn test_release_reuses_mounted_volume() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        vdqm.submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;
        vdqm.report(drive.id, DriveReport::Mount { vid: "V1".into() }, "tpsrv01")
            .await
            .unwrap();

        // A second job for the same volume arrives while it is loaded
        let mut again = new_request("V1", AccessMode::Read, 0);
        again.client.token = "second".into();
        let second = vdqm.submit_request(again).await.unwrap();

        let drive = vdqm
            .report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();
        assert_eq!(drive.bound_request, Some(second.id));
        assert_eq!(drive.status, DriveStatus::Starting);
        assert_eq!(
            vdqm.request(second.id).await.unwrap().status,
            RequestStatus::Allocated
        );
        assert_eq!(vdqm.metrics().reuses.get(), 1);
    }

    #[tokio::test]
    async fn test_release_without_reuse_drops_single_mount_priority() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        vdqm.set_priority(
            "V1",
            AccessMode::Read,
            Lifespan::Persistent,
            5,
            ClientIdentity::new("admin", "ops", 0, 0),
        )
        .await
        .unwrap();
        vdqm.submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        vdqm.set_priority(
            "V1",
            AccessMode::Read,
            Lifespan::SingleMount,
            9,
            ClientIdentity::new("admin", "ops", 0, 0),
        )
        .await
        .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;
        // Consumed by the allocation
        assert!(vdqm
            .priorities(Some(Lifespan::SingleMount))
            .await
            .unwrap()
            .is_empty());

        vdqm.set_priority(
            "V1",
            AccessMode::Read,
            Lifespan::SingleMount,
            3,
            ClientIdentity::new("admin", "ops", 0, 0),
        )
        .await
        .unwrap();
        vdqm.report(drive.id, DriveReport::Mount { vid: "V1".into() }, "tpsrv01")
            .await
            .unwrap();
        vdqm.report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();

        assert!(vdqm
            .priorities(Some(Lifespan::SingleMount))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(vdqm.priorities(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_up_report_on_busy_drive_requeues_request() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let request = vdqm
            .submit_request(new_request("V1", AccessMode::Write, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;

        let drive = vdqm.report(drive.id, DriveReport::Up, "tpsrv01").await.unwrap();
        assert!(drive.is_free());
        assert_eq!(
            vdqm.request(request.id).await.unwrap().status,
            RequestStatus::Pending
        );
        assert_eq!(vdqm.queue_position(request.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_down_report_requires_own_server() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let drive = first_drive(&vdqm).await;

        let err = vdqm
            .report(drive.id, DriveReport::Down, "intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(ref m) if m.contains("unauthorized")));

        let down = vdqm.report(drive.id, DriveReport::Down, "tpsrv01").await.unwrap();
        assert_eq!(down.status, DriveStatus::Down);
    }

    #[tokio::test]
    async fn test_down_report_from_admin_host() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let drive = first_drive(&vdqm).await;
        let down = vdqm
            .report(drive.id, DriveReport::Down, "vdqmadm01")
            .await
            .unwrap();
        assert_eq!(down.status, DriveStatus::Down);
    }

    #[tokio::test]
    async fn test_release_before_mount_frees_drive() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let first = vdqm
            .submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;

        let released = vdqm
            .report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();
        assert!(released.is_free());
        assert!(matches!(vdqm.request(first.id).await, Err(Error::NotFound { .. })));

        // Heartbeats and sweeps are not needed to use the drive again
        vdqm.submit_request(new_request("V2", AccessMode::Read, 0))
            .await
            .unwrap();
        assert!(vdqm.engine().allocate().await.unwrap().is_allocated());
    }

    #[tokio::test]
    async fn test_release_while_starting_frees_drive() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let request = vdqm
            .submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        assert!(vdqm.engine().allocate().await.unwrap().is_allocated());
        let (drive, _) = vdqm.next_to_submit().await.unwrap().unwrap();
        let _waiter = vdqm.board().register(request.id);
        assert_eq!(vdqm.board().pending(), 1);

        let released = vdqm
            .report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();
        assert!(released.is_free());
        assert_eq!(vdqm.board().pending(), 0);
    }

    #[tokio::test]
    async fn test_release_on_unknown_drive_forces_unmount() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        vdqm.submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;
        vdqm.report(drive.id, DriveReport::Mount { vid: "V1".into() }, "tpsrv01")
            .await
            .unwrap();
        vdqm.registry().mark_unknown(drive.id).await.unwrap();

        let mut again = new_request("V1", AccessMode::Read, 0);
        again.client.token = "second".into();
        let second = vdqm.submit_request(again).await.unwrap();
        vdqm.set_priority(
            "V1",
            AccessMode::Read,
            Lifespan::SingleMount,
            4,
            ClientIdentity::new("admin", "ops", 0, 0),
        )
        .await
        .unwrap();

        let released = vdqm
            .report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();
        assert_eq!(released.status, DriveStatus::WaitUnmount);
        assert_eq!(released.bound_request, None);
        assert_eq!(
            vdqm.request(second.id).await.unwrap().status,
            RequestStatus::Pending
        );
        assert!(vdqm
            .priorities(Some(Lifespan::SingleMount))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(vdqm.metrics().reuses.get(), 0);

        let unmounted = vdqm
            .report(drive.id, DriveReport::Unmount, "tpsrv01")
            .await
            .unwrap();
        assert!(unmounted.is_free());
        assert!(matches!(
            vdqm.engine().allocate().await.unwrap(),
            AllocationOutcome::Allocated(_, ref r) if r.id == second.id
        ));
    }

    #[tokio::test]
    async fn test_release_on_unknown_drive_without_volume() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        vdqm.submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;
        vdqm.registry().mark_unknown(drive.id).await.unwrap();

        let released = vdqm
            .report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();
        assert!(released.is_free());
    }

    #[tokio::test]
    async fn test_operator_cannot_set_bound_states() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let drive = first_drive(&vdqm).await;
        for target in [
            DriveStatus::Starting,
            DriveStatus::Assigned,
            DriveStatus::Mounted,
            DriveStatus::WaitUnmount,
        ] {
            let err = vdqm.set_drive_status(drive.id, target).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{} accepted", target);
        }
        let drive = vdqm.drive(drive.id).await.unwrap();
        assert!(drive.is_free());
    }

    #[tokio::test]
    async fn test_operator_up_releases_stranded_volume() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        vdqm.submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;
        vdqm.report(drive.id, DriveReport::Mount { vid: "V1".into() }, "tpsrv01")
            .await
            .unwrap();
        vdqm.report(drive.id, DriveReport::Release, "tpsrv01")
            .await
            .unwrap();
        vdqm.registry().mark_unknown(drive.id).await.unwrap();

        // The volume is still recorded on the drive, so V1 cannot go anywhere
        let mut again = new_request("V1", AccessMode::Read, 0);
        again.client.token = "second".into();
        let second = vdqm.submit_request(again).await.unwrap();
        assert_eq!(
            vdqm.engine().allocate().await.unwrap(),
            AllocationOutcome::NoneAvailable
        );

        let up = vdqm.set_drive_status(drive.id, DriveStatus::Up).await.unwrap();
        assert_eq!(up.mounted_vid, None);
        assert!(!vdqm.volume_mounted("V1").await.unwrap());
        assert!(matches!(
            vdqm.engine().allocate().await.unwrap(),
            AllocationOutcome::Allocated(_, ref r) if r.id == second.id
        ));
    }

    #[tokio::test]
    async fn test_admin_down_resets_pair() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let request = vdqm
            .submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;

        let drive = vdqm.set_drive_status(drive.id, DriveStatus::Down).await.unwrap();
        assert_eq!(drive.status, DriveStatus::Down);
        assert_eq!(drive.bound_request, None);
        assert_eq!(
            vdqm.request(request.id).await.unwrap().status,
            RequestStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_cancel_bound_request() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        let request = vdqm
            .submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let (drive, _) = run_to_assigned(&vdqm).await;

        vdqm.cancel_request(request.id).await.unwrap();
        assert!(vdqm.drive(drive.id).await.unwrap().is_free());
        assert_eq!(vdqm.queue_position(request.id).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_duplicate_counted() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        vdqm.submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let err = vdqm
            .submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRequest { .. }));
        assert_eq!(vdqm.metrics().admissions.get(), 1);
        assert_eq!(vdqm.metrics().duplicates.get(), 1);
    }

    #[tokio::test]
    async fn test_background_workers_submit_and_confirm() {
        let daemon = Arc::new(RecordingDaemon::default());
        let vdqm = vdqm_with(daemon.clone()).await;
        vdqm.start();
        assert!(vdqm.is_running());

        let request = vdqm
            .submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();

        let mut submitted = false;
        for _ in 0..100 {
            if !daemon.jobs.lock().is_empty() {
                submitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(submitted);

        let job = daemon.jobs.lock()[0].clone();
        assert_eq!(job.request, request.id);
        let report = vdqm.confirm(job.drive, job.request).await.unwrap();
        assert!(report.applied);
        assert_eq!(vdqm.drive(job.drive).await.unwrap().status, DriveStatus::Assigned);

        vdqm.shutdown().await;
        assert!(!vdqm.is_running());
    }

    #[tokio::test]
    async fn test_status_summary() {
        let vdqm = vdqm_with(Arc::new(RecordingDaemon::default())).await;
        vdqm.submit_request(new_request("V1", AccessMode::Read, 0))
            .await
            .unwrap();
        let status = vdqm.status().await.unwrap();
        assert_eq!(status.drives, 1);
        assert_eq!(status.free_drives, 1);
        assert_eq!(status.queued_requests, 1);
        assert!(!status.running);
    }
}
