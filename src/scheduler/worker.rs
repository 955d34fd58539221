//! Scheduler Worker
//!
//! One scheduling loop: bind a pair, hand the oldest allocated pair to its
//! drive daemon and watch for the confirmation. Several workers run side by
//! side; they coordinate only through the store's conditional commits.

use super::board::ConfirmationBoard;
use crate::allocation::{AllocationEngine, AllocationOutcome};
use crate::domain::ports::{DriveDaemonRef, DriveJob};
use crate::domain::types::{DriveId, MountRequest, RequestId, RequestStatus};
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::SchedulerMetrics;
use crate::registry::Drive;
use backoff::ExponentialBackoffBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker tunables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a submitted pair may stay unconfirmed
    pub submission_timeout: Duration,
    /// Sleep between rounds when there is nothing to do
    pub idle_interval: Duration,
    /// Give up on a contended allocation after this long
    pub max_contention_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            submission_timeout: Duration::from_secs(120),
            idle_interval: Duration::from_secs(1),
            max_contention_wait: Duration::from_millis(500),
        }
    }
}

/// A scheduler worker
pub struct SchedulerWorker {
    id: usize,
    engine: Arc<AllocationEngine>,
    daemon: DriveDaemonRef,
    board: Arc<ConfirmationBoard>,
    metrics: SchedulerMetrics,
    wake: Arc<Notify>,
    config: WorkerConfig,
}

impl SchedulerWorker {
    pub fn new(
        id: usize,
        engine: Arc<AllocationEngine>,
        daemon: DriveDaemonRef,
        board: Arc<ConfirmationBoard>,
        metrics: SchedulerMetrics,
        wake: Arc<Notify>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            engine,
            daemon,
            board,
            metrics,
            wake,
            config,
        }
    }

    /// Loop until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!("Scheduler worker {} started", self.id);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let pause = match self.step(&cancel).await {
                Ok(true) => continue,
                Ok(false) => self.config.idle_interval,
                Err(e) => {
                    error!(worker = self.id, "Scheduling round failed: {}", e);
                    match e.action() {
                        ErrorAction::RetryImmediately => continue,
                        ErrorAction::RequeueAfter(delay) => delay,
                        ErrorAction::RequeueWithBackoff | ErrorAction::NoRequeue => {
                            self.config.idle_interval
                        }
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Scheduler worker {} stopped", self.id);
    }

    /// One round. Returns whether anything moved.
    pub async fn step(&self, cancel: &CancellationToken) -> Result<bool> {
        let mut progressed = false;

        match self.allocate().await? {
            AllocationOutcome::Allocated(drive, request) => {
                self.metrics.allocations.inc();
                debug!(worker = self.id, drive = %drive.id, request = %request.id, "allocated");
                progressed = true;
            }
            AllocationOutcome::Contended => {
                debug!(worker = self.id, "allocation still contended, yielding");
            }
            AllocationOutcome::NoneAvailable => {}
        }

        if let Some((drive, request)) = self.engine.next_to_submit().await? {
            self.submit(drive, request, cancel).await;
            progressed = true;
        }
        Ok(progressed)
    }

    /// `allocate`, retrying lost races with a bounded exponential backoff
    async fn allocate(&self) -> Result<AllocationOutcome> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(5))
            .with_max_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(self.config.max_contention_wait))
            .build();

        let attempt = move || async move {
            match self.engine.allocate().await {
                Ok(AllocationOutcome::Contended) => {
                    self.metrics.contended.inc();
                    Err(backoff::Error::transient(Error::contended("pair")))
                }
                Ok(outcome) => Ok(outcome),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        };

        match backoff::future::retry(policy, attempt).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_contended() => Ok(AllocationOutcome::Contended),
            Err(e) => Err(e),
        }
    }

    /// Hand the job over and watch for its confirmation in the background
    async fn submit(&self, drive: Drive, request: MountRequest, cancel: &CancellationToken) {
        let confirmation = self.board.register(request.id);
        self.metrics.submissions.inc();

        if let Err(e) = self.daemon.submit(&DriveJob::new(&drive, &request)).await {
            self.board.forget(request.id);
            self.metrics.submission_failures.inc();
            warn!(
                drive = %drive.id,
                request = %request.id,
                "Submission to {} failed: {}",
                drive.unit(),
                e
            );
            reset(&self.engine, &self.metrics, drive.id, request.id).await;
            return;
        }
        info!(
            drive = %drive.id,
            request = %request.id,
            vid = %request.vid,
            "Job for {} submitted to {}",
            request.vid,
            drive.unit()
        );

        let engine = self.engine.clone();
        let board = self.board.clone();
        let metrics = self.metrics.clone();
        let timeout = self.config.submission_timeout;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => board.forget(request.id),
                waited = tokio::time::timeout(timeout, confirmation) => match waited {
                    Ok(Ok(report)) => {
                        debug!(request = %request.id, applied = report.applied, "confirmation received");
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        board.forget(request.id);
                        warn!(
                            drive = %drive.id,
                            request = %request.id,
                            "No confirmation from {} within {:?}",
                            drive.unit(),
                            timeout
                        );
                        if still_submitted(&engine, drive.id, request.id).await {
                            reset(&engine, &metrics, drive.id, request.id).await;
                        }
                    }
                },
            }
        });
    }
}

async fn still_submitted(engine: &AllocationEngine, drive: DriveId, request: RequestId) -> bool {
    match engine.store.request(request).await {
        Ok(Some(r)) => r.status == RequestStatus::Submitted && r.bound_drive == Some(drive),
        Ok(None) => false,
        Err(e) => {
            error!(request = %request, "Could not read request: {}", e);
            false
        }
    }
}

async fn reset(
    engine: &AllocationEngine,
    metrics: &SchedulerMetrics,
    drive: DriveId,
    request: RequestId,
) {
    match engine.reset_pair(drive, request).await {
        Ok(report) if report.applied => metrics.resets.inc(),
        Ok(_) => {}
        Err(e) => error!(drive = %drive, request = %request, "Pair reset failed: {}", e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::allocation::engine::tests::{add_drive, assert_bijection, fixture, Fixture};
    use crate::domain::ports::DriveDaemon;
    use crate::domain::types::AccessMode;
    use crate::queue::tests::new_request;
    use crate::registry::DriveStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Drive daemon that records jobs and optionally refuses them
    #[derive(Default)]
    pub(crate) struct RecordingDaemon {
        pub(crate) jobs: Mutex<Vec<DriveJob>>,
        pub(crate) refuse: bool,
    }

    #[async_trait]
    impl DriveDaemon for RecordingDaemon {
        async fn submit(&self, job: &DriveJob) -> Result<()> {
            self.jobs.lock().push(job.clone());
            if self.refuse {
                return Err(Error::Internal("daemon refused".into()));
            }
            Ok(())
        }
    }

    fn worker(f: &Fixture, daemon: Arc<RecordingDaemon>, board: Arc<ConfirmationBoard>, timeout: Duration) -> SchedulerWorker {
        SchedulerWorker::new(
            0,
            f.engine.clone(),
            daemon,
            board,
            SchedulerMetrics::new().unwrap(),
            Arc::new(Notify::new()),
            WorkerConfig {
                submission_timeout: timeout,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_step_allocates_and_submits() {
        let f = fixture().await;
        let drive = add_drive(&f, "D1").await;
        let request = f.queue.submit(new_request("V1", AccessMode::Read, 0)).await.unwrap();
        let daemon = Arc::new(RecordingDaemon::default());
        let board = Arc::new(ConfirmationBoard::new());
        let w = worker(&f, daemon.clone(), board.clone(), Duration::from_secs(60));

        assert!(w.step(&CancellationToken::new()).await.unwrap());

        let jobs = daemon.jobs.lock().clone();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].drive, drive.id);
        assert_eq!(jobs[0].request, request.id);
        assert_eq!(board.pending(), 1);
        assert_eq!(f.queue.get(request.id).await.unwrap().status, RequestStatus::Submitted);

        // Nothing left to do
        assert!(!w.step(&CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_refused_submission_resets_pair() {
        let f = fixture().await;
        let drive = add_drive(&f, "D1").await;
        let request = f.queue.submit(new_request("V1", AccessMode::Read, 0)).await.unwrap();
        let daemon = Arc::new(RecordingDaemon {
            refuse: true,
            ..Default::default()
        });
        let board = Arc::new(ConfirmationBoard::new());
        let w = worker(&f, daemon, board.clone(), Duration::from_secs(60));

        w.step(&CancellationToken::new()).await.unwrap();

        assert_eq!(board.pending(), 0);
        assert!(f.registry.get(drive.id).await.unwrap().is_free());
        assert_eq!(f.queue.get(request.id).await.unwrap().status, RequestStatus::Pending);
        assert_bijection(&f.store).await;
    }

    #[tokio::test]
    async fn test_missing_confirmation_resets_pair() {
        let f = fixture().await;
        let drive = add_drive(&f, "D1").await;
        let request = f.queue.submit(new_request("V1", AccessMode::Read, 0)).await.unwrap();
        let daemon = Arc::new(RecordingDaemon::default());
        let board = Arc::new(ConfirmationBoard::new());
        let w = worker(&f, daemon, board.clone(), Duration::from_millis(20));

        w.step(&CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(board.pending(), 0);
        assert_eq!(f.registry.get(drive.id).await.unwrap().status, DriveStatus::Up);
        assert_eq!(f.queue.get(request.id).await.unwrap().status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_confirmation_keeps_pair() {
        let f = fixture().await;
        let drive = add_drive(&f, "D1").await;
        let request = f.queue.submit(new_request("V1", AccessMode::Read, 0)).await.unwrap();
        let daemon = Arc::new(RecordingDaemon::default());
        let board = Arc::new(ConfirmationBoard::new());
        let w = worker(&f, daemon, board.clone(), Duration::from_millis(100));

        w.step(&CancellationToken::new()).await.unwrap();
        let report = f.engine.confirm_submission(drive.id, request.id).await.unwrap();
        assert!(board.notify(request.id, report));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(f.registry.get(drive.id).await.unwrap().status, DriveStatus::Assigned);
        assert_eq!(f.queue.get(request.id).await.unwrap().status, RequestStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture().await;
        let w = worker(
            &f,
            Arc::new(RecordingDaemon::default()),
            Arc::new(ConfirmationBoard::new()),
            Duration::from_secs(1),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(w.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
