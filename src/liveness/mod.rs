//! Liveness / Recovery
//!
//! Periodic sweep that recovers allocations whose external confirmation
//! never arrived, moves silent drives to UNKNOWN and reclaims stale
//! single-mount priority overrides.

use crate::allocation::AllocationEngine;
use crate::domain::ports::VdqmStoreRef;
use crate::domain::types::RequestStatus;
use crate::error::Result;
use crate::metrics::SchedulerMetrics;
use crate::priority::PriorityStore;
use crate::registry::{DriveRegistry, DriveStatus};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Liveness thresholds
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Allocated/Submitted requests untouched for longer are reset
    pub submission_timeout: Duration,
    /// Drives silent for longer move to UNKNOWN
    pub heartbeat_timeout: Duration,
    /// Single-mount overrides older than this are expired
    pub priority_max_age: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            submission_timeout: Duration::from_secs(120),
            heartbeat_timeout: Duration::from_secs(600),
            priority_max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub pairs_reset: u64,
    pub drives_unknown: u64,
    pub priorities_expired: u64,
    pub failures: u64,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Liveness monitor
pub struct LivenessMonitor {
    store: VdqmStoreRef,
    engine: Arc<AllocationEngine>,
    registry: Arc<DriveRegistry>,
    priorities: PriorityStore,
    config: LivenessConfig,
    metrics: Option<SchedulerMetrics>,
}

impl LivenessMonitor {
    pub fn new(
        store: VdqmStoreRef,
        engine: Arc<AllocationEngine>,
        registry: Arc<DriveRegistry>,
        priorities: PriorityStore,
        config: LivenessConfig,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            priorities,
            config,
            metrics: None,
        }
    }

    /// Count sweep resets in the scheduler metrics
    pub fn with_metrics(mut self, metrics: SchedulerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One recovery pass
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();
        let submission_timeout = to_chrono(self.config.submission_timeout);
        let heartbeat_timeout = to_chrono(self.config.heartbeat_timeout);

        // Lost submissions
        for request in self.store.requests().await? {
            let stale = matches!(
                request.status,
                RequestStatus::Allocated | RequestStatus::Submitted
            ) && now - request.modified_at > submission_timeout;
            let Some(drive) = request.bound_drive.filter(|_| stale) else {
                continue;
            };

            warn!(
                drive = %drive,
                request = %request.id,
                vid = %request.vid,
                "No confirmation after {:?}, resetting pair",
                self.config.submission_timeout
            );
            match self.engine.reset_pair(drive, request.id).await {
                Ok(r) if r.applied => report.pairs_reset += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(request = %request.id, "Liveness reset failed: {}", e);
                    report.failures += 1;
                }
            }
        }

        // Silent drives
        for drive in self.store.drives().await? {
            if matches!(drive.status, DriveStatus::Down | DriveStatus::Unknown)
                || now - drive.last_heartbeat <= heartbeat_timeout
            {
                continue;
            }

            warn!(drive = %drive.id, "No heartbeat from {} since {}", drive.unit(), drive.last_heartbeat);
            if let Some(request) = drive.bound_request {
                match self.engine.reset_pair(drive.id, request).await {
                    Ok(r) if r.applied => report.pairs_reset += 1,
                    Ok(_) => {}
                    Err(e) => {
                        error!(drive = %drive.id, "Liveness reset failed: {}", e);
                        report.failures += 1;
                        continue;
                    }
                }
            }
            match self.registry.mark_unknown(drive.id).await {
                Ok(_) => report.drives_unknown += 1,
                Err(e) => {
                    error!(drive = %drive.id, "Could not mark drive unknown: {}", e);
                    report.failures += 1;
                }
            }
        }

        // Stale single-mount overrides
        report.priorities_expired = self
            .priorities
            .expire_older_than(self.config.priority_max_age)
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.liveness_timeouts.inc_by(report.pairs_reset);
        }

        if report.is_quiet() {
            debug!("liveness sweep: nothing to recover");
        } else {
            info!(
                "Liveness sweep: {} pairs reset, {} drives unknown, {} priorities expired, {} failures",
                report.pairs_reset, report.drives_unknown, report.priorities_expired, report.failures
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Liveness monitor started (interval {:?})", self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Liveness sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Liveness monitor stopped");
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::engine::tests::{add_drive, assert_bijection, fixture};
    use crate::domain::types::{AccessMode, ClientIdentity, Lifespan};
    use crate::queue::tests::new_request;

    fn monitor(f: &crate::allocation::engine::tests::Fixture, config: LivenessConfig) -> LivenessMonitor {
        LivenessMonitor::new(
            f.store.clone(),
            f.engine.clone(),
            f.registry.clone(),
            f.priorities.clone(),
            config,
        )
    }

    #[tokio::test]
    async fn test_stale_submission_reset() {
        let f = fixture().await;
        let drive = add_drive(&f, "D1").await;
        let request = f.queue.submit(new_request("V1", AccessMode::Read, 0)).await.unwrap();
        f.engine.allocate().await.unwrap();
        f.engine.next_to_submit().await.unwrap();

        let patient = monitor(&f, LivenessConfig::default());
        assert_eq!(patient.sweep().await.unwrap().pairs_reset, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let eager = monitor(
            &f,
            LivenessConfig {
                submission_timeout: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let report = eager.sweep().await.unwrap();
        assert_eq!(report.pairs_reset, 1);
        assert!(f.registry.get(drive.id).await.unwrap().is_free());
        assert_eq!(f.queue.get(request.id).await.unwrap().status, RequestStatus::Pending);
        assert_bijection(&f.store).await;
    }

    #[tokio::test]
    async fn test_silent_drive_goes_unknown() {
        let f = fixture().await;
        let drive = add_drive(&f, "D1").await;
        f.queue.submit(new_request("V1", AccessMode::Read, 0)).await.unwrap();
        f.engine.allocate().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let m = monitor(
            &f,
            LivenessConfig {
                heartbeat_timeout: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let report = m.sweep().await.unwrap();
        assert_eq!(report.drives_unknown, 1);
        assert_eq!(report.pairs_reset, 1);

        let drive = f.registry.get(drive.id).await.unwrap();
        assert_eq!(drive.status, DriveStatus::Unknown);
        assert_eq!(drive.bound_request, None);
        assert_bijection(&f.store).await;

        // Already unknown: left alone
        assert_eq!(m.sweep().await.unwrap().drives_unknown, 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_single_mount_priorities() {
        let f = fixture().await;
        f.priorities
            .set_priority(
                "V1",
                AccessMode::Read,
                Lifespan::SingleMount,
                3,
                ClientIdentity::new("admin", "ops", 0, 0),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let m = monitor(
            &f,
            LivenessConfig {
                priority_max_age: Duration::from_millis(1),
                ..Default::default()
            },
        );
        assert_eq!(m.sweep().await.unwrap().priorities_expired, 1);
        assert!(f.priorities.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture().await;
        let m = Arc::new(monitor(
            &f,
            LivenessConfig {
                interval: Duration::from_millis(5),
                ..Default::default()
            },
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(m.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
