//! Scheduler Metrics
//!
//! Prometheus counters for the scheduling loop, kept in a dedicated
//! registry so several daemons (or tests) can live in one process.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Prometheus metrics for the scheduler
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    pub allocations: IntCounter,
    pub contended: IntCounter,
    pub reuses: IntCounter,
    pub submissions: IntCounter,
    pub submission_failures: IntCounter,
    pub confirmations: IntCounter,
    pub resets: IntCounter,
    pub liveness_timeouts: IntCounter,
    pub admissions: IntCounter,
    pub duplicates: IntCounter,
    pub queue_length: IntGauge,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("vdqm".into()), None).map_err(metrics_error)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help).map_err(metrics_error)?;
            registry.register(Box::new(c.clone())).map_err(metrics_error)?;
            Ok(c)
        };

        let allocations = counter("allocations_total", "Pairs bound by allocate")?;
        let contended = counter("contended_total", "Allocation attempts lost to a concurrent writer")?;
        let reuses = counter("reuses_total", "Pairs bound by reusing a mounted volume")?;
        let submissions = counter("submissions_total", "Jobs handed to drive daemons")?;
        let submission_failures =
            counter("submission_failures_total", "Jobs the drive daemon refused or never got")?;
        let confirmations = counter("confirmations_total", "Submissions confirmed by drive daemons")?;
        let resets = counter("resets_total", "Pairs reset after a failed or lost submission")?;
        let liveness_timeouts =
            counter("liveness_timeouts_total", "Pairs reset by the liveness sweep")?;
        let admissions = counter("admissions_total", "Mount requests admitted to the queue")?;
        let duplicates = counter("duplicates_total", "Mount requests rejected as duplicates")?;

        let queue_length =
            IntGauge::new("queue_length", "Mount requests waiting for a drive").map_err(metrics_error)?;
        registry
            .register(Box::new(queue_length.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            allocations,
            contended,
            reuses,
            submissions,
            submission_failures,
            confirmations,
            resets,
            liveness_timeouts,
            admissions,
            duplicates,
            queue_length,
        })
    }

    /// Render in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics")
            .field("allocations", &self.allocations.get())
            .field("queue_length", &self.queue_length.get())
            .finish()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
