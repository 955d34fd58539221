//! Confirmation Board
//!
//! Rendezvous between a worker waiting on a submitted job and the
//! drive daemon's confirmation arriving through the API.

use crate::domain::types::RequestId;
use crate::registry::PairReport;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// Pending confirmations keyed by request
#[derive(Debug, Default)]
pub struct ConfirmationBoard {
    waiters: DashMap<RequestId, oneshot::Sender<PairReport>>,
}

impl ConfirmationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `request`. A second registration replaces the first,
    /// whose receiver then observes a closed channel.
    pub fn register(&self, request: RequestId) -> oneshot::Receiver<PairReport> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request, tx);
        rx
    }

    /// Deliver the outcome for `request`; false if nobody was waiting
    pub fn notify(&self, request: RequestId, report: PairReport) -> bool {
        match self.waiters.remove(&request) {
            Some((_, tx)) => tx.send(report).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `request`
    pub fn forget(&self, request: RequestId) {
        self.waiters.remove(&request);
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}
