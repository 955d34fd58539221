//! Queue Ordering
//!
//! Canonical allocation order: device group, then access mode descending
//! (write first), then effective priority descending, then creation time
//! ascending. Request id breaks any remaining tie.

use crate::domain::ports::Versioned;
use crate::domain::types::MountRequest;
use crate::priority::EffectivePriorities;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};

/// Optional device-group / server restriction on a queue view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFilter {
    pub device_group: Option<String>,
    pub server: Option<String>,
}

impl QueueFilter {
    pub fn new(device_group: Option<String>, server: Option<String>) -> Self {
        Self {
            device_group,
            server,
        }
    }

    pub fn device_group(name: impl Into<String>) -> Self {
        Self {
            device_group: Some(name.into()),
            server: None,
        }
    }

    /// A request passes the server filter if it names that server or none
    pub fn matches(&self, request: &MountRequest) -> bool {
        if let Some(dgn) = &self.device_group {
            if request.device_group != *dgn {
                return false;
            }
        }
        match (&self.server, &request.requested_server) {
            (Some(filter), Some(requested)) => filter == requested,
            _ => true,
        }
    }
}

/// A request with the priority it is ordered by
#[derive(Debug, Clone)]
pub struct RankedRequest {
    pub request: Versioned<MountRequest>,
    pub effective_priority: i32,
}

impl PartialEq for RankedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedRequest {}

impl PartialOrd for RankedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (&self.request, &other.request);
        a.device_group
            .cmp(&b.device_group)
            .then_with(|| Reverse(a.access_mode).cmp(&Reverse(b.access_mode)))
            .then_with(|| Reverse(self.effective_priority).cmp(&Reverse(other.effective_priority)))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Rank `requests` in canonical order after applying `filter`
pub fn canonical_order(
    requests: impl IntoIterator<Item = Versioned<MountRequest>>,
    priorities: &EffectivePriorities,
    filter: &QueueFilter,
) -> Vec<RankedRequest> {
    let mut ranked: Vec<RankedRequest> = requests
        .into_iter()
        .filter(|r| filter.matches(r))
        .map(|request| RankedRequest {
            effective_priority: priorities.resolve(&request),
            request,
        })
        .collect();
    ranked.sort();
    ranked
}
