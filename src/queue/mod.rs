//! Request Queue
//!
//! Admission of mount requests (with de-duplication and access
//! specification checks), the canonical ordering views and queue-position
//! reporting.

pub mod admission;
pub mod ordering;

pub use admission::{find_duplicate, NewMountRequest};
pub use ordering::{canonical_order, QueueFilter, RankedRequest};

use crate::catalogue::{Catalogue, CompatibilityResolver};
use crate::domain::ports::{VdqmStoreRef, Versioned, WriteBatch};
use crate::domain::types::{MountRequest, RequestId, RequestStatus};
use crate::error::{Error, Result};
use crate::priority::PriorityStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Row of the operator queue listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    #[serde(flatten)]
    pub request: MountRequest,
    pub effective_priority: i32,
}

/// Mount request queue
pub struct RequestQueue {
    store: VdqmStoreRef,
    catalogue: Catalogue,
    resolver: Arc<CompatibilityResolver>,
    priorities: PriorityStore,
    /// Serializes the duplicate check with the insert that follows it
    admission: Mutex<()>,
}

impl RequestQueue {
    pub fn new(
        store: VdqmStoreRef,
        resolver: Arc<CompatibilityResolver>,
        priorities: PriorityStore,
    ) -> Self {
        Self {
            catalogue: Catalogue::new(store.clone()),
            store,
            resolver,
            priorities,
            admission: Mutex::new(()),
        }
    }

    /// Admit a new request. Fails with `NotFound` for an unknown device
    /// group, `InvalidArgument` for an invalid tape/mode combination and
    /// `DuplicateRequest` if the same client already queued it.
    pub async fn submit(&self, new: NewMountRequest) -> Result<MountRequest> {
        new.validate()?;
        self.catalogue.device_group(&new.device_group).await?;
        self.resolver
            .resolve(&new.tape_model, &new.density, new.access_mode)
            .await?;
        self.catalogue.volume(&new.vid).await?;
        if let Some(server) = &new.requested_server {
            self.catalogue.tape_server(server).await?;
        }

        let _guard = self.admission.lock().await;

        let live = self.store.requests().await?;
        if let Some(existing) = find_duplicate(&live, &new) {
            warn!(
                vid = %new.vid,
                existing = %existing,
                "Rejected duplicate mount request from {}@{}",
                new.client.user,
                new.client.host
            );
            return Err(Error::DuplicateRequest { vid: new.vid });
        }

        let now = Utc::now();
        let request = MountRequest {
            id: self.store.next_request_id().await?,
            vid: new.vid,
            access_mode: new.access_mode,
            density: new.density,
            tape_model: new.tape_model,
            device_group: new.device_group,
            requested_drive: new.requested_drive,
            requested_server: new.requested_server,
            client: new.client,
            priority: new.priority,
            created_at: now,
            modified_at: now,
            status: RequestStatus::Pending,
            bound_drive: None,
        };
        self.store
            .commit(WriteBatch::new().put_request(request.clone(), None))
            .await?;

        info!(
            request = %request.id,
            vid = %request.vid,
            "Queued {} request in {} for {}@{}",
            request.access_mode,
            request.device_group,
            request.client.user,
            request.client.host
        );
        Ok(request)
    }

    pub async fn get(&self, id: RequestId) -> Result<MountRequest> {
        self.store
            .request(id)
            .await?
            .map(Versioned::into_inner)
            .ok_or_else(|| Error::not_found("request", id))
    }

    /// Pending requests in canonical allocation order
    pub async fn pending(&self, filter: &QueueFilter) -> Result<Vec<RankedRequest>> {
        let effective = self.priorities.effective().await?;
        let pending = self
            .store
            .requests()
            .await?
            .into_iter()
            .filter(|r| r.is_pending());
        Ok(canonical_order(pending, &effective, filter))
    }

    /// Every live request in canonical order, with effective priorities
    pub async fn listing(&self, filter: &QueueFilter) -> Result<Vec<QueueEntry>> {
        let effective = self.priorities.effective().await?;
        Ok(
            canonical_order(self.store.requests().await?, &effective, filter)
                .into_iter()
                .map(|r| QueueEntry {
                    effective_priority: r.effective_priority,
                    request: r.request.into_inner(),
                })
                .collect(),
        )
    }

    /// 1-based rank by creation time among pending requests of the same
    /// device group, or -1 when the request is no longer queued
    pub async fn position(&self, id: RequestId) -> Result<i64> {
        let requests = self.store.requests().await?;
        let Some(target) = requests.iter().find(|r| r.id == id && r.is_pending()) else {
            debug!(request = %id, "queue position requested for unqueued request");
            return Ok(-1);
        };

        let ahead = requests
            .iter()
            .filter(|r| r.is_pending() && r.device_group == target.device_group)
            .filter(|r| (r.created_at, r.id) < (target.created_at, target.id))
            .count();
        Ok(ahead as i64 + 1)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self
            .store
            .requests()
            .await?
            .iter()
            .filter(|r| r.is_pending())
            .count())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
