//! Catalogue Accessors
//!
//! Idempotent get-or-create for volume and tape server identities, and
//! read-only lookups of device groups.

use crate::domain::ports::VdqmStoreRef;
use crate::domain::types::{DeviceGroup, TapeServer, Volume};
use crate::error::{Error, Result};
use tracing::debug;

/// Identity and reference-data accessors
#[derive(Clone)]
pub struct Catalogue {
    store: VdqmStoreRef,
}

impl Catalogue {
    pub fn new(store: VdqmStoreRef) -> Self {
        Self { store }
    }

    /// Fetch the volume, creating it on first reference
    pub async fn volume(&self, vid: &str) -> Result<Volume> {
        let volume = self.store.select_or_create_volume(vid).await?;
        debug!(vid = %volume.vid, "volume resolved");
        Ok(volume)
    }

    /// Fetch the tape server, creating it on first reference
    pub async fn tape_server(&self, name: &str) -> Result<TapeServer> {
        self.store.select_or_create_server(name).await
    }

    /// Look up a device group by name
    pub async fn device_group(&self, name: &str) -> Result<DeviceGroup> {
        self.store
            .device_groups()
            .await?
            .into_iter()
            .find(|g| g.name == name)
            .ok_or_else(|| Error::not_found("device group", name))
    }

    /// All device groups, ordered by name
    pub async fn device_groups(&self) -> Result<Vec<DeviceGroup>> {
        let mut groups = self.store.device_groups().await?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    /// Register a device group
    pub async fn add_device_group(&self, group: DeviceGroup) -> Result<()> {
        if group.name.is_empty() {
            return Err(Error::InvalidArgument("empty device group name".into()));
        }
        self.store.put_device_group(group).await
    }
}
