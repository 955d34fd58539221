//! Daemon Configuration
//!
//! YAML configuration file: tunables plus the static reference data
//! (device groups, tape/density/mode combinations, drive models and the
//! initial drive inventory). Every field has a default, so an empty file
//! is a valid configuration.

use crate::domain::types::{AccessSpecification, DeviceGroup, DriveCompatibility};
use crate::error::{Error, Result};
use crate::liveness::LivenessConfig;
use crate::registry::NewDrive;
use crate::scheduler::DaemonConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdqmConfig {
    /// REST API bind address
    pub api_addr: String,
    /// Scheduler worker tasks
    pub workers: usize,
    /// How long a worker waits for a daemon confirmation
    pub submission_timeout_secs: u64,
    pub liveness_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub priority_max_age_secs: u64,
    /// Attempts for contended pair updates
    pub max_reset_attempts: usize,
    pub daemon: DaemonConfig,
    /// Known addresses of tape servers. Reports from other peers are
    /// attributed by forward DNS lookup of the drives' servers.
    pub server_addresses: BTreeMap<String, Vec<IpAddr>>,
    /// Hosts allowed to send reports on behalf of any tape server
    pub admin_hosts: Vec<String>,

    pub device_groups: Vec<DeviceGroup>,
    pub access_specifications: Vec<AccessSpecification>,
    pub drive_compatibilities: Vec<DriveCompatibility>,
    pub drives: Vec<NewDrive>,
}

impl Default for VdqmConfig {
    fn default() -> Self {
        Self {
            api_addr: "0.0.0.0:8090".to_string(),
            workers: 2,
            submission_timeout_secs: 120,
            liveness_interval_secs: 30,
            heartbeat_timeout_secs: 600,
            priority_max_age_secs: 24 * 3600,
            max_reset_attempts: 16,
            daemon: DaemonConfig::default(),
            server_addresses: BTreeMap::new(),
            admin_hosts: Vec::new(),
            device_groups: Vec::new(),
            access_specifications: Vec::new(),
            drive_compatibilities: Vec::new(),
            drives: Vec::new(),
        }
    }
}

impl VdqmConfig {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // serde_yaml rejects a completely empty document
        let config: VdqmConfig = if text.trim().is_empty() {
            VdqmConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".into()));
        }
        if self.max_reset_attempts == 0 {
            return Err(Error::Configuration(
                "max_reset_attempts must be at least 1".into(),
            ));
        }
        if self.liveness_interval_secs == 0 {
            return Err(Error::Configuration(
                "liveness_interval_secs must be positive".into(),
            ));
        }
        for drive in &self.drives {
            if !self.device_groups.iter().any(|g| g.name == drive.device_group) {
                return Err(Error::Configuration(format!(
                    "drive {}@{} references undeclared device group {}",
                    drive.name, drive.server, drive.device_group
                )));
            }
        }
        Ok(())
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            interval: Duration::from_secs(self.liveness_interval_secs),
            submission_timeout: self.submission_timeout(),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            priority_max_age: Duration::from_secs(self.priority_max_age_secs),
        }
    }
}
