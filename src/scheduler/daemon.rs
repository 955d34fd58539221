//! Drive Daemon Client
//!
//! HTTP client for the drive-side daemon on each tape server.

use crate::domain::ports::{DriveDaemon, DriveJob};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Where and how to reach drive daemons
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Port the daemon listens on, on every tape server
    pub port: u16,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// `http` or `https`
    pub scheme: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 5070,
            request_timeout_secs: 10,
            scheme: "http".to_string(),
        }
    }
}

/// Drive daemon reached over HTTP at `{scheme}://{server}:{port}/v1/jobs`
pub struct HttpDriveDaemon {
    config: DaemonConfig,
    client: reqwest::Client,
}

impl HttpDriveDaemon {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        if config.scheme != "http" && config.scheme != "https" {
            return Err(Error::Configuration(format!(
                "unsupported daemon scheme: {}",
                config.scheme
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn job_url(&self, server: &str) -> String {
        format!("{}://{}:{}/v1/jobs", self.config.scheme, server, self.config.port)
    }
}

#[async_trait]
impl DriveDaemon for HttpDriveDaemon {
    async fn submit(&self, job: &DriveJob) -> Result<()> {
        let url = self.job_url(&job.server);
        debug!(drive = %job.drive, request = %job.request, url = %url, "submitting job");

        let response = self.client.post(&url).json(job).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Drive daemon on {} refused job {}: {} {}", job.server, job.request, status, body);
            return Err(Error::Internal(format!(
                "drive daemon on {} returned {}",
                job.server, status
            )));
        }
        Ok(())
    }
}
