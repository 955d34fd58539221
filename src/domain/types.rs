//! Domain Types
//!
//! Identity, reference and request records shared by every scheduler
//! subsystem. Drive records live in [`crate::registry`] next to their state
//! machine.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a tape drive record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveId(pub u64);

impl std::fmt::Display for DriveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DriveId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Unique identifier for a mount request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

// =============================================================================
// Access Mode / Lifespan
// =============================================================================

/// Tape access mode. `Write` orders above `Read`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    /// Decode the legacy numeric mode (0 = read, 1 = write)
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(AccessMode::Read),
            1 => Ok(AccessMode::Write),
            other => Err(Error::InvalidArgument(format!(
                "unknown access mode code {}",
                other
            ))),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            AccessMode::Read => 0,
            AccessMode::Write => 1,
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
        }
    }
}

impl std::str::FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "0" => Ok(AccessMode::Read),
            "write" | "1" => Ok(AccessMode::Write),
            other => Err(Error::InvalidArgument(format!("unknown access mode '{}'", other))),
        }
    }
}

/// Lifespan of a volume priority override
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Lifespan {
    /// Consumed by the next successful allocation, or reclaimed by age
    SingleMount,
    /// Never auto-reclaimed
    Persistent,
}

impl Lifespan {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Lifespan::SingleMount),
            1 => Ok(Lifespan::Persistent),
            other => Err(Error::InvalidArgument(format!(
                "unknown lifespan type {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Lifespan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifespan::SingleMount => write!(f, "singleMount"),
            Lifespan::Persistent => write!(f, "persistent"),
        }
    }
}

impl std::str::FromStr for Lifespan {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "singleMount" | "single-mount" | "0" => Ok(Lifespan::SingleMount),
            "persistent" | "1" => Ok(Lifespan::Persistent),
            other => Err(Error::InvalidArgument(format!("unknown lifespan '{}'", other))),
        }
    }
}

// =============================================================================
// Client Identity
// =============================================================================

/// Identity of the client process that submitted a request or override
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub uid: u32,
    pub gid: u32,
    /// Opaque de-duplication token chosen by the client
    #[serde(default)]
    pub token: String,
}

impl ClientIdentity {
    pub fn new(host: impl Into<String>, user: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 0,
            uid,
            gid,
            token: String::new(),
        }
    }
}

// =============================================================================
// Reference Data
// =============================================================================

/// Lazily created tape identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub vid: String,
    pub created_at: DateTime<Utc>,
}

/// Lazily created tape server identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapeServer {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A named class of drives sharing hardware capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceGroup {
    pub name: String,
    #[serde(default)]
    pub library: Option<String>,
}

/// Device groups a physical drive model may serve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveCompatibility {
    pub drive_model: String,
    pub device_groups: Vec<String>,
}

/// A valid (tape model, density, access mode) combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessSpecification {
    pub tape_model: String,
    pub density: String,
    pub mode: AccessMode,
}

// =============================================================================
// Mount Requests
// =============================================================================

/// Lifecycle of a mount request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Queued, waiting for a drive
    Pending,
    /// Bound to a drive, not yet handed to the drive daemon
    Allocated,
    /// Handed to the drive daemon, awaiting confirmation
    Submitted,
    /// Accepted by the drive daemon
    Confirmed,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Allocated => write!(f, "allocated"),
            RequestStatus::Submitted => write!(f, "submitted"),
            RequestStatus::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// A client's demand to mount a tape volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountRequest {
    pub id: RequestId,
    pub vid: String,
    pub access_mode: AccessMode,
    pub density: String,
    pub tape_model: String,
    pub device_group: String,
    /// Explicit drive unit name, if the client asked for one
    pub requested_drive: Option<String>,
    /// Explicit tape server, if the client asked for one
    pub requested_server: Option<String>,
    pub client: ClientIdentity,
    /// Base priority before overrides
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub status: RequestStatus,
    pub bound_drive: Option<DriveId>,
}

impl MountRequest {
    /// The (tape model, density, mode) combination this request needs
    pub fn access_specification(&self) -> AccessSpecification {
        AccessSpecification {
            tape_model: self.tape_model.clone(),
            density: self.density.clone(),
            mode: self.access_mode,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}

// =============================================================================
// Volume Priority Overrides
// =============================================================================

/// Key of a volume priority override
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityKey {
    pub vid: String,
    pub mode: AccessMode,
    pub lifespan: Lifespan,
}

impl PriorityKey {
    pub fn new(vid: impl Into<String>, mode: AccessMode, lifespan: Lifespan) -> Self {
        Self {
            vid: vid.into(),
            mode,
            lifespan,
        }
    }
}

impl std::fmt::Display for PriorityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vid, self.mode, self.lifespan)
    }
}

/// Administrative priority override for a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePriority {
    pub vid: String,
    pub mode: AccessMode,
    pub lifespan: Lifespan,
    pub priority: i32,
    pub client: ClientIdentity,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl VolumePriority {
    pub fn key(&self) -> PriorityKey {
        PriorityKey::new(self.vid.clone(), self.mode, self.lifespan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_ranks_above_read() {
        assert!(AccessMode::Write > AccessMode::Read);
        let mut modes = vec![AccessMode::Read, AccessMode::Write, AccessMode::Read];
        modes.sort_by(|a, b| b.cmp(a));
        assert_eq!(modes[0], AccessMode::Write);
    }

    #[test]
    fn test_access_mode_codes() {
        assert_eq!(AccessMode::from_code(0).unwrap(), AccessMode::Read);
        assert_eq!(AccessMode::from_code(1).unwrap(), AccessMode::Write);
        assert!(AccessMode::from_code(2).is_err());
        assert_eq!("WRITE".parse::<AccessMode>().unwrap(), AccessMode::Write);
    }

    #[test]
    fn test_lifespan_parse() {
        assert_eq!("singleMount".parse::<Lifespan>().unwrap(), Lifespan::SingleMount);
        assert_eq!(Lifespan::from_code(1).unwrap(), Lifespan::Persistent);
        assert!("forever".parse::<Lifespan>().is_err());
    }

    #[test]
    fn test_priority_key_ordering() {
        let mut keys = vec![
            PriorityKey::new("V2", AccessMode::Read, Lifespan::Persistent),
            PriorityKey::new("V1", AccessMode::Write, Lifespan::SingleMount),
            PriorityKey::new("V1", AccessMode::Read, Lifespan::Persistent),
        ];
        keys.sort();
        assert_eq!(keys[0].vid, "V1");
        assert_eq!(keys[0].mode, AccessMode::Read);
        assert_eq!(keys[2].vid, "V2");
    }
}
