//! Request Admission
//!
//! Shape of a new mount request and the de-duplication check applied before
//! it is queued.

use crate::domain::ports::Versioned;
use crate::domain::types::{AccessMode, ClientIdentity, MountRequest, RequestId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A mount request as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMountRequest {
    pub vid: String,
    pub access_mode: AccessMode,
    pub density: String,
    pub tape_model: String,
    pub device_group: String,
    #[serde(default)]
    pub requested_drive: Option<String>,
    #[serde(default)]
    pub requested_server: Option<String>,
    pub client: ClientIdentity,
    #[serde(default)]
    pub priority: i32,
}

impl NewMountRequest {
    /// Reject structurally invalid submissions before touching the store
    pub fn validate(&self) -> Result<()> {
        if self.vid.trim().is_empty() {
            return Err(Error::InvalidArgument("empty volume id".into()));
        }
        if self.device_group.trim().is_empty() {
            return Err(Error::InvalidArgument("empty device group".into()));
        }
        if self.client.host.trim().is_empty() {
            return Err(Error::InvalidArgument("empty client host".into()));
        }
        if matches!(&self.requested_drive, Some(d) if self.requested_server.is_none() && !d.is_empty())
        {
            return Err(Error::InvalidArgument(
                "a requested drive needs a requested server".into(),
            ));
        }
        Ok(())
    }
}

/// Return the live request that `candidate` would duplicate, if any.
///
/// Existing requests are first narrowed to those from an identical client
/// identity (host, user, port, uid, gid, token), then matched on access
/// specification, volume and requested server.
pub fn find_duplicate(
    live: &[Versioned<MountRequest>],
    candidate: &NewMountRequest,
) -> Option<RequestId> {
    live.iter()
        .filter(|r| r.client == candidate.client)
        .find(|r| {
            r.vid == candidate.vid
                && r.access_mode == candidate.access_mode
                && r.tape_model == candidate.tape_model
                && r.density == candidate.density
                && r.requested_server == candidate.requested_server
        })
        .map(|r| r.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RequestStatus;
    use chrono::Utc;

    fn candidate() -> NewMountRequest {
        NewMountRequest {
            vid: "I10547".into(),
            access_mode: AccessMode::Read,
            density: "1000GC".into(),
            tape_model: "T10000".into(),
            device_group: "T10K".into(),
            requested_drive: None,
            requested_server: None,
            client: ClientIdentity {
                host: "diskserver1".into(),
                user: "stage".into(),
                port: 5015,
                uid: 101,
                gid: 102,
                token: "a1".into(),
            },
            priority: 0,
        }
    }

    fn existing(from: &NewMountRequest, id: u64) -> Versioned<MountRequest> {
        let now = Utc::now();
        Versioned::new(
            1,
            MountRequest {
                id: RequestId(id),
                vid: from.vid.clone(),
                access_mode: from.access_mode,
                density: from.density.clone(),
                tape_model: from.tape_model.clone(),
                device_group: from.device_group.clone(),
                requested_drive: from.requested_drive.clone(),
                requested_server: from.requested_server.clone(),
                client: from.client.clone(),
                priority: from.priority,
                created_at: now,
                modified_at: now,
                status: RequestStatus::Pending,
                bound_drive: None,
            },
        )
    }

    #[test]
    fn test_identical_tuple_is_duplicate() {
        let c = candidate();
        let live = vec![existing(&c, 4)];
        assert_eq!(find_duplicate(&live, &c), Some(RequestId(4)));
    }

    #[test]
    fn test_any_identity_difference_is_not_duplicate() {
        let c = candidate();
        let live = vec![existing(&c, 4)];

        let mut other_token = c.clone();
        other_token.client.token = "a2".into();
        assert_eq!(find_duplicate(&live, &other_token), None);

        let mut other_port = c.clone();
        other_port.client.port = 5016;
        assert_eq!(find_duplicate(&live, &other_port), None);

        let mut other_mode = c.clone();
        other_mode.access_mode = AccessMode::Write;
        assert_eq!(find_duplicate(&live, &other_mode), None);

        let mut other_server = c.clone();
        other_server.requested_server = Some("tpsrv01".into());
        assert_eq!(find_duplicate(&live, &other_server), None);
    }

    #[test]
    fn test_validate() {
        assert!(candidate().validate().is_ok());
        let mut bad = candidate();
        bad.vid = " ".into();
        assert!(bad.validate().is_err());
        let mut drive_only = candidate();
        drive_only.requested_drive = Some("T10D1".into());
        assert!(drive_only.validate().is_err());
    }
}
