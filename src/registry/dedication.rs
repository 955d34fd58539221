//! Drive Dedications
//!
//! A dedication restricts which requests a drive may serve. Operators write
//! them in the legacy `key=value,key=value` syntax, e.g.
//! `host=.*,vid=I10547,mode=write,timestr=22:00-06:00`.

use crate::domain::types::{AccessMode, MountRequest};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Wildcard accepted for every key
const WILDCARD: &str = ".*";

/// Keys the legacy syntax defines but this scheduler cannot honour
const UNSUPPORTED_KEYS: [&str; 5] = ["uid", "gid", "name", "datestr", "age"];

// =============================================================================
// Time Window
// =============================================================================

/// Daily window `[start, end)`; wraps midnight when `end <= start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    fn parse(value: &str) -> Result<Self> {
        let (start, end) = value.split_once('-').ok_or_else(|| {
            Error::InvalidArgument(format!("timestr must be HH:MM-HH:MM, got '{}'", value))
        })?;
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| {
                Error::InvalidArgument(format!("bad time '{}' in timestr: {}", s, e))
            })
        };
        Ok(Self {
            start: parse(start)?,
            end: parse(end)?,
        })
    }

    pub fn contains(&self, at: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= at && at < self.end
        } else {
            at >= self.start || at < self.end
        }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// =============================================================================
// Dedication
// =============================================================================

/// Parsed drive dedication. `None` fields are unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dedication {
    pub host: Option<String>,
    pub vid: Option<String>,
    pub mode: Option<AccessMode>,
    pub window: Option<TimeWindow>,
}

impl Dedication {
    /// Parse the legacy dedication syntax
    pub fn parse(input: &str) -> Result<Self> {
        let mut dedication = Dedication::default();

        for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                Error::InvalidArgument(format!("dedication '{}' is not key=value", item))
            })?;
            let value = value.trim();

            if UNSUPPORTED_KEYS.contains(&key) {
                if !value.is_empty() && value != WILDCARD {
                    return Err(Error::InvalidArgument(format!(
                        "{} dedications are not supported '{}'",
                        key, value
                    )));
                }
                continue;
            }
            if value.is_empty() || value == WILDCARD {
                continue;
            }

            match key {
                "host" => dedication.host = Some(Self::identifier(key, value, &['.', '-'])?),
                "vid" => dedication.vid = Some(Self::identifier(key, value, &[])?),
                "mode" => {
                    dedication.mode = Some(value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("invalid mode dedication '{}'", value))
                    })?)
                }
                "timestr" => dedication.window = Some(TimeWindow::parse(value)?),
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown dedication key '{}'",
                        other
                    )))
                }
            }
        }

        Ok(dedication)
    }

    /// Literal value: alphanumerics, `_` and the separators in `extra`
    fn identifier(key: &str, value: &str, extra: &[char]) -> Result<String> {
        if value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || extra.contains(&c))
        {
            Ok(value.to_string())
        } else {
            Err(Error::InvalidArgument(format!(
                "invalid {} dedication '{}': only .* or alphanumeric values are supported",
                key, value
            )))
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        *self == Dedication::default()
    }

    /// Whether a drive carrying this dedication may serve `request` at `now`
    pub fn admits(&self, request: &MountRequest, now: DateTime<Utc>) -> bool {
        if let Some(vid) = &self.vid {
            if *vid != request.vid {
                return false;
            }
        }
        if let Some(mode) = self.mode {
            if mode != request.access_mode {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if *host != request.client.host {
                return false;
            }
        }
        match self.window {
            Some(window) => window.contains(now.time()),
            None => true,
        }
    }
}

impl std::fmt::Display for Dedication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Some(AccessMode::Read) => "0".to_string(),
            Some(AccessMode::Write) => "1".to_string(),
            None => WILDCARD.to_string(),
        };
        write!(
            f,
            "host={},vid={},mode={},timestr={}",
            self.host.as_deref().unwrap_or(WILDCARD),
            self.vid.as_deref().unwrap_or(WILDCARD),
            mode,
            self.window
                .map(|w| w.to_string())
                .unwrap_or_else(|| WILDCARD.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ClientIdentity, RequestId, RequestStatus};
    use chrono::TimeZone;

    fn request(vid: &str, mode: AccessMode, host: &str) -> MountRequest {
        let now = Utc::now();
        MountRequest {
            id: RequestId(1),
            vid: vid.to_string(),
            access_mode: mode,
            density: "1000GC".into(),
            tape_model: "T10000".into(),
            device_group: "T10K".into(),
            requested_drive: None,
            requested_server: None,
            client: ClientIdentity::new(host, "stage", 100, 100),
            priority: 0,
            created_at: now,
            modified_at: now,
            status: RequestStatus::Pending,
            bound_drive: None,
        }
    }

    #[test]
    fn test_parse_full_dedication() {
        let d = Dedication::parse("uid=.*,gid=.*,name=.*,host=lxc2disk07,vid=I10547,mode=1,datestr=.*,timestr=22:00-06:00,age=.*").unwrap();
        assert_eq!(d.host.as_deref(), Some("lxc2disk07"));
        assert_eq!(d.vid.as_deref(), Some("I10547"));
        assert_eq!(d.mode, Some(AccessMode::Write));
        assert!(d.window.is_some());
    }

    #[test]
    fn test_wildcards_and_empty() {
        assert!(Dedication::parse("").unwrap().is_unrestricted());
        assert!(Dedication::parse("host=.*,vid=.*,mode=.*").unwrap().is_unrestricted());
        assert!(Dedication::parse("uid=,gid=").unwrap().is_unrestricted());
    }

    #[test]
    fn test_rejects_unsupported_keys() {
        for bad in ["uid=100", "gid=12", "name=stage", "datestr=01/01/10", "age=5"] {
            assert!(
                matches!(Dedication::parse(bad), Err(Error::InvalidArgument(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_qualified_host_dedication() {
        let d = Dedication::parse("host=tpsrv01.cern.ch,mode=0").unwrap();
        assert_eq!(d.host.as_deref(), Some("tpsrv01.cern.ch"));
        let now = Utc::now();
        assert!(d.admits(&request("V1", AccessMode::Read, "tpsrv01.cern.ch"), now));
        assert!(!d.admits(&request("V1", AccessMode::Read, "tpsrv01"), now));

        let d = Dedication::parse("host=lxc-disk07").unwrap();
        assert_eq!(d.host.as_deref(), Some("lxc-disk07"));
        assert_eq!(Dedication::parse(&d.to_string()).unwrap(), d);
    }

    #[test]
    fn test_rejects_regex_values() {
        assert!(Dedication::parse("vid=I1.*").is_err());
        assert!(Dedication::parse("host=lxc[0-9]").is_err());
        assert!(Dedication::parse("host=lxc.*").is_err());
        assert!(Dedication::parse("vid=I1-0547").is_err());
        assert!(Dedication::parse("mode=append").is_err());
        assert!(Dedication::parse("colour=red").is_err());
        assert!(Dedication::parse("vid").is_err());
    }

    #[test]
    fn test_admits() {
        let d = Dedication::parse("vid=I10547,mode=read").unwrap();
        let now = Utc::now();
        assert!(d.admits(&request("I10547", AccessMode::Read, "h1"), now));
        assert!(!d.admits(&request("I10547", AccessMode::Write, "h1"), now));
        assert!(!d.admits(&request("I99999", AccessMode::Read, "h1"), now));

        let by_host = Dedication::parse("host=diskserver1").unwrap();
        assert!(by_host.admits(&request("V1", AccessMode::Write, "diskserver1"), now));
        assert!(!by_host.admits(&request("V1", AccessMode::Write, "diskserver2"), now));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let d = Dedication::parse("timestr=22:00-06:00").unwrap();
        let r = request("V1", AccessMode::Read, "h1");
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 5, 59, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(d.admits(&r, late));
        assert!(d.admits(&r, early));
        assert!(!d.admits(&r, noon));
    }

    #[test]
    fn test_display() {
        let d = Dedication::parse("vid=I10547,mode=write").unwrap();
        assert_eq!(d.to_string(), "host=.*,vid=I10547,mode=1,timestr=.*");
    }
}
