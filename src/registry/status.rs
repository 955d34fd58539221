//! Drive State Machine
//!
//! Canonical drive states, the legal edges between them, and the projection
//! onto the legacy bit-flag status still read by older observers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Drive Status
// =============================================================================

/// Canonical drive status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriveStatus {
    /// Idle, eligible for allocation
    Up,
    /// Bound to a request, daemon has not confirmed
    Starting,
    /// Daemon confirmed, preparing the mount
    Assigned,
    /// Volume loaded, transferring
    Mounted,
    /// Operator forced the volume out
    ForcedUnmount,
    /// Job released, volume still in the drive
    WaitUnmount,
    /// Administratively disabled
    Down,
    /// Lost contact with the drive daemon
    Unknown,
}

impl DriveStatus {
    /// All defined states, in wire-code order
    pub const ALL: [DriveStatus; 8] = [
        DriveStatus::Up,
        DriveStatus::Starting,
        DriveStatus::Assigned,
        DriveStatus::Mounted,
        DriveStatus::ForcedUnmount,
        DriveStatus::WaitUnmount,
        DriveStatus::Down,
        DriveStatus::Unknown,
    ];

    /// Decode a numeric status code
    pub fn from_code(code: i32) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown drive status code {}", code)))
    }

    pub fn code(&self) -> i32 {
        match self {
            DriveStatus::Up => 0,
            DriveStatus::Starting => 1,
            DriveStatus::Assigned => 2,
            DriveStatus::Mounted => 3,
            DriveStatus::ForcedUnmount => 4,
            DriveStatus::WaitUnmount => 5,
            DriveStatus::Down => 6,
            DriveStatus::Unknown => 7,
        }
    }

    /// States in which a drive may hold a job
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DriveStatus::Starting
                | DriveStatus::Assigned
                | DriveStatus::Mounted
                | DriveStatus::ForcedUnmount
                | DriveStatus::WaitUnmount
                | DriveStatus::Unknown
        )
    }

    /// Whether the state machine has an edge `self -> to`
    pub fn can_transition_to(&self, to: DriveStatus) -> bool {
        use DriveStatus::*;

        if *self == to {
            return true;
        }
        match (*self, to) {
            // Administrative down and heartbeat loss apply everywhere
            (_, Down) | (_, Unknown) => true,
            // Reset, unmount, liveness timeout and admin up
            (_, Up) => true,
            (Up, Starting) => true,
            // Reuse of a drive that still holds the volume
            (Mounted, Starting) | (WaitUnmount, Starting) => true,
            (Starting, Assigned) => true,
            (Assigned, Mounted) => true,
            (Mounted, WaitUnmount) => true,
            // Release with a volume still loaded
            (Starting, WaitUnmount)
            | (Assigned, WaitUnmount)
            | (ForcedUnmount, WaitUnmount)
            | (Unknown, WaitUnmount) => true,
            (Assigned, ForcedUnmount) | (Mounted, ForcedUnmount) => true,
            _ => false,
        }
    }

    /// Targets an operator may set directly. The bound states are only
    /// reached through allocation and the drive daemon's reports.
    pub fn is_admin_target(&self) -> bool {
        matches!(
            self,
            DriveStatus::Up | DriveStatus::Down | DriveStatus::ForcedUnmount
        )
    }

    /// Validate an edge, failing with [`Error::IllegalTransition`]
    pub fn transition(&self, to: DriveStatus) -> Result<DriveStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::IllegalTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Legacy bit-flag projection
    pub fn legacy_flags(&self) -> LegacyFlags {
        match self {
            DriveStatus::Up => LegacyFlags::UP | LegacyFlags::FREE,
            DriveStatus::Starting => LegacyFlags::UP | LegacyFlags::BUSY,
            DriveStatus::Assigned | DriveStatus::Mounted => {
                LegacyFlags::UP | LegacyFlags::BUSY | LegacyFlags::ASSIGN
            }
            DriveStatus::ForcedUnmount => {
                LegacyFlags::UP
                    | LegacyFlags::BUSY
                    | LegacyFlags::RELEASE
                    | LegacyFlags::UNKNOWN
                    | LegacyFlags::FORCE_UNMOUNT
            }
            DriveStatus::WaitUnmount => {
                LegacyFlags::UP | LegacyFlags::BUSY | LegacyFlags::RELEASE | LegacyFlags::UNKNOWN
            }
            DriveStatus::Down => LegacyFlags::DOWN,
            DriveStatus::Unknown => LegacyFlags::UNKNOWN,
        }
    }
}

impl std::fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveStatus::Up => write!(f, "UNIT_UP"),
            DriveStatus::Starting => write!(f, "UNIT_STARTING"),
            DriveStatus::Assigned => write!(f, "UNIT_ASSIGNED"),
            DriveStatus::Mounted => write!(f, "VOL_MOUNTED"),
            DriveStatus::ForcedUnmount => write!(f, "FORCED_UNMOUNT"),
            DriveStatus::WaitUnmount => write!(f, "WAIT_FOR_UNMOUNT"),
            DriveStatus::Down => write!(f, "UNIT_DOWN"),
            DriveStatus::Unknown => write!(f, "STATUS_UNKNOWN"),
        }
    }
}

/// Legacy flag set for a raw status code; fails on unmapped codes
pub fn legacy_flags_for_code(code: i32) -> Result<LegacyFlags> {
    DriveStatus::from_code(code).map(|s| s.legacy_flags())
}

// =============================================================================
// Legacy Flags
// =============================================================================

/// Bit-flag drive status understood by older observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegacyFlags(pub u32);

impl LegacyFlags {
    pub const UP: LegacyFlags = LegacyFlags(0x01);
    pub const DOWN: LegacyFlags = LegacyFlags(0x02);
    pub const ASSIGN: LegacyFlags = LegacyFlags(0x08);
    pub const RELEASE: LegacyFlags = LegacyFlags(0x10);
    pub const BUSY: LegacyFlags = LegacyFlags(0x20);
    pub const FREE: LegacyFlags = LegacyFlags(0x40);
    pub const UNKNOWN: LegacyFlags = LegacyFlags(0x80);
    pub const FORCE_UNMOUNT: LegacyFlags = LegacyFlags(0x2000);

    const NAMES: [(LegacyFlags, &'static str); 8] = [
        (LegacyFlags::UP, "UP"),
        (LegacyFlags::DOWN, "DOWN"),
        (LegacyFlags::ASSIGN, "ASSIGN"),
        (LegacyFlags::RELEASE, "RELEASE"),
        (LegacyFlags::BUSY, "BUSY"),
        (LegacyFlags::FREE, "FREE"),
        (LegacyFlags::UNKNOWN, "UNKNOWN"),
        (LegacyFlags::FORCE_UNMOUNT, "FORCE_UNMOUNT"),
    ];

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn contains(&self, other: LegacyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Names of the set flags, lowest bit first
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for LegacyFlags {
    type Output = LegacyFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        LegacyFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Display for LegacyFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.names().join("|"))
    }
}
