/*!
 * Core Types
 * Common types used across the runtime core
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Address type for memory operations
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;

/// Coordinator-side object handle
pub type ObjHandle = u32;

/// Guest-visible thread / process identifier
pub type ClientId = u32;

/// 100ns intervals since 1601-01-01, the guest clock unit
pub type Ticks = i64;

/// Ticks per second in the guest clock
pub const TICKS_PER_SEC: i64 = 10_000_000;

/// Seconds between 1601-01-01 and 1970-01-01
pub const SECS_1601_TO_1970: i64 = (369 * 365 + 89) * 86_400;

/// Convert a Unix `time_t` value to guest ticks
#[inline]
pub fn ticks_from_time_t(time: i64) -> Ticks {
    (time + SECS_1601_TO_1970) * TICKS_PER_SEC
}

/// Current host time in guest ticks
pub fn current_ticks() -> Ticks {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ticks_from_time_t(since_epoch.as_secs() as i64) + (since_epoch.subsec_nanos() / 100) as i64
}

/// Convert a duration to guest ticks, saturating
#[inline]
pub fn duration_to_ticks(duration: Duration) -> Ticks {
    i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
}

/// Index of a thread slot in the TEB arena and the thread table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Guest machine type, using the image-file machine codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Machine {
    I386 = 0x014c,
    ArmNt = 0x01c4,
    Amd64 = 0x8664,
    Arm64 = 0xaa64,
}

impl Machine {
    /// Machine the runtime itself was built for
    pub const fn host() -> Self {
        #[cfg(target_arch = "x86")]
        {
            Machine::I386
        }
        #[cfg(target_arch = "arm")]
        {
            Machine::ArmNt
        }
        #[cfg(target_arch = "aarch64")]
        {
            Machine::Arm64
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "arm", target_arch = "aarch64")))]
        {
            Machine::Amd64
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x014c => Some(Machine::I386),
            0x01c4 => Some(Machine::ArmNt),
            0x8664 => Some(Machine::Amd64),
            0xaa64 => Some(Machine::Arm64),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn code(self) -> u16 {
        self as u16
    }

    #[inline]
    pub fn is_64bit(self) -> bool {
        matches!(self, Machine::Amd64 | Machine::Arm64)
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Machine::I386 => "i386",
            Machine::ArmNt => "armnt",
            Machine::Amd64 => "amd64",
            Machine::Arm64 => "arm64",
        };
        f.write_str(name)
    }
}
