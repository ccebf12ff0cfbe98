//! Atomic bit-flag registers shared with the realtime thread

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Driver behaviors observed during the device lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsioFeatures(pub u32);

impl AsioFeatures {
    pub const NONE: Self = Self(0);
    pub const RESET_REQUEST: Self = Self(1 << 0);
    pub const RESYNC_REQUEST: Self = Self(1 << 1);
    pub const BUFFER_SIZE_CHANGE: Self = Self(1 << 2);
    pub const OVERLOAD: Self = Self(1 << 3);
    pub const SAMPLE_RATE_CHANGE: Self = Self(1 << 4);
    pub const DEFERRED_PROCESS: Self = Self(1 << 5);

    /// Features this engine cannot honor.
    pub const UNSUPPORTED: Self =
        Self(Self::OVERLOAD.0 | Self::BUFFER_SIZE_CHANGE.0 | Self::SAMPLE_RATE_CHANGE.0);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::RESET_REQUEST, "reset"),
        (Self::RESYNC_REQUEST, "resync"),
        (Self::BUFFER_SIZE_CHANGE, "buffer"),
        (Self::OVERLOAD, "load"),
        (Self::SAMPLE_RATE_CHANGE, "srate"),
        (Self::DEFERRED_PROCESS, "deferred"),
    ];

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for AsioFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for AsioFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Maintenance actions requested from a notification and run on the control
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsioRequests(pub u32);

impl AsioRequests {
    pub const NONE: Self = Self(0);
    pub const LATENCIES_CHANGED: Self = Self(1 << 0);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Lock-free flag register. Only or-in, peek, take and clear are offered.
#[derive(Debug, Default)]
pub struct FlagRegister(AtomicU32);

impl FlagRegister {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn peek(&self) -> u32 {
        self.0.fetch_or(0, Ordering::AcqRel)
    }

    #[inline]
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}
