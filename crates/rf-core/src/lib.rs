//! rf-core: Shared types for the ReelForge audio I/O crates
//!
//! Holds the sample representations that cross crate boundaries: the five
//! interleaved working formats a device session can run in, the packed 24-bit
//! integer sample, and the standard sample-rate ladder.

mod sample;

pub use sample::*;

/// Standard sample rate options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SampleRate {
    Hz44100 = 44100,
    Hz48000 = 48000,
    Hz88200 = 88200,
    Hz96000 = 96000,
    Hz176400 = 176400,
    Hz192000 = 192000,
    Hz352800 = 352800,
    Hz384000 = 384000,
}

impl SampleRate {
    /// Every standard rate, ascending.
    pub const ALL: [SampleRate; 8] = [
        Self::Hz44100,
        Self::Hz48000,
        Self::Hz88200,
        Self::Hz96000,
        Self::Hz176400,
        Self::Hz192000,
        Self::Hz352800,
        Self::Hz384000,
    ];

    #[inline]
    pub fn as_f64(self) -> f64 {
        self as u32 as f64
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(hz: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|rate| rate.as_u32() == hz)
    }

    /// The standard ladder as plain Hz values, for capability queries.
    pub fn standard_rates() -> Vec<u32> {
        Self::ALL.iter().map(|rate| rate.as_u32()).collect()
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz48000
    }
}
