//! Interfaces the engine presents to the application
//!
//! [`AudioSource`] produces and consumes interleaved audio under its own
//! locking discipline; [`DeviceEvents`] receives requests the engine cannot act
//! on itself from the realtime thread (close, reset, restart) plus
//! user-facing device messages.

use std::sync::OnceLock;
use std::time::Instant;

use rf_core::{Int24, SampleFormat};

use crate::timing::TimeInfo;

/// Read-only interleaved block in the session's working format.
#[derive(Debug, Clone, Copy)]
pub enum Interleaved<'a> {
    Int16(&'a [i16]),
    Int24(&'a [Int24]),
    Int32(&'a [i32]),
    Float32(&'a [f32]),
    Float64(&'a [f64]),
}

/// Writable interleaved block in the session's working format.
#[derive(Debug)]
pub enum InterleavedMut<'a> {
    Int16(&'a mut [i16]),
    Int24(&'a mut [Int24]),
    Int32(&'a mut [i32]),
    Float32(&'a mut [f32]),
    Float64(&'a mut [f64]),
}

impl Interleaved<'_> {
    pub fn format(&self) -> SampleFormat {
        match self {
            Self::Int16(_) => SampleFormat::Int16,
            Self::Int24(_) => SampleFormat::Int24,
            Self::Int32(_) => SampleFormat::Int32,
            Self::Float32(_) => SampleFormat::Float32,
            Self::Float64(_) => SampleFormat::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int16(b) => b.len(),
            Self::Int24(b) => b.len(),
            Self::Int32(b) => b.len(),
            Self::Float32(b) => b.len(),
            Self::Float64(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InterleavedMut<'_> {
    pub fn format(&self) -> SampleFormat {
        match self {
            Self::Int16(_) => SampleFormat::Int16,
            Self::Int24(_) => SampleFormat::Int24,
            Self::Int32(_) => SampleFormat::Int32,
            Self::Float32(_) => SampleFormat::Float32,
            Self::Float64(_) => SampleFormat::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int16(b) => b.len(),
            Self::Int24(b) => b.len(),
            Self::Int32(b) => b.len(),
            Self::Float32(b) => b.len(),
            Self::Float64(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds on a process-wide monotonic clock.
pub fn monotonic_now_ns() -> u64 {
    process_epoch().elapsed().as_nanos() as u64
}

/// Upstream audio source.
///
/// All methods may be called from a driver-owned thread and must return in
/// bounded time.
pub trait AudioSource: Send + Sync {
    /// A read of `frames` frames is about to happen.
    fn read_prepare(&self, frames: usize, latency_frames: usize);

    /// Fill `output` with `frames` frames and consume captured `input`, in one
    /// exchange. `input` is `None` when the session has no input channels.
    fn read(&self, output: InterleavedMut<'_>, input: Option<Interleaved<'_>>, frames: usize);

    /// The read started by `read_prepare` is complete.
    fn read_done(&self);

    /// Per-period synchronisation record, only with hardware timing enabled.
    fn set_time_info(&self, _info: &TimeInfo) {}

    /// Reference clock used when the driver supplies no usable timestamp.
    fn reference_clock_now_ns(&self) -> u64 {
        monotonic_now_ns()
    }

    /// Whether the calling thread currently holds the source lock. Starting or
    /// stopping the device in that state would deadlock the realtime thread.
    fn is_locked_by_current_thread(&self) -> bool {
        false
    }
}

/// Severity of a device message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Error,
    Warning,
    Info,
}

/// Requests raised by the engine outside the control thread's call stack.
///
/// Handlers may run on the realtime thread. They must only record the request;
/// acting on it (closing, reopening) belongs on the control thread.
pub trait DeviceEvents: Send + Sync {
    /// The device can no longer run with the current settings.
    fn request_close(&self) {}

    /// The driver asked to be reset (close and reopen).
    fn request_reset(&self) {}

    /// The driver asked for a restart (stop and start).
    fn request_restart(&self) {}

    fn device_message(&self, _level: MessageLevel, _message: &str) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl DeviceEvents for NoEvents {}
