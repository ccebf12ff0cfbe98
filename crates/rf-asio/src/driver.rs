//! Driver transport
//!
//! The synchronous control surface of one ASIO driver instance
//! ([`AsioDriver`]), the asynchronous notifications it delivers back
//! ([`DriverCallbacks`]), and the registry that lists and instantiates drivers.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::DriverError;
use crate::sample_type::AsioSampleType;

/// Which of the two hardware buffer halves is active, 0 or 1.
pub type BufferIndex = usize;

pub type DriverResult<T> = Result<T, DriverError>;

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// ASIO buffer sizes in frames.
///
/// `granularity`: -1 means power-of-two steps, 0 a fixed size, > 0 a linear
/// step from `min`. Anything else is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsioBufferSizes {
    pub min: i32,
    pub max: i32,
    pub preferred: i32,
    pub granularity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channels {
    pub input: i32,
    pub output: i32,
}

/// Driver-reported latencies in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Latencies {
    pub input: i32,
    pub output: i32,
}

/// ASIO channel info
#[derive(Debug, Clone, PartialEq)]
pub struct AsioChannelInfo {
    pub channel: i32,
    pub is_input: bool,
    pub is_active: bool,
    pub group: i32,
    pub sample_type: AsioSampleType,
    pub name: String,
}

/// One driver-owned buffer half.
///
/// Valid from `create_buffers` until `dispose_buffers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwBuffer {
    ptr: NonNull<u8>,
    len_bytes: usize,
}

// Safety: the memory belongs to the driver, which hands it to exactly one
// consumer (the realtime engine) for the lifetime of the buffers.
unsafe impl Send for HwBuffer {}
unsafe impl Sync for HwBuffer {}

impl HwBuffer {
    /// Wrap a driver buffer. Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len_bytes` writable bytes that stay valid until the
    /// driver disposes its buffers, and nothing but the engine may access them
    /// while a buffer switch is in progress.
    pub unsafe fn from_raw(ptr: *mut u8, len_bytes: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len_bytes })
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// The buffers must not have been disposed, and the caller must be the
    /// only one touching this half.
    #[inline]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len_bytes) }
    }
}

/// Per-channel buffer request, filled in by `create_buffers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub is_input: bool,
    pub channel: i32,
    pub buffers: [Option<HwBuffer>; 2],
}

impl BufferInfo {
    pub fn new(is_input: bool, channel: i32) -> Self {
        Self {
            is_input,
            channel,
            buffers: [None, None],
        }
    }
}

/// Time info flags.
pub mod time_flags {
    pub const SYSTEM_TIME_VALID: u32 = 1;
    pub const SAMPLE_POSITION_VALID: u32 = 1 << 1;
    pub const SAMPLE_RATE_VALID: u32 = 1 << 2;
    pub const SPEED_VALID: u32 = 1 << 3;
}

/// Optional per-period timing supplied with a buffer switch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriverTime {
    pub flags: u32,
    pub speed: f64,
    pub system_time_ns: u64,
    pub sample_position: i64,
    pub sample_rate: f64,
}

impl DriverTime {
    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// ASIO message selectors.
pub mod selector {
    pub const SELECTOR_SUPPORTED: i32 = 1;
    pub const ENGINE_VERSION: i32 = 2;
    pub const RESET_REQUEST: i32 = 3;
    pub const BUFFER_SIZE_CHANGE: i32 = 4;
    pub const RESYNC_REQUEST: i32 = 5;
    pub const LATENCIES_CHANGED: i32 = 6;
    pub const SUPPORTS_TIME_INFO: i32 = 7;
    pub const SUPPORTS_TIME_CODE: i32 = 8;
    pub const MMC_COMMAND: i32 = 9;
    pub const OVERLOAD: i32 = 15;
}

/// A message sent by the driver on its message channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverMessage {
    pub selector: i32,
    pub value: i32,
    pub opt: Option<f64>,
}

impl DriverMessage {
    pub fn new(selector: i32, value: i32) -> Self {
        Self {
            selector,
            value,
            opt: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Notifications a driver delivers, possibly from its own realtime thread.
pub trait DriverCallbacks: Send + Sync {
    /// One buffer period elapsed; half `index` is ready to be processed.
    fn buffer_switch(&self, index: BufferIndex, time: Option<&DriverTime>);

    fn sample_rate_did_change(&self, sample_rate: f64);

    fn message(&self, message: DriverMessage) -> i32;

    /// The driver cannot tolerate blocking on its callback thread.
    fn request_deferred_processing(&self, deferred: bool);
}

/// Synchronous control surface of one driver instance.
pub trait AsioDriver: Send + Sync {
    fn driver_name(&self) -> DriverResult<String>;
    fn driver_version(&self) -> DriverResult<i32>;
    fn error_message(&self) -> DriverResult<String>;

    fn channels(&self) -> DriverResult<Channels>;
    fn latencies(&self) -> DriverResult<Latencies>;
    fn buffer_sizes(&self) -> DriverResult<AsioBufferSizes>;

    fn can_sample_rate(&self, sample_rate: f64) -> DriverResult<bool>;
    fn sample_rate(&self) -> DriverResult<f64>;
    fn set_sample_rate(&self, sample_rate: f64) -> DriverResult<()>;

    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<AsioChannelInfo>;

    /// Allocate both halves for every entry of `infos`. Callbacks may arrive
    /// on any thread from here until `dispose_buffers` returns.
    fn create_buffers(
        &self,
        infos: &mut [BufferInfo],
        frames: i32,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> DriverResult<()>;
    fn dispose_buffers(&self) -> DriverResult<()>;

    fn start(&self) -> DriverResult<()>;
    fn stop(&self) -> DriverResult<()>;

    fn can_output_ready(&self) -> DriverResult<bool>;
    fn output_ready(&self) -> DriverResult<()>;

    fn control_panel(&self) -> DriverResult<()>;
}

/// Registry entry of an installed driver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DriverInfo {
    pub id: String,
    pub key: String,
    pub name: String,
    pub description: String,
    pub display_name: String,
}

/// Lists installed drivers and instantiates them by id.
pub trait DriverRegistry: Send + Sync {
    fn drivers(&self) -> Vec<DriverInfo>;
    fn instantiate(&self, id: &str) -> DriverResult<Box<dyn AsioDriver>>;
}
