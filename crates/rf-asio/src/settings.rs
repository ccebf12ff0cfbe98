//! Device settings and engine options

use std::time::Duration;

use rf_core::{SampleFormat, SampleRate};
use serde::{Deserialize, Serialize};

/// Maps host channels to device channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    device_channels: Vec<u32>,
}

impl ChannelMapping {
    /// Host channel `i` goes to device channel `base + i`.
    pub fn base_channel(channels: u32, base: u32) -> Self {
        Self {
            device_channels: (0..channels).map(|i| base + i).collect(),
        }
    }

    pub fn identity(channels: u32) -> Self {
        Self::base_channel(channels, 0)
    }

    pub fn from_device_channels(device_channels: Vec<u32>) -> Self {
        Self { device_channels }
    }

    #[inline]
    pub fn num_host_channels(&self) -> usize {
        self.device_channels.len()
    }

    #[inline]
    pub fn to_device(&self, host_channel: usize) -> Option<u32> {
        self.device_channels.get(host_channel).copied()
    }

    /// Device channels in host channel order.
    pub fn device_channels(&self) -> impl Iterator<Item = u32> + '_ {
        self.device_channels.iter().copied()
    }

    /// Device channel count needed to satisfy the mapping.
    pub fn required_device_channels(&self) -> u32 {
        self.device_channels.iter().max().map_or(0, |max| max + 1)
    }
}

impl Default for ChannelMapping {
    fn default() -> Self {
        Self::identity(2)
    }
}

/// Per-session settings. Immutable while the device is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub sample_rate: u32,
    /// Output channels and where they land on the device.
    pub outputs: ChannelMapping,
    pub input_channels: u32,
    /// First device channel used for input.
    pub input_source_id: u32,
    /// Requested latency in seconds.
    pub latency: f64,
    pub use_hardware_timing: bool,
    pub keep_device_running: bool,
    /// Requested format. Replaced by the negotiated one on open.
    pub sample_format: SampleFormat,
}

impl DeviceSettings {
    pub fn output_channels(&self) -> usize {
        self.outputs.num_host_channels()
    }

    pub fn input_mapping(&self) -> ChannelMapping {
        ChannelMapping::base_channel(self.input_channels, self.input_source_id)
    }

    pub fn total_channels(&self) -> usize {
        self.output_channels() + self.input_channels as usize
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::default().as_u32(),
            outputs: ChannelMapping::default(),
            input_channels: 0,
            input_source_id: 0,
            latency: 0.05,
            use_hardware_timing: false,
            keep_device_running: false,
            sample_format: SampleFormat::default(),
        }
    }
}

/// Application-wide engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Create the deferred dispatcher when opening a driver.
    pub allow_deferred_processing: bool,
    /// Contain driver panics instead of letting them unwind.
    pub mask_driver_crashes: bool,
    /// How long a silence transition waits for the realtime thread.
    pub silence_ack_timeout: Duration,
    pub silence_poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            allow_deferred_processing: true,
            mask_driver_crashes: true,
            silence_ack_timeout: Duration::from_micros(250),
            silence_poll_interval: Duration::from_millis(1),
        }
    }
}
