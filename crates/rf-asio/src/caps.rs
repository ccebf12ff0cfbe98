//! Capability reporting and driver enumeration

use std::collections::BTreeMap;
use std::sync::Arc;

use rf_core::SampleFormat;
use serde::{Deserialize, Serialize};

use crate::device::AsioDevice;
use crate::driver::{AsioDriver, DriverRegistry};
use crate::handle::DriverHandle;

pub const API_NAME: &str = "ASIO";

// ═══════════════════════════════════════════════════════════════════════════════
// ENUMERATION
// ═══════════════════════════════════════════════════════════════════════════════

/// One enumerated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub api_name: String,
    pub is_default: bool,
    pub full_duplex: bool,
    pub hardware_mixing: bool,
    /// Raw registry fields.
    pub extra_data: BTreeMap<String, String>,
}

/// List every installed driver as a device.
pub fn enumerate_devices(registry: &dyn DriverRegistry) -> Vec<DeviceInfo> {
    registry
        .drivers()
        .into_iter()
        .map(|driver| {
            log::debug!("ASIO: Found driver:");
            log::debug!("ASIO:  Key         = '{}'", driver.key);
            log::debug!("ASIO:  Id          = '{}'", driver.id);
            log::debug!("ASIO:  Name        = '{}'", driver.name);
            log::debug!("ASIO:  Description = '{}'", driver.description);
            log::debug!("ASIO:  DisplayName = '{}'", driver.display_name);
            let extra_data = BTreeMap::from([
                ("Key".to_owned(), driver.key),
                ("Id".to_owned(), driver.id.clone()),
                ("Name".to_owned(), driver.name),
                ("Description".to_owned(), driver.description),
                ("DisplayName".to_owned(), driver.display_name.clone()),
            ]);
            DeviceInfo {
                id: driver.id,
                name: driver.display_name,
                api_name: API_NAME.to_owned(),
                is_default: false,
                full_duplex: true,
                hardware_mixing: true,
                extra_data,
            }
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPABILITIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Capabilities known without talking to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub available: bool,
    pub can_update_interval: bool,
    pub can_sample_format: bool,
    pub can_exclusive_mode: bool,
    pub can_boost_thread_priority: bool,
    pub can_keep_device_running: bool,
    pub can_use_hardware_timing: bool,
    pub can_channel_mapping: bool,
    pub can_input: bool,
    pub has_named_input_sources: bool,
    pub can_driver_panel: bool,
    pub latency_min: f64,
    pub latency_max: f64,
    pub default_sample_format: SampleFormat,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            available: true,
            can_update_interval: false,
            can_sample_format: false,
            can_exclusive_mode: false,
            can_boost_thread_priority: false,
            can_keep_device_running: true,
            can_use_hardware_timing: true,
            can_channel_mapping: true,
            can_input: true,
            has_named_input_sources: true,
            can_driver_panel: true,
            latency_min: 0.000_001,
            latency_max: 0.5,
            default_sample_format: SampleFormat::Float32,
        }
    }
}

/// Capabilities queried from the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicCaps {
    pub current_sample_rate: u32,
    pub supported_sample_rates: Vec<u32>,
    pub supported_exclusive_sample_rates: Vec<u32>,
    /// Output channel names.
    pub channel_names: Vec<String>,
    /// Input channels as `(index, name)`.
    pub input_source_names: Vec<(u32, String)>,
}

/// Keeps the driver open for the duration of a query, restoring the previous
/// state on drop.
struct TemporaryOpen<'a> {
    handle: &'a mut DriverHandle,
    was_open: bool,
}

impl<'a> TemporaryOpen<'a> {
    fn new(handle: &'a mut DriverHandle) -> Self {
        let was_open = handle.is_driver_open();
        if !was_open {
            if let Err(err) = handle.open_driver() {
                log::debug!("ASIO: temporary open failed: {}", err);
            }
        }
        Self { handle, was_open }
    }

    fn driver(&self) -> Option<Arc<dyn AsioDriver>> {
        self.handle.driver().cloned()
    }
}

impl Drop for TemporaryOpen<'_> {
    fn drop(&mut self) {
        if !self.was_open {
            self.handle.close_driver();
        }
    }
}

impl AsioDevice {
    pub fn device_caps(&self) -> DeviceCaps {
        DeviceCaps::default()
    }

    /// Query rates and channel names, opening the driver if needed. Every
    /// failure degrades to an empty or partial result.
    pub fn dynamic_caps(&mut self, base_sample_rates: &[u32]) -> DynamicCaps {
        let mut caps = DynamicCaps::default();
        let realtime = Arc::clone(self.realtime());
        let faults = realtime.faults();

        let opener = TemporaryOpen::new(&mut self.handle);
        let Some(driver) = opener.driver() else {
            drop(opener);
            self.device_unavailable_on_open = true;
            return caps;
        };

        if let Ok(rate) = faults.call("getSampleRate", || driver.sample_rate()) {
            if rate > 0.0 {
                caps.current_sample_rate = rate.round().clamp(0.0, u32::MAX as f64) as u32;
            }
        }

        for &rate in base_sample_rates {
            if let Ok(true) = faults.call("canSampleRate", || driver.can_sample_rate(rate as f64)) {
                caps.supported_sample_rates.push(rate);
                caps.supported_exclusive_sample_rates.push(rate);
            }
        }

        let mut unavailable = false;
        if let Ok(channels) = faults.call("getChannels", || driver.channels()) {
            unavailable = channels.input <= 0 && channels.output <= 0;
            for channel in 0..channels.output.max(0) {
                let name = faults
                    .call("getChannelInfo", || driver.channel_info(channel, false))
                    .map_or_else(|_| channel.to_string(), |info| info.name);
                caps.channel_names.push(name);
            }
            for channel in 0..channels.input.max(0) {
                let name = faults
                    .call("getChannelInfo", || driver.channel_info(channel, true))
                    .map_or_else(|_| channel.to_string(), |info| info.name);
                caps.input_source_names.push((channel as u32, name));
            }
        }

        drop(driver);
        drop(opener);
        if unavailable {
            self.device_unavailable_on_open = true;
        }
        caps
    }

    /// Show the driver's control panel, opening the driver if needed.
    pub fn open_driver_settings(&mut self) -> bool {
        let realtime = Arc::clone(self.realtime());
        let opener = TemporaryOpen::new(&mut self.handle);
        let Some(driver) = opener.driver() else {
            return false;
        };
        realtime
            .faults()
            .call("controlPanel", || driver.control_panel())
            .is_ok()
    }
}
