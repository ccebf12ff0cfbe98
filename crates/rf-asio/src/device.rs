//! ASIO device: control-thread lifecycle of one driver session
//!
//! ```text
//!   Closed ──open()──► Open ──start()──► Started
//!     ▲                 ▲  ◄──stop()────    │
//!     │                 │                   │ stop() with keep_device_running
//!     └────close()──────┘                   ▼
//!                       ◄─end_playing_silence()── RenderingSilence
//! ```
//!
//! All methods run on the control thread. The realtime side lives in
//! [`Realtime`], shared with the driver as its callback target.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rf_core::SampleFormat;

use crate::buffers::{ChannelBinding, WorkingBuffers};
use crate::convert::clear_hw_buffer;
use crate::driver::{BufferInfo, DriverCallbacks, DriverRegistry, HwBuffer};
use crate::error::{AsioError, AsioErrorKind, AsioResult};
use crate::flags::{AsioFeatures, AsioRequests};
use crate::handle::DriverHandle;
use crate::negotiate::{negotiate_buffer_length, select_format, target_buffer_frames};
use crate::realtime::{Realtime, Session};
use crate::settings::{DeviceSettings, EngineOptions};
use crate::source::{AudioSource, DeviceEvents};
use crate::timing::output_latency_seconds;

/// Double buffering: the driver always owns exactly two halves.
pub const NUM_BUFFERS: usize = 2;

/// Observable device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Started,
    /// Stopped for the application, driver still running on silence.
    RenderingSilence,
}

/// Negotiated session geometry, fixed for the lifetime of an open session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferGeometry {
    pub buffer_len: usize,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl BufferGeometry {
    /// Seconds per period.
    pub fn update_interval(&self) -> f64 {
        self.buffer_len as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferAttributes {
    pub latency: f64,
    pub update_interval: f64,
    pub num_buffers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub instantaneous_latency: f64,
    pub last_update_interval: f64,
    pub text: String,
}

/// One ASIO device.
pub struct AsioDevice {
    settings: DeviceSettings,
    options: EngineOptions,
    realtime: Arc<Realtime>,
    pub(crate) handle: DriverHandle,

    is_open: bool,
    is_started: bool,
    device_running: bool,
    buffers_created: bool,
    geometry: Option<BufferGeometry>,
    pub(crate) device_unavailable_on_open: bool,
}

impl AsioDevice {
    pub fn new(
        registry: Arc<dyn DriverRegistry>,
        id: &str,
        source: Arc<dyn AudioSource>,
        events: Arc<dyn DeviceEvents>,
        options: EngineOptions,
    ) -> Self {
        let realtime = Arc::new(Realtime::new(id, source, events));
        let handle = DriverHandle::new(registry, id, options.clone(), Arc::clone(&realtime));
        Self {
            settings: DeviceSettings::default(),
            options,
            realtime,
            handle,
            is_open: false,
            is_started: false,
            device_running: false,
            buffers_created: false,
            geometry: None,
            device_unavailable_on_open: false,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn realtime(&self) -> &Arc<Realtime> {
        &self.realtime
    }

    /// Replace the session settings. Rejected while open.
    pub fn set_settings(&mut self, settings: DeviceSettings) -> AsioResult<()> {
        if self.is_open {
            return Err(AsioError::unsupported(
                "setSettings",
                "Settings cannot change while the device is open.",
            ));
        }
        self.settings = settings;
        Ok(())
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Started from the application's point of view.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.is_started
    }

    /// The driver itself is running (possibly rendering silence).
    #[inline]
    pub fn is_device_running(&self) -> bool {
        self.device_running
    }

    pub fn geometry(&self) -> Option<BufferGeometry> {
        self.geometry
    }

    /// Buffers are allocated or a session is visible to the realtime side.
    pub fn has_active_buffers(&self) -> bool {
        self.buffers_created || self.realtime.has_session()
    }

    pub fn device_unavailable_on_open(&self) -> bool {
        self.device_unavailable_on_open
    }

    pub fn state(&self) -> DeviceState {
        if !self.is_open {
            DeviceState::Closed
        } else if self.is_playing_silence() {
            DeviceState::RenderingSilence
        } else if self.device_running {
            DeviceState::Started
        } else {
            DeviceState::Open
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPEN / CLOSE
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn open(&mut self) -> AsioResult<()> {
        if self.is_open {
            return Ok(());
        }
        log::debug!(
            "ASIO: Open('{}'): {} ({},{}) channels, {}Hz, hw-timing={}",
            self.id(),
            self.settings.sample_format,
            self.settings.input_channels,
            self.settings.output_channels(),
            self.settings.sample_rate,
            self.settings.use_hardware_timing
        );
        self.device_unavailable_on_open = false;
        match self.open_session() {
            Ok(()) => {
                self.is_open = true;
                Ok(())
            }
            Err(err) => {
                log::debug!("ASIO: Open failed: {}", err);
                self.teardown();
                Err(err)
            }
        }
    }

    fn open_session(&mut self) -> AsioResult<()> {
        let settings = self.settings.clone();
        if settings.total_channels() == 0 {
            return Err(AsioError::unsupported("open", "No channels requested."));
        }
        if settings.sample_rate == 0 {
            return Err(AsioError::unsupported("open", "Invalid sample rate."));
        }

        self.handle.open_driver()?;
        let driver = self
            .handle
            .driver()
            .cloned()
            .ok_or_else(|| AsioError::new(AsioErrorKind::DriverInit, "open", "Driver not open."))?;
        let faults = self.realtime.faults();

        let channels = faults.call("getChannels", || driver.channels())?;
        log::debug!(
            "ASIO: getChannels() => inputChannels={} outputChannels={}",
            channels.input,
            channels.output
        );
        if channels.input <= 0 && channels.output <= 0 {
            self.device_unavailable_on_open = true;
            return Err(AsioError::unsupported("open", "Device unavailable."));
        }
        let outputs = settings.output_channels();
        let inputs = settings.input_channels as usize;
        if outputs as i64 > channels.output as i64 {
            return Err(AsioError::unsupported("open", "Not enough output channels."));
        }
        if settings.outputs.required_device_channels() as i64 > channels.output as i64 {
            return Err(AsioError::unsupported(
                "open",
                "Channel mapping requires more channels than available.",
            ));
        }
        if inputs as i64 > channels.input as i64 {
            return Err(AsioError::unsupported("open", "Not enough input channels."));
        }
        let input_mapping = settings.input_mapping();
        if input_mapping.required_device_channels() as i64 > channels.input as i64 {
            return Err(AsioError::unsupported(
                "open",
                "Channel mapping requires more channels than available.",
            ));
        }

        log::debug!("ASIO: setSampleRate(sampleRate={})", settings.sample_rate);
        faults.call("setSampleRate", || driver.set_sample_rate(settings.sample_rate as f64))?;

        let sizes = faults.call("getBufferSize", || driver.buffer_sizes())?;
        log::debug!(
            "ASIO: getBufferSize() => minSize={} maxSize={} preferredSize={} granularity={}",
            sizes.min,
            sizes.max,
            sizes.preferred,
            sizes.granularity
        );
        let target = target_buffer_frames(settings.latency, settings.sample_rate);
        let buffer_len = negotiate_buffer_length(&sizes, target);
        if buffer_len <= 0 || buffer_len > i32::MAX as i64 {
            return Err(AsioError::protocol(
                "getBufferSize",
                format!("Invalid buffer size {buffer_len}."),
            ));
        }
        let frames = buffer_len as usize;

        let mut infos: Vec<BufferInfo> = input_mapping
            .device_channels()
            .map(|channel| BufferInfo::new(true, channel as i32))
            .chain(
                settings
                    .outputs
                    .device_channels()
                    .map(|channel| BufferInfo::new(false, channel as i32)),
            )
            .collect();
        log::debug!(
            "ASIO: createBuffers(numChannels={}, bufferSize={})",
            infos.len(),
            buffer_len
        );
        let callbacks: Arc<dyn DriverCallbacks> = self.realtime.clone();
        self.buffers_created = true;
        if let Err(err) = faults.call("createBuffers", || {
            driver.create_buffers(&mut infos, buffer_len as i32, callbacks)
        }) {
            self.buffers_created = false;
            return Err(err);
        }

        let mut halves: Vec<[HwBuffer; 2]> = Vec::with_capacity(infos.len());
        for info in &infos {
            match info.buffers {
                [Some(first), Some(second)] => halves.push([first, second]),
                _ => return Err(AsioError::protocol("createBuffers", "createBuffers returned null")),
            }
        }

        let mut bindings = Vec::with_capacity(infos.len());
        for (info, buffers) in infos.iter().zip(halves) {
            let channel_info =
                faults.call("getChannelInfo", || driver.channel_info(info.channel, info.is_input))?;
            log::debug!(
                "ASIO: getChannelInfo(isInput={} channel={}) => isActive={} channelGroup={} type={} name='{}'",
                info.is_input,
                info.channel,
                channel_info.is_active,
                channel_info.group,
                channel_info.sample_type,
                channel_info.name
            );
            if !channel_info.is_active {
                faults.consistency_fault(
                    "getChannelInfo",
                    &format!("channel {} reported inactive after createBuffers", info.channel),
                );
            }
            let needed = frames * channel_info.sample_type.size_bytes();
            if buffers.iter().any(|half| half.len_bytes() < needed) {
                return Err(AsioError::protocol(
                    "createBuffers",
                    format!("Buffer for channel {} is too small.", info.channel),
                ));
            }
            bindings.push(ChannelBinding {
                is_input: info.is_input,
                channel: info.channel,
                sample_type: channel_info.sample_type,
                name: channel_info.name,
                buffers,
            });
        }

        let types: Vec<_> = bindings.iter().map(|b| b.sample_type).collect();
        let format = select_format(&types);
        log::debug!("ASIO: working format {}", format);
        self.settings.sample_format = format;

        let mut buffers = WorkingBuffers::default();
        buffers.allocate(format, frames, outputs, inputs);
        for binding in &bindings {
            for half in &binding.buffers {
                // Safety: no session is published and the driver is stopped,
                // so nothing else touches the halves.
                clear_hw_buffer(unsafe { half.bytes_mut() });
            }
        }

        let can_output_ready = match faults.call("canOutputReady", || driver.can_output_ready()) {
            Ok(can) => can,
            Err(err) if err.is_crash() => return Err(err),
            Err(_) => false,
        };

        self.realtime.reset_counters(buffer_len);
        self.realtime.set_configured_rate(settings.sample_rate);
        self.geometry = Some(BufferGeometry {
            buffer_len: frames,
            sample_rate: settings.sample_rate,
            format,
            input_channels: inputs,
            output_channels: outputs,
        });
        self.realtime.install_session(Session {
            driver: Arc::clone(&driver),
            buffer_len: frames,
            sample_rate: settings.sample_rate,
            input_channels: inputs,
            output_channels: outputs,
            bindings,
            buffers,
            can_output_ready,
            use_hardware_timing: settings.use_hardware_timing,
        });
        self.refresh_latency()
    }

    /// Stop, dispose and release everything. Idempotent, never fails.
    pub fn close(&mut self) {
        if !self.is_open && !self.has_active_buffers() && !self.handle.is_driver_open() {
            return;
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        let driver = self.handle.driver().cloned();
        let faults = self.realtime.faults();
        if self.device_running {
            self.device_running = false;
            if let Some(driver) = &driver {
                let _ = faults.call_guarded("stop", || driver.stop());
            }
            self.realtime.reset_frames_written();
        }
        self.is_started = false;
        self.realtime.set_render_silence(false);

        drop(self.realtime.retire_session());
        if self.buffers_created {
            self.buffers_created = false;
            if let Some(driver) = &driver {
                let _ = faults.call_guarded("disposeBuffers", || driver.dispose_buffers());
            }
        }
        drop(driver);

        self.geometry = None;
        self.realtime.set_latency(0.0);
        self.realtime.set_configured_rate(0);
        self.handle.close_driver();
        self.is_open = false;
    }

    /// Close after a crash reported by a control call.
    fn escalate(&mut self, err: &AsioError) {
        if err.is_crash() {
            log::error!("ASIO: {}: closing device after driver crash", err.call);
            self.teardown();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // START / STOP
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn start(&mut self) -> AsioResult<()> {
        if !self.is_open {
            return Err(AsioError::new(AsioErrorKind::Other, "start", "Device not open."));
        }
        self.check_source_unlocked("start");
        if self.is_started {
            return Ok(());
        }
        if self.settings.keep_device_running && self.device_running {
            self.set_render_silence(false, true);
            self.is_started = true;
            return Ok(());
        }

        self.set_render_silence(false, false);
        self.realtime.reset_frames_written();
        let Some(driver) = self.handle.driver().cloned() else {
            return Err(AsioError::new(AsioErrorKind::Other, "start", "Driver not open."));
        };
        match self.realtime.faults().call("start", || driver.start()) {
            Ok(()) => {
                self.device_running = true;
                self.is_started = true;
                Ok(())
            }
            Err(err) => {
                self.escalate(&err);
                Err(err)
            }
        }
    }

    /// Stop for the application. With `keep_device_running` the driver keeps
    /// running on silence.
    pub fn stop(&mut self) {
        self.stop_impl(false);
    }

    /// Stop the driver even with `keep_device_running`.
    pub fn stop_and_avoid_playing_silence(&mut self) {
        self.stop_impl(true);
    }

    fn stop_impl(&mut self, force: bool) {
        if !self.is_open || !self.device_running {
            self.is_started = false;
            return;
        }
        self.check_source_unlocked("stop");
        if self.settings.keep_device_running && !force {
            self.set_render_silence(true, true);
            self.is_started = false;
            return;
        }
        self.stop_driver();
        self.is_started = false;
    }

    /// End a keep-alive silence phase by stopping the driver.
    pub fn end_playing_silence(&mut self) {
        if !self.is_playing_silence() {
            return;
        }
        self.stop_driver();
    }

    fn stop_driver(&mut self) {
        self.device_running = false;
        if let Some(driver) = self.handle.driver().cloned() {
            if let Err(err) = self.realtime.faults().call_guarded("stop", || driver.stop()) {
                self.escalate(&err);
            }
        }
        self.realtime.reset_frames_written();
        self.realtime.set_render_silence(false);
    }

    pub fn is_playing_silence(&self) -> bool {
        self.settings.keep_device_running && self.device_running && self.realtime.render_silence()
    }

    /// Request a silence transition. With `wait`, block until the realtime
    /// side acknowledges it or the timeout passes; returns false on timeout.
    pub fn set_render_silence(&self, silence: bool, wait: bool) -> bool {
        self.realtime.set_render_silence(silence);
        if !wait {
            return true;
        }
        let started = Instant::now();
        while self.realtime.rendering_silence() != silence {
            if started.elapsed() > self.options.silence_ack_timeout {
                let message = if self.realtime.source().is_locked_by_current_thread() {
                    format!(
                        "AudioSource locked while {} ASIO",
                        if silence { "stopping" } else { "starting" }
                    )
                } else {
                    format!(
                        "waiting for ASIO failed in {}",
                        if silence { "Stop()" } else { "Start()" }
                    )
                };
                self.realtime.faults().consistency_fault("setRenderSilence", &message);
                return false;
            }
            thread::sleep(self.options.silence_poll_interval);
        }
        true
    }

    fn check_source_unlocked(&self, func: &'static str) {
        if self.realtime.source().is_locked_by_current_thread() {
            self.realtime
                .faults()
                .consistency_fault(func, "AudioSource locked while starting or stopping ASIO");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SESSION QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Act on requests the realtime side recorded. Returns true if any was
    /// handled.
    pub fn handle_requests(&mut self) -> bool {
        let requests = self.realtime.take_requests();
        let mut handled = false;
        if requests.contains(AsioRequests::LATENCIES_CHANGED) {
            if let Err(err) = self.refresh_latency() {
                self.escalate(&err);
            }
            handled = true;
        }
        handled
    }

    /// Re-query the driver's output latency.
    pub fn update_latency(&mut self) {
        if let Err(err) = self.refresh_latency() {
            self.escalate(&err);
        }
    }

    /// Only a crash is reported; other failures keep the previous estimate.
    fn refresh_latency(&mut self) -> AsioResult<()> {
        let (Some(geometry), Some(driver)) = (self.geometry, self.handle.driver().cloned()) else {
            return Ok(());
        };
        let len = geometry.buffer_len as i64;
        let latency = match self.realtime.faults().call("getLatencies", || driver.latencies()) {
            Ok(latencies) => {
                log::debug!(
                    "ASIO: getLatencies() => inputLatency={} outputLatency={}",
                    latencies.input,
                    latencies.output
                );
                output_latency_seconds(latencies.output as i64, len, geometry.sample_rate)
            }
            Err(err) if err.is_crash() => return Err(err),
            Err(_) => match self.realtime.latency() {
                prior if prior > 0.0 => prior,
                _ => output_latency_seconds(0, len, geometry.sample_rate),
            },
        };
        self.realtime.set_latency(latency);
        Ok(())
    }

    pub fn buffer_attributes(&self) -> BufferAttributes {
        BufferAttributes {
            latency: self.realtime.latency(),
            update_interval: self.geometry.map_or(0.0, |g| g.update_interval()),
            num_buffers: NUM_BUFFERS,
        }
    }

    pub fn statistics(&self) -> Statistics {
        let features = self.realtime.used_features();
        let unsupported = features.intersection(AsioFeatures::UNSUPPORTED);
        let text = if !unsupported.is_empty() {
            format!("WARNING: unsupported features: {unsupported}")
        } else if !features.is_empty() {
            format!("OK, features used: {features}")
        } else {
            "OK.".to_owned()
        };
        Statistics {
            instantaneous_latency: self.realtime.latency(),
            last_update_interval: self.geometry.map_or(0.0, |g| g.update_interval()),
            text,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DIAGNOSTICS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Whether the calling thread is currently inside a realtime callback.
    pub fn debug_in_realtime_callback(&self) -> bool {
        self.realtime.in_realtime_callback()
    }

    /// Driver code runs in-process and may crash it.
    pub fn is_fragile_device(&self) -> bool {
        true
    }
}

impl Drop for AsioDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConfig, MockDriver, MockFault, MockRegistry, SilentSource};
    use crate::source::NoEvents;
    use approx::assert_relative_eq;

    fn device(config: MockConfig) -> (AsioDevice, MockDriver) {
        let registry = MockRegistry::with_driver("{mock}", config);
        let mock = registry.driver("{mock}").expect("mock");
        let device = AsioDevice::new(
            Arc::new(registry),
            "{mock}",
            Arc::new(SilentSource),
            Arc::new(NoEvents),
            EngineOptions::default(),
        );
        (device, mock)
    }

    #[test]
    fn test_open_negotiates_geometry() {
        let (mut dev, mock) = device(MockConfig::default());
        dev.open().expect("open");
        let geometry = dev.geometry().expect("geometry");
        // 0.05 s at 48 kHz over two halves is 1200 frames
        assert_eq!(geometry.buffer_len, 1024);
        assert_eq!(geometry.format, SampleFormat::Int32);
        assert_eq!(mock.buffer_frames(), 1024);
        assert_eq!(dev.state(), DeviceState::Open);
        // reported 256 < len, so two buffers
        assert_relative_eq!(dev.buffer_attributes().latency, 2.0 * 1024.0 / 48000.0);
        dev.close();
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(!mock.has_buffers());
    }

    #[test]
    fn test_open_rejects_missing_channels() {
        let (mut dev, _) = device(MockConfig::default());
        dev.set_settings(DeviceSettings {
            input_channels: 5,
            ..Default::default()
        })
        .expect("settings");
        let err = dev.open().expect_err("too many inputs");
        assert_eq!(err.message, "Not enough input channels.");
        assert!(!dev.is_open());
        assert!(!dev.has_active_buffers());
    }

    #[test]
    fn test_settings_locked_while_open() {
        let (mut dev, _) = device(MockConfig::default());
        dev.open().expect("open");
        assert!(dev.set_settings(DeviceSettings::default()).is_err());
        dev.close();
        assert!(dev.set_settings(DeviceSettings::default()).is_ok());
    }

    #[test]
    fn test_start_crash_forces_close() {
        let (mut dev, mock) = device(MockConfig::default());
        dev.open().expect("open");
        mock.inject_fault("start", MockFault::Panic);
        let err = dev.start().expect_err("crash");
        assert!(err.is_crash());
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(!dev.has_active_buffers());
    }

    #[test]
    fn test_statistics_text() {
        let (mut dev, mock) = device(MockConfig::default());
        dev.open().expect("open");
        mock.send_message(crate::driver::DriverMessage::new(
            crate::driver::selector::BUFFER_SIZE_CHANGE,
            512,
        ));
        let stats = dev.statistics();
        assert_eq!(stats.text, "WARNING: unsupported features: buffer");
    }
}
