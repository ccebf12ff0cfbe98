//! In-process mock driver and registry
//!
//! Stands in for a real driver in tests and demos. Buffers live on the heap,
//! callbacks are driven explicitly from the test thread, and any control call
//! can be made to fail or panic with [`MockDriver::inject_fault`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{
    AsioBufferSizes, AsioChannelInfo, AsioDriver, BufferIndex, BufferInfo, Channels,
    DriverCallbacks, DriverInfo, DriverMessage, DriverRegistry, DriverResult, DriverTime,
    HwBuffer, Latencies,
};
use crate::error::DriverError;
use crate::sample_type::{AsioSampleType, HwSample, decode_sample, encode_sample};
use crate::source::{AudioSource, Interleaved, InterleavedMut};

const ASE_INVALID_PARAMETER: i32 = -998;
const ASE_INVALID_MODE: i32 = -997;
const ASE_NO_CLOCK: i32 = -995;

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Static properties the mock reports.
#[derive(Debug, Clone, PartialEq)]
pub struct MockConfig {
    pub name: String,
    pub version: i32,
    pub channels: Channels,
    pub buffer_sizes: AsioBufferSizes,
    pub latencies: Latencies,
    pub sample_rate: f64,
    pub supported_rates: Vec<f64>,
    pub input_type: AsioSampleType,
    pub output_type: AsioSampleType,
    pub can_output_ready: bool,
    /// `create_buffers` succeeds but leaves every buffer pointer null.
    pub null_buffers: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "Mock ASIO".into(),
            version: 0x0100,
            channels: Channels {
                input: 4,
                output: 8,
            },
            buffer_sizes: AsioBufferSizes {
                min: 64,
                max: 2048,
                preferred: 256,
                granularity: -1,
            },
            latencies: Latencies {
                input: 256,
                output: 256,
            },
            sample_rate: 48000.0,
            supported_rates: vec![44100.0, 48000.0, 88200.0, 96000.0],
            input_type: AsioSampleType::Int32LSB,
            output_type: AsioSampleType::Int32LSB,
            can_output_ready: true,
            null_buffers: false,
        }
    }
}

/// Failure injected into one driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockFault {
    /// The call panics, as a crashing driver would.
    Panic,
    Error(DriverError),
}

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

struct ChannelStorage {
    is_input: bool,
    channel: i32,
    sample_type: AsioSampleType,
    halves: [Box<[u8]>; 2],
}

struct MockState {
    config: MockConfig,
    faults: HashMap<String, MockFault>,
    calls: HashMap<&'static str, usize>,
    sample_rate: f64,
    running: bool,
    frames: usize,
    storage: Vec<ChannelStorage>,
    callbacks: Option<Arc<dyn DriverCallbacks>>,
    next_index: BufferIndex,
}

/// Mock driver. Clones share state, so a test can keep one clone while the
/// engine owns another.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new(config: MockConfig) -> Self {
        let sample_rate = config.sample_rate;
        Self {
            state: Arc::new(Mutex::new(MockState {
                config,
                faults: HashMap::new(),
                calls: HashMap::new(),
                sample_rate,
                running: false,
                frames: 0,
                storage: Vec::new(),
                callbacks: None,
                next_index: 0,
            })),
        }
    }

    /// Make every later call named `func` (ASIO spelling) fail with `fault`.
    pub fn inject_fault(&self, func: &str, fault: MockFault) {
        self.state.lock().faults.insert(func.to_owned(), fault);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockConfig)) {
        f(&mut self.state.lock().config);
    }

    /// Number of times `func` was called.
    pub fn calls(&self, func: &str) -> usize {
        self.state.lock().calls.get(func).copied().unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn has_buffers(&self) -> bool {
        let state = self.state.lock();
        state.callbacks.is_some()
    }

    pub fn buffer_frames(&self) -> usize {
        self.state.lock().frames
    }

    pub fn current_sample_rate(&self) -> f64 {
        self.state.lock().sample_rate
    }

    fn check(&self, func: &'static str) -> DriverResult<()> {
        let fault = {
            let mut state = self.state.lock();
            *state.calls.entry(func).or_insert(0) += 1;
            state.faults.get(func).cloned()
        };
        match fault {
            None => Ok(()),
            Some(MockFault::Error(err)) => Err(err),
            Some(MockFault::Panic) => panic!("mock driver crashed in {func}"),
        }
    }

    fn callbacks(&self) -> Option<Arc<dyn DriverCallbacks>> {
        self.state.lock().callbacks.clone()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Driving callbacks
    // ───────────────────────────────────────────────────────────────────────────

    /// Deliver one buffer switch for the next half. Returns false without
    /// buffers.
    pub fn tick(&self) -> bool {
        let next = {
            let mut state = self.state.lock();
            let index = state.next_index;
            state.next_index ^= 1;
            state.callbacks.clone().map(|cb| (cb, index))
        };
        match next {
            Some((callbacks, index)) => {
                callbacks.buffer_switch(index, None);
                true
            }
            None => false,
        }
    }

    pub fn buffer_switch(&self, index: BufferIndex, time: Option<DriverTime>) -> bool {
        match self.callbacks() {
            Some(callbacks) => {
                callbacks.buffer_switch(index, time.as_ref());
                true
            }
            None => false,
        }
    }

    pub fn send_message(&self, message: DriverMessage) -> Option<i32> {
        self.callbacks().map(|callbacks| callbacks.message(message))
    }

    pub fn sample_rate_changed(&self, sample_rate: f64) -> bool {
        self.callbacks()
            .map(|callbacks| callbacks.sample_rate_did_change(sample_rate))
            .is_some()
    }

    pub fn request_deferred(&self, deferred: bool) -> bool {
        self.callbacks()
            .map(|callbacks| callbacks.request_deferred_processing(deferred))
            .is_some()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Buffer access
    // ───────────────────────────────────────────────────────────────────────────

    /// Decoded samples of output `channel`, half `index`.
    pub fn output_samples(&self, channel: i32, index: BufferIndex) -> Option<Vec<f64>> {
        self.read_half(false, channel, index)
    }

    pub fn input_samples(&self, channel: i32, index: BufferIndex) -> Option<Vec<f64>> {
        self.read_half(true, channel, index)
    }

    /// Fill input `channel`, half `index` with `samples`. Returns false if the
    /// channel has no buffer.
    pub fn set_input_samples(&self, channel: i32, index: BufferIndex, samples: &[f64]) -> bool {
        let mut state = self.state.lock();
        let Some(storage) = state
            .storage
            .iter_mut()
            .find(|s| s.is_input && s.channel == channel)
        else {
            return false;
        };
        let sample_type = storage.sample_type;
        let size = sample_type.size_bytes();
        let half = &mut storage.halves[index & 1];
        for (bytes, &value) in half.chunks_exact_mut(size).zip(samples) {
            encode_sample(HwSample::Float(value), sample_type, bytes);
        }
        true
    }

    fn read_half(&self, is_input: bool, channel: i32, index: BufferIndex) -> Option<Vec<f64>> {
        let state = self.state.lock();
        let storage = state
            .storage
            .iter()
            .find(|s| s.is_input == is_input && s.channel == channel)?;
        let size = storage.sample_type.size_bytes();
        Some(
            storage.halves[index & 1]
                .chunks_exact(size)
                .map(|bytes| decode_sample(bytes, storage.sample_type).to_float())
                .collect(),
        )
    }
}

impl AsioDriver for MockDriver {
    fn driver_name(&self) -> DriverResult<String> {
        self.check("getDriverName")?;
        Ok(self.state.lock().config.name.clone())
    }

    fn driver_version(&self) -> DriverResult<i32> {
        self.check("getDriverVersion")?;
        Ok(self.state.lock().config.version)
    }

    fn error_message(&self) -> DriverResult<String> {
        self.check("getErrorMessage")?;
        Ok(String::new())
    }

    fn channels(&self) -> DriverResult<Channels> {
        self.check("getChannels")?;
        Ok(self.state.lock().config.channels)
    }

    fn latencies(&self) -> DriverResult<Latencies> {
        self.check("getLatencies")?;
        Ok(self.state.lock().config.latencies)
    }

    fn buffer_sizes(&self) -> DriverResult<AsioBufferSizes> {
        self.check("getBufferSize")?;
        Ok(self.state.lock().config.buffer_sizes)
    }

    fn can_sample_rate(&self, sample_rate: f64) -> DriverResult<bool> {
        self.check("canSampleRate")?;
        Ok(self.state.lock().config.supported_rates.contains(&sample_rate))
    }

    fn sample_rate(&self) -> DriverResult<f64> {
        self.check("getSampleRate")?;
        Ok(self.state.lock().sample_rate)
    }

    fn set_sample_rate(&self, sample_rate: f64) -> DriverResult<()> {
        self.check("setSampleRate")?;
        let mut state = self.state.lock();
        if !state.config.supported_rates.contains(&sample_rate) {
            return Err(DriverError::Protocol {
                code: ASE_NO_CLOCK,
                message: format!("sample rate {sample_rate} not supported"),
            });
        }
        state.sample_rate = sample_rate;
        Ok(())
    }

    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<AsioChannelInfo> {
        self.check("getChannelInfo")?;
        let state = self.state.lock();
        let (available, sample_type, prefix) = if is_input {
            (state.config.channels.input, state.config.input_type, "In")
        } else {
            (state.config.channels.output, state.config.output_type, "Out")
        };
        if !(0..available).contains(&channel) {
            return Err(DriverError::Protocol {
                code: ASE_INVALID_PARAMETER,
                message: format!("no such channel {channel}"),
            });
        }
        let is_active = state
            .storage
            .iter()
            .any(|s| s.is_input == is_input && s.channel == channel);
        Ok(AsioChannelInfo {
            channel,
            is_input,
            is_active,
            group: 0,
            sample_type,
            name: format!("{} {}", prefix, channel + 1),
        })
    }

    fn create_buffers(
        &self,
        infos: &mut [BufferInfo],
        frames: i32,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> DriverResult<()> {
        self.check("createBuffers")?;
        let mut state = self.state.lock();
        if state.callbacks.is_some() {
            return Err(DriverError::Protocol {
                code: ASE_INVALID_MODE,
                message: "buffers already created".into(),
            });
        }
        if frames <= 0 {
            return Err(DriverError::Protocol {
                code: ASE_INVALID_PARAMETER,
                message: format!("invalid buffer size {frames}"),
            });
        }
        let frames = frames as usize;
        let mut storage = Vec::with_capacity(infos.len());
        for info in infos.iter() {
            let (available, sample_type) = if info.is_input {
                (state.config.channels.input, state.config.input_type)
            } else {
                (state.config.channels.output, state.config.output_type)
            };
            if !(0..available).contains(&info.channel) {
                return Err(DriverError::Protocol {
                    code: ASE_INVALID_PARAMETER,
                    message: format!("no such channel {}", info.channel),
                });
            }
            let len = frames * sample_type.size_bytes();
            storage.push(ChannelStorage {
                is_input: info.is_input,
                channel: info.channel,
                sample_type,
                halves: [vec![0u8; len].into_boxed_slice(), vec![0u8; len].into_boxed_slice()],
            });
        }
        if !state.config.null_buffers {
            for (info, storage) in infos.iter_mut().zip(storage.iter_mut()) {
                for (slot, half) in info.buffers.iter_mut().zip(storage.halves.iter_mut()) {
                    // Safety: the allocation outlives the buffers; it is only
                    // freed by dispose_buffers.
                    *slot = unsafe { HwBuffer::from_raw(half.as_mut_ptr(), half.len()) };
                }
            }
        }
        state.storage = storage;
        state.frames = frames;
        state.next_index = 0;
        state.callbacks = Some(callbacks);
        Ok(())
    }

    fn dispose_buffers(&self) -> DriverResult<()> {
        self.check("disposeBuffers")?;
        let mut state = self.state.lock();
        if state.callbacks.is_none() {
            return Err(DriverError::Protocol {
                code: ASE_INVALID_MODE,
                message: "no buffers".into(),
            });
        }
        state.running = false;
        state.storage.clear();
        state.frames = 0;
        state.callbacks = None;
        Ok(())
    }

    fn start(&self) -> DriverResult<()> {
        self.check("start")?;
        let mut state = self.state.lock();
        if state.callbacks.is_none() {
            return Err(DriverError::Protocol {
                code: ASE_INVALID_MODE,
                message: "no buffers".into(),
            });
        }
        state.running = true;
        Ok(())
    }

    fn stop(&self) -> DriverResult<()> {
        self.check("stop")?;
        self.state.lock().running = false;
        Ok(())
    }

    fn can_output_ready(&self) -> DriverResult<bool> {
        self.check("canOutputReady")?;
        Ok(self.state.lock().config.can_output_ready)
    }

    fn output_ready(&self) -> DriverResult<()> {
        self.check("outputReady")
    }

    fn control_panel(&self) -> DriverResult<()> {
        self.check("controlPanel")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct RegistryState {
    drivers: Vec<(DriverInfo, MockDriver)>,
    instantiations: usize,
}

/// Registry over mock drivers. Instantiation hands out clones.
#[derive(Clone, Default)]
pub struct MockRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl MockRegistry {
    pub fn with_driver(id: &str, config: MockConfig) -> Self {
        let registry = Self::default();
        registry.add(id, MockDriver::new(config));
        registry
    }

    /// Register `driver` under `id`, deriving the other registry fields.
    pub fn add(&self, id: &str, driver: MockDriver) {
        let name = driver.state.lock().config.name.clone();
        let info = DriverInfo {
            id: id.to_owned(),
            key: name.clone(),
            name: name.clone(),
            description: format!("{name} (mock)"),
            display_name: name,
        };
        self.state.lock().drivers.push((info, driver));
    }

    pub fn driver(&self, id: &str) -> Option<MockDriver> {
        self.state
            .lock()
            .drivers
            .iter()
            .find(|(info, _)| info.id == id)
            .map(|(_, driver)| driver.clone())
    }

    pub fn instantiations(&self) -> usize {
        self.state.lock().instantiations
    }
}

impl DriverRegistry for MockRegistry {
    fn drivers(&self) -> Vec<DriverInfo> {
        self.state
            .lock()
            .drivers
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }

    fn instantiate(&self, id: &str) -> DriverResult<Box<dyn AsioDriver>> {
        let driver = {
            let mut state = self.state.lock();
            state.instantiations += 1;
            state
                .drivers
                .iter()
                .find(|(info, _)| info.id == id)
                .map(|(_, driver)| driver.clone())
        };
        let driver =
            driver.ok_or_else(|| DriverError::LoadFailed(format!("no driver with id {id}")))?;
        driver.check("instantiate")?;
        Ok(Box::new(driver))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Source that renders silence and ignores input.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSource;

impl AudioSource for SilentSource {
    fn read_prepare(&self, _frames: usize, _latency_frames: usize) {}

    fn read(&self, output: InterleavedMut<'_>, _input: Option<Interleaved<'_>>, _frames: usize) {
        match output {
            InterleavedMut::Int16(b) => b.fill(0),
            InterleavedMut::Int24(b) => b.fill(Default::default()),
            InterleavedMut::Int32(b) => b.fill(0),
            InterleavedMut::Float32(b) => b.fill(0.0),
            InterleavedMut::Float64(b) => b.fill(0.0),
        }
    }

    fn read_done(&self) {}
}
