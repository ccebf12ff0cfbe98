//! Shared fixtures for the rf-asio integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rf_asio::mock::{MockConfig, MockDriver, MockRegistry};
use rf_asio::{
    AsioDevice, AudioSource, DeviceEvents, DeviceSettings, EngineOptions, Int24, Interleaved,
    InterleavedMut, MessageLevel, TimeInfo,
};

pub const DRIVER_ID: &str = "{00000000-0000-0000-0000-00000000A510}";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes a constant level, captures input and records every call.
pub struct RecordingSource {
    level: f64,
    pub locked: AtomicBool,
    pub reads: AtomicUsize,
    pub calls: Mutex<Vec<&'static str>>,
    pub last_input: Mutex<Vec<f64>>,
    pub time_infos: Mutex<Vec<TimeInfo>>,
    pub read_threads: Mutex<Vec<Option<String>>>,
    pub panic_on_read: AtomicBool,
}

impl RecordingSource {
    pub fn new(level: f64) -> Arc<Self> {
        Arc::new(Self {
            level,
            locked: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            last_input: Mutex::new(Vec::new()),
            time_infos: Mutex::new(Vec::new()),
            read_threads: Mutex::new(Vec::new()),
            panic_on_read: AtomicBool::new(false),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl AudioSource for RecordingSource {
    fn read_prepare(&self, _frames: usize, _latency_frames: usize) {
        self.calls.lock().push("prepare");
    }

    fn read(&self, output: InterleavedMut<'_>, input: Option<Interleaved<'_>>, _frames: usize) {
        self.calls.lock().push("read");
        if self.panic_on_read.load(Ordering::SeqCst) {
            panic!("source failure");
        }
        self.read_threads
            .lock()
            .push(thread::current().name().map(str::to_owned));
        let level = self.level;
        match output {
            InterleavedMut::Int16(b) => b.fill((level * 32767.0) as i16),
            InterleavedMut::Int24(b) => b.fill(Int24::new((level * 8_388_607.0) as i32)),
            InterleavedMut::Int32(b) => b.fill((level * 2_147_483_647.0) as i32),
            InterleavedMut::Float32(b) => b.fill(level as f32),
            InterleavedMut::Float64(b) => b.fill(level),
        }
        let captured = match input {
            None => Vec::new(),
            Some(Interleaved::Int16(b)) => b.iter().map(|&s| s as f64 / 32768.0).collect(),
            Some(Interleaved::Int24(b)) => b.iter().map(|s| s.get() as f64 / 8_388_608.0).collect(),
            Some(Interleaved::Int32(b)) => b.iter().map(|&s| s as f64 / 2_147_483_648.0).collect(),
            Some(Interleaved::Float32(b)) => b.iter().map(|&s| s as f64).collect(),
            Some(Interleaved::Float64(b)) => b.to_vec(),
        };
        *self.last_input.lock() = captured;
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn read_done(&self) {
        self.calls.lock().push("done");
    }

    fn set_time_info(&self, info: &TimeInfo) {
        self.time_infos.lock().push(*info);
    }

    fn is_locked_by_current_thread(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct RecordingEvents {
    pub closes: AtomicUsize,
    pub resets: AtomicUsize,
    pub restarts: AtomicUsize,
    pub messages: Mutex<Vec<(MessageLevel, String)>>,
}

impl DeviceEvents for RecordingEvents {
    fn request_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn request_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn request_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn device_message(&self, level: MessageLevel, message: &str) {
        self.messages.lock().push((level, message.to_owned()));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FIXTURE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Fixture {
    pub device: AsioDevice,
    pub mock: MockDriver,
    pub registry: MockRegistry,
    pub source: Arc<RecordingSource>,
    pub events: Arc<RecordingEvents>,
}

impl Fixture {
    pub fn new(config: MockConfig) -> Self {
        Self::with_options(config, EngineOptions::default())
    }

    pub fn with_options(config: MockConfig, options: EngineOptions) -> Self {
        init_logging();
        let registry = MockRegistry::with_driver(DRIVER_ID, config);
        let mock = registry.driver(DRIVER_ID).expect("registered mock");
        let source = RecordingSource::new(0.5);
        let events = Arc::new(RecordingEvents::default());
        let device = AsioDevice::new(
            Arc::new(registry.clone()),
            DRIVER_ID,
            source.clone(),
            events.clone(),
            options,
        );
        Self {
            device,
            mock,
            registry,
            source,
            events,
        }
    }

    /// Open with `settings`, panicking on failure.
    pub fn open(mut self, settings: DeviceSettings) -> Self {
        self.device.set_settings(settings).expect("settings");
        self.device.open().expect("open");
        self
    }

    pub fn buffer_len(&self) -> usize {
        self.device.geometry().expect("open device").buffer_len
    }
}

/// Small fixed buffers so sample assertions stay cheap.
pub fn small_buffers() -> MockConfig {
    MockConfig {
        buffer_sizes: rf_asio::AsioBufferSizes {
            min: 64,
            max: 64,
            preferred: 64,
            granularity: 0,
        },
        ..Default::default()
    }
}

/// Poll `cond` until it holds or a second passes.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
