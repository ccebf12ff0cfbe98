//! Realtime buffer-switch engine
//!
//! Runs on threads the application does not own: the driver's callback thread
//! or the deferred worker. Nothing here takes a lock or lets a panic escape.
//!
//! Session protocol between the control thread and the realtime side:
//!
//! ```text
//!   control                           realtime
//!   ───────                           ────────
//!   install_session()                 in_flight += 1
//!     write session                   live? ──no──► skip
//!     live = true                     busy  ──held─► skip (overrun)
//!   retire_session()                  process period with &mut Session
//!     live = false                    busy = false
//!     wait in_flight == 0             in_flight -= 1
//!     take session
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use portable_atomic::AtomicF64;
use rf_core::SampleFormat;

use crate::buffers::{ChannelBinding, SampleBufferPair, WorkingBuffers};
use crate::convert::{WorkingSample, convert_from_hw, convert_to_hw};
use crate::dispatcher::{DeferredDispatcher, Period};
use crate::driver::{AsioDriver, BufferIndex, DriverCallbacks, DriverMessage, DriverTime, selector};
use crate::fault::{FaultContext, panic_message};
use crate::flags::{AsioFeatures, AsioRequests, FlagRegister};
use crate::rt_cell::RtCell;
use crate::source::{AudioSource, DeviceEvents};
use crate::timing::{StreamClock, synchronize};

/// Relative deviation of a reported sample rate that is still accepted.
pub const SAMPLE_RATE_TOLERANCE: f64 = 0.05;

/// Version reported for the engine-version selector.
pub const ENGINE_VERSION: i32 = 2;

const SUPPORTED_SELECTORS: [i32; 9] = [
    selector::SELECTOR_SUPPORTED,
    selector::ENGINE_VERSION,
    selector::RESET_REQUEST,
    selector::BUFFER_SIZE_CHANGE,
    selector::RESYNC_REQUEST,
    selector::LATENCIES_CHANGED,
    selector::SUPPORTS_TIME_INFO,
    selector::SUPPORTS_TIME_CODE,
    selector::OVERLOAD,
];

// ═══════════════════════════════════════════════════════════════════════════════
// SESSION
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the realtime side needs for one open session.
pub(crate) struct Session {
    pub driver: Arc<dyn AsioDriver>,
    pub buffer_len: usize,
    pub sample_rate: u32,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Inputs first, then outputs.
    pub bindings: Vec<ChannelBinding>,
    pub buffers: WorkingBuffers,
    pub can_output_ready: bool,
    pub use_hardware_timing: bool,
}

/// Stable per-thread identity for the realtime-callback check.
fn current_thread_token() -> u64 {
    static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

struct RealtimeThreadGuard<'a>(&'a AtomicU64);

impl<'a> RealtimeThreadGuard<'a> {
    fn enter(slot: &'a AtomicU64) -> Self {
        slot.store(current_thread_token(), Ordering::Release);
        Self(slot)
    }
}

impl Drop for RealtimeThreadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REALTIME ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Realtime half of a device, shared with the driver as its callbacks.
pub struct Realtime {
    source: Arc<dyn AudioSource>,
    faults: FaultContext,

    session: RtCell<Option<Session>>,
    session_live: AtomicBool,
    in_flight: AtomicUsize,
    busy: AtomicBool,

    dispatcher: RtCell<Option<DeferredDispatcher>>,
    deferred: AtomicBool,

    render_silence: AtomicBool,
    rendering_silence: AtomicBool,

    buffer_index: AtomicUsize,
    total_frames_written: AtomicI64,
    stream_position_offset: AtomicI64,
    latency: AtomicF64,
    configured_rate: AtomicU32,

    used_features: FlagRegister,
    requests: FlagRegister,

    realtime_thread: AtomicU64,
    periods: AtomicU64,
    skipped_periods: AtomicU64,
}

impl Realtime {
    pub fn new(device_id: &str, source: Arc<dyn AudioSource>, events: Arc<dyn DeviceEvents>) -> Self {
        Self {
            source,
            faults: FaultContext::new(device_id, events),
            session: RtCell::new(None),
            session_live: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            dispatcher: RtCell::new(None),
            deferred: AtomicBool::new(false),
            render_silence: AtomicBool::new(false),
            rendering_silence: AtomicBool::new(false),
            buffer_index: AtomicUsize::new(0),
            total_frames_written: AtomicI64::new(0),
            stream_position_offset: AtomicI64::new(0),
            latency: AtomicF64::new(0.0),
            configured_rate: AtomicU32::new(0),
            used_features: FlagRegister::new(),
            requests: FlagRegister::new(),
            realtime_thread: AtomicU64::new(0),
            periods: AtomicU64::new(0),
            skipped_periods: AtomicU64::new(0),
        }
    }

    pub fn faults(&self) -> &FaultContext {
        &self.faults
    }

    pub fn source(&self) -> &Arc<dyn AudioSource> {
        &self.source
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Control-thread side
    // ───────────────────────────────────────────────────────────────────────────

    /// Publish a session to the realtime side.
    pub(crate) fn install_session(&self, session: Session) {
        debug_assert!(!self.session_live.load(Ordering::SeqCst));
        self.wait_quiescent();
        // Safety: not live and nothing in flight, so no realtime borrow exists.
        unsafe {
            *self.session.get_mut() = Some(session);
        }
        self.busy.store(false, Ordering::Release);
        self.session_live.store(true, Ordering::SeqCst);
    }

    /// Withdraw the session and wait until no period is using it.
    pub(crate) fn retire_session(&self) -> Option<Session> {
        self.session_live.store(false, Ordering::SeqCst);
        self.wait_quiescent();
        // Safety: not live and nothing in flight.
        unsafe { self.session.get_mut().take() }
    }

    pub(crate) fn has_session(&self) -> bool {
        self.session_live.load(Ordering::SeqCst)
    }

    fn wait_quiescent(&self) {
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            thread::sleep(Duration::from_micros(50));
        }
    }

    pub(crate) fn install_dispatcher(&self, dispatcher: DeferredDispatcher) {
        debug_assert!(!self.session_live.load(Ordering::SeqCst));
        self.wait_quiescent();
        // Safety: the dispatcher is only read during a live session.
        unsafe {
            *self.dispatcher.get_mut() = Some(dispatcher);
        }
    }

    pub(crate) fn take_dispatcher(&self) -> Option<DeferredDispatcher> {
        debug_assert!(!self.session_live.load(Ordering::SeqCst));
        self.wait_quiescent();
        self.deferred.store(false, Ordering::Release);
        // Safety: as above.
        unsafe { self.dispatcher.get_mut().take() }
    }

    pub fn has_dispatcher(&self) -> bool {
        // Safety: shared read; replaced only from the control thread.
        unsafe { self.dispatcher.get().is_some() }
    }

    pub fn set_render_silence(&self, silence: bool) {
        self.render_silence.store(silence, Ordering::Release);
    }

    pub fn render_silence(&self) -> bool {
        self.render_silence.load(Ordering::Acquire)
    }

    /// Silence state the realtime side last acted on.
    pub fn rendering_silence(&self) -> bool {
        self.rendering_silence.load(Ordering::Acquire)
    }

    pub(crate) fn reset_counters(&self, buffer_len: i64) {
        self.total_frames_written.store(0, Ordering::Release);
        self.stream_position_offset.store(buffer_len, Ordering::Release);
        self.buffer_index.store(0, Ordering::Release);
        self.rendering_silence.store(false, Ordering::Release);
        self.render_silence.store(false, Ordering::Release);
        self.deferred.store(false, Ordering::Release);
        self.requests.take();
    }

    pub(crate) fn reset_frames_written(&self) {
        self.total_frames_written.store(0, Ordering::Release);
    }

    pub fn total_frames_written(&self) -> i64 {
        self.total_frames_written.load(Ordering::Acquire)
    }

    pub fn stream_position_offset(&self) -> i64 {
        self.stream_position_offset.load(Ordering::Acquire)
    }

    pub fn buffer_index(&self) -> BufferIndex {
        self.buffer_index.load(Ordering::Acquire)
    }

    pub fn latency(&self) -> f64 {
        self.latency.load(Ordering::Acquire)
    }

    pub(crate) fn set_latency(&self, latency: f64) {
        self.latency.store(latency, Ordering::Release);
    }

    pub(crate) fn set_configured_rate(&self, sample_rate: u32) {
        self.configured_rate.store(sample_rate, Ordering::Release);
    }

    pub fn used_features(&self) -> AsioFeatures {
        AsioFeatures(self.used_features.peek())
    }

    pub(crate) fn take_requests(&self) -> AsioRequests {
        AsioRequests(self.requests.take())
    }

    pub fn deferred_processing(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    pub fn in_realtime_callback(&self) -> bool {
        self.realtime_thread.load(Ordering::Acquire) == current_thread_token()
    }

    /// Periods fully processed since creation.
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Relaxed)
    }

    /// Periods dropped because no session was live or a period was running.
    pub fn skipped_periods(&self) -> u64 {
        self.skipped_periods.load(Ordering::Relaxed)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Realtime side
    // ───────────────────────────────────────────────────────────────────────────

    fn enter(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(&self.in_flight);
        self.session_live.load(Ordering::SeqCst).then_some(guard)
    }

    /// Run `f`, containing any panic. Returns `default` after a panic.
    fn contain<T>(&self, func: &'static str, default: T, f: impl FnOnce() -> T) -> T {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => value,
            Err(e) => {
                log::error!("ASIO: {}: panic contained: {}", func, panic_message(&*e));
                default
            }
        }
    }

    fn dispatch_or_process(&self, period: Period) {
        let Some(_in_flight) = self.enter() else {
            self.skipped_periods.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if self.deferred.load(Ordering::Acquire) {
            // Safety: the dispatcher is not replaced while a session is live.
            if let Some(dispatcher) = unsafe { self.dispatcher.get() } {
                if !dispatcher.dispatch(period) {
                    self.skipped_periods.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }
        self.process_period(period);
    }

    /// Deferred worker entry point.
    pub(crate) fn run_deferred(&self, period: Period) {
        self.contain("bufferSwitch", (), || self.process_period(period));
    }

    fn process_period(&self, period: Period) {
        let _thread = RealtimeThreadGuard::enter(&self.realtime_thread);
        let Some(_in_flight) = self.enter() else {
            self.skipped_periods.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(_busy) = BusyGuard::try_acquire(&self.busy) else {
            self.skipped_periods.fetch_add(1, Ordering::Relaxed);
            return;
        };
        // Safety: live session and the busy flag is held.
        let Some(session) = (unsafe { self.session.get_mut() }).as_mut() else {
            return;
        };

        self.buffer_index.store(period.index & 1, Ordering::Release);
        if session.use_hardware_timing {
            self.publish_time_info(session, period.time.as_ref());
        }

        let silence = self.render_silence.load(Ordering::Acquire);
        self.rendering_silence.store(silence, Ordering::Release);
        let len = session.buffer_len as i64;
        if silence {
            self.stream_position_offset.fetch_add(len, Ordering::AcqRel);
        }
        self.fill_buffers(session, period.index & 1, !silence);
        self.total_frames_written.fetch_add(len, Ordering::AcqRel);
        self.periods.fetch_add(1, Ordering::Relaxed);
    }

    fn publish_time_info(&self, session: &Session, time: Option<&DriverTime>) {
        let clock = StreamClock {
            total_frames_written: self.total_frames_written.load(Ordering::Acquire),
            stream_position_offset: self.stream_position_offset.load(Ordering::Acquire),
            buffer_len: session.buffer_len as i64,
            sample_rate: session.sample_rate,
            latency: self.latency(),
        };
        let info = synchronize(time, &clock, || self.source.reference_clock_now_ns());
        self.source.set_time_info(&info);
    }

    fn fill_buffers(&self, session: &mut Session, index: BufferIndex, use_source: bool) {
        let Session {
            driver,
            buffer_len,
            input_channels,
            output_channels,
            bindings,
            buffers,
            can_output_ready,
            ..
        } = session;
        let layout = PeriodLayout {
            index,
            frames: *buffer_len,
            inputs: *input_channels,
            outputs: *output_channels,
            use_source,
        };
        match buffers.format() {
            Some(SampleFormat::Int16) => self.render(&mut buffers.int16, bindings, &layout),
            Some(SampleFormat::Int24) => self.render(&mut buffers.int24, bindings, &layout),
            Some(SampleFormat::Int32) => self.render(&mut buffers.int32, bindings, &layout),
            Some(SampleFormat::Float32) => self.render(&mut buffers.float32, bindings, &layout),
            Some(SampleFormat::Float64) => self.render(&mut buffers.float64, bindings, &layout),
            None => {}
        }
        if *can_output_ready {
            // nothing to do about a failure here beyond logging it
            let _ = self.faults.call("outputReady", || driver.output_ready());
        }
    }

    fn render<S: WorkingSample>(
        &self,
        pair: &mut SampleBufferPair<S>,
        bindings: &[ChannelBinding],
        layout: &PeriodLayout,
    ) {
        let PeriodLayout {
            index,
            frames,
            inputs,
            outputs,
            use_source,
        } = *layout;

        if use_source {
            self.source.read_prepare(frames, frames);
        }
        for (channel, binding) in bindings[..inputs].iter().enumerate() {
            // Safety: the driver does not touch the active half during the switch.
            let src = unsafe { binding.half(index).bytes_mut() };
            convert_from_hw(&mut pair.input, channel, inputs, binding.sample_type, src, frames);
        }
        if use_source {
            let input = (!pair.input.is_empty()).then(|| S::interleaved(&pair.input));
            self.source.read(S::interleaved_mut(&mut pair.output), input, frames);
            self.source.read_done();
        } else {
            pair.output.fill(S::default());
        }
        for (channel, binding) in bindings[inputs..].iter().enumerate() {
            // Safety: as above.
            let dst = unsafe { binding.half(index).bytes_mut() };
            convert_to_hw(dst, binding.sample_type, &pair.output, channel, outputs, frames);
        }
    }

    fn handle_message(&self, message: DriverMessage) -> i32 {
        let events = self.faults.events();
        match message.selector {
            selector::SELECTOR_SUPPORTED => {
                i32::from(SUPPORTED_SELECTORS.contains(&message.value))
            }
            selector::ENGINE_VERSION => ENGINE_VERSION,
            selector::RESET_REQUEST => {
                self.used_features.set(AsioFeatures::RESET_REQUEST.0);
                events.request_reset();
                1
            }
            selector::BUFFER_SIZE_CHANGE => {
                // Unsupported. The driver should follow up with a reset request.
                self.used_features.set(AsioFeatures::BUFFER_SIZE_CHANGE.0);
                0
            }
            selector::RESYNC_REQUEST => {
                self.used_features.set(AsioFeatures::RESYNC_REQUEST.0);
                events.request_restart();
                1
            }
            selector::LATENCIES_CHANGED => {
                self.requests.set(AsioRequests::LATENCIES_CHANGED.0);
                1
            }
            selector::SUPPORTS_TIME_INFO => 1,
            selector::SUPPORTS_TIME_CODE => 0,
            selector::OVERLOAD => {
                self.used_features.set(AsioFeatures::OVERLOAD.0);
                0
            }
            selector::MMC_COMMAND => {
                log::debug!(
                    "ASIO: MMCCommand(value={}, opt={:?}) => result=0",
                    message.value,
                    message.opt
                );
                0
            }
            _ => {
                log::debug!(
                    "ASIO: AsioMessage(selector={}, value={}, opt={:?}) => result=0",
                    message.selector,
                    message.value,
                    message.opt
                );
                0
            }
        }
    }

    fn handle_sample_rate_change(&self, sample_rate: f64) {
        let configured = self.configured_rate.load(Ordering::Acquire);
        if configured == 0 || sample_rate.round() == configured as f64 {
            return;
        }
        self.used_features.set(AsioFeatures::SAMPLE_RATE_CHANGE.0);
        let configured = configured as f64;
        let low = configured * (1.0 - SAMPLE_RATE_TOLERANCE);
        let high = configured * (1.0 + SAMPLE_RATE_TOLERANCE);
        if (low..=high).contains(&sample_rate) {
            // unstable external clock
            return;
        }
        log::warn!(
            "ASIO: sampleRateDidChange({}) differs from configured {}, closing",
            sample_rate,
            configured
        );
        self.faults.events().request_close();
    }
}

#[derive(Debug, Clone, Copy)]
struct PeriodLayout {
    index: BufferIndex,
    frames: usize,
    inputs: usize,
    outputs: usize,
    use_source: bool,
}

impl DriverCallbacks for Realtime {
    fn buffer_switch(&self, index: BufferIndex, time: Option<&DriverTime>) {
        let period = Period {
            index,
            time: time.copied(),
        };
        self.contain("bufferSwitch", (), || self.dispatch_or_process(period));
    }

    fn sample_rate_did_change(&self, sample_rate: f64) {
        self.contain("sampleRateDidChange", (), || {
            self.handle_sample_rate_change(sample_rate)
        });
    }

    fn message(&self, message: DriverMessage) -> i32 {
        self.contain("asioMessage", 0, || self.handle_message(message))
    }

    fn request_deferred_processing(&self, deferred: bool) {
        let _thread = RealtimeThreadGuard::enter(&self.realtime_thread);
        if deferred {
            self.used_features.set(AsioFeatures::DEFERRED_PROCESS.0);
        }
        self.deferred.store(deferred, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Interleaved, InterleavedMut, NoEvents};
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        reads: AtomicUsize,
    }

    impl AudioSource for CountingSource {
        fn read_prepare(&self, _frames: usize, _latency_frames: usize) {}

        fn read(&self, output: InterleavedMut<'_>, _input: Option<Interleaved<'_>>, _frames: usize) {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let InterleavedMut::Float32(out) = output {
                out.fill(0.25);
            }
        }

        fn read_done(&self) {}
    }

    fn realtime() -> (Arc<Realtime>, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            reads: AtomicUsize::new(0),
        });
        let rt = Arc::new(Realtime::new("{test}", source.clone(), Arc::new(NoEvents)));
        (rt, source)
    }

    #[test]
    fn test_switch_without_session_is_skipped() {
        let (rt, source) = realtime();
        rt.buffer_switch(0, None);
        rt.buffer_switch(1, None);
        assert_eq!(rt.skipped_periods(), 2);
        assert_eq!(rt.periods(), 0);
        assert_eq!(source.reads.load(Ordering::SeqCst), 0);
        assert_eq!(rt.total_frames_written(), 0);
    }

    #[test]
    fn test_message_replies() {
        let (rt, _) = realtime();
        let msg = |selector, value| rt.message(DriverMessage::new(selector, value));
        assert_eq!(msg(selector::ENGINE_VERSION, 0), 2);
        assert_eq!(msg(selector::SUPPORTS_TIME_INFO, 0), 1);
        assert_eq!(msg(selector::SUPPORTS_TIME_CODE, 0), 0);
        assert_eq!(msg(selector::SELECTOR_SUPPORTED, selector::RESET_REQUEST), 1);
        assert_eq!(msg(selector::SELECTOR_SUPPORTED, selector::MMC_COMMAND), 0);
        assert_eq!(msg(selector::BUFFER_SIZE_CHANGE, 128), 0);
        assert_eq!(msg(selector::RESYNC_REQUEST, 0), 1);
        assert_eq!(msg(selector::MMC_COMMAND, 3), 0);
        assert_eq!(msg(1234, 0), 0);
        assert_eq!(
            rt.used_features(),
            AsioFeatures::BUFFER_SIZE_CHANGE | AsioFeatures::RESYNC_REQUEST
        );

        assert_eq!(msg(selector::LATENCIES_CHANGED, 0), 1);
        assert!(rt.take_requests().contains(AsioRequests::LATENCIES_CHANGED));
        assert!(rt.take_requests().is_empty());
    }

    #[test]
    fn test_sample_rate_tolerance() {
        let (rt, _) = realtime();
        rt.set_configured_rate(48000);
        rt.sample_rate_did_change(48000.2);
        assert!(rt.used_features().is_empty());
        rt.sample_rate_did_change(49000.0);
        assert!(rt.used_features().contains(AsioFeatures::SAMPLE_RATE_CHANGE));
    }

    #[test]
    fn test_deferred_request_flags() {
        let (rt, _) = realtime();
        rt.request_deferred_processing(true);
        assert!(rt.deferred_processing());
        assert!(rt.used_features().contains(AsioFeatures::DEFERRED_PROCESS));
        assert!(!rt.in_realtime_callback());
        rt.request_deferred_processing(false);
        assert!(!rt.deferred_processing());
    }

    #[test]
    fn test_thread_tokens_differ() {
        let here = current_thread_token();
        assert_eq!(here, current_thread_token());
        let there = thread::spawn(current_thread_token).join().expect("join");
        assert_ne!(here, there);
    }
}
