//! Fault containment for calls into driver code
//!
//! Driver code is untrusted. A panic inside it is this crate's rendition of a
//! driver crash: [`CrashGuardDriver`] converts it into
//! [`DriverError::Crash`], and [`FaultContext`] classifies every failure,
//! logs it at the severity its kind deserves and marks the process tainted
//! after a crash.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::driver::{
    AsioBufferSizes, AsioChannelInfo, AsioDriver, BufferInfo, Channels, DriverCallbacks,
    DriverRegistry, DriverResult, Latencies,
};
use crate::error::{AsioError, AsioErrorKind, DriverError};
use crate::source::{DeviceEvents, MessageLevel};

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESS TAINT
// ═══════════════════════════════════════════════════════════════════════════════

static PROCESS_TAINTED: AtomicBool = AtomicBool::new(false);

/// Record that driver code crashed inside this process. Informational only.
pub fn taint_process() {
    PROCESS_TAINTED.store(true, Ordering::Release);
}

pub fn process_tainted() -> bool {
    PROCESS_TAINTED.load(Ordering::Acquire)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Run a driver call, turning a panic into [`DriverError::Crash`].
macro_rules! driver_panic_guard {
    ($func:expr, $body:expr) => {
        match panic::catch_unwind(AssertUnwindSafe(|| $body)) {
            Ok(result) => result,
            Err(e) => {
                log::error!("ASIO: {}: driver panic caught: {}", $func, panic_message(&*e));
                Err(DriverError::Crash { func: $func })
            }
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// CRASH GUARD
// ═══════════════════════════════════════════════════════════════════════════════

/// Driver adapter that contains panics raised by the wrapped driver.
pub struct CrashGuardDriver {
    inner: Box<dyn AsioDriver>,
}

impl CrashGuardDriver {
    pub fn new(inner: Box<dyn AsioDriver>) -> Self {
        Self { inner }
    }

    /// Instantiate `id` with construction itself under the guard.
    pub fn instantiate(registry: &dyn DriverRegistry, id: &str) -> DriverResult<Self> {
        let inner = driver_panic_guard!("instantiate", registry.instantiate(id))?;
        Ok(Self::new(inner))
    }
}

impl AsioDriver for CrashGuardDriver {
    fn driver_name(&self) -> DriverResult<String> {
        driver_panic_guard!("getDriverName", self.inner.driver_name())
    }

    fn driver_version(&self) -> DriverResult<i32> {
        driver_panic_guard!("getDriverVersion", self.inner.driver_version())
    }

    fn error_message(&self) -> DriverResult<String> {
        driver_panic_guard!("getErrorMessage", self.inner.error_message())
    }

    fn channels(&self) -> DriverResult<Channels> {
        driver_panic_guard!("getChannels", self.inner.channels())
    }

    fn latencies(&self) -> DriverResult<Latencies> {
        driver_panic_guard!("getLatencies", self.inner.latencies())
    }

    fn buffer_sizes(&self) -> DriverResult<AsioBufferSizes> {
        driver_panic_guard!("getBufferSize", self.inner.buffer_sizes())
    }

    fn can_sample_rate(&self, sample_rate: f64) -> DriverResult<bool> {
        driver_panic_guard!("canSampleRate", self.inner.can_sample_rate(sample_rate))
    }

    fn sample_rate(&self) -> DriverResult<f64> {
        driver_panic_guard!("getSampleRate", self.inner.sample_rate())
    }

    fn set_sample_rate(&self, sample_rate: f64) -> DriverResult<()> {
        driver_panic_guard!("setSampleRate", self.inner.set_sample_rate(sample_rate))
    }

    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<AsioChannelInfo> {
        driver_panic_guard!("getChannelInfo", self.inner.channel_info(channel, is_input))
    }

    fn create_buffers(
        &self,
        infos: &mut [BufferInfo],
        frames: i32,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> DriverResult<()> {
        driver_panic_guard!(
            "createBuffers",
            self.inner.create_buffers(infos, frames, callbacks)
        )
    }

    fn dispose_buffers(&self) -> DriverResult<()> {
        driver_panic_guard!("disposeBuffers", self.inner.dispose_buffers())
    }

    fn start(&self) -> DriverResult<()> {
        driver_panic_guard!("start", self.inner.start())
    }

    fn stop(&self) -> DriverResult<()> {
        driver_panic_guard!("stop", self.inner.stop())
    }

    fn can_output_ready(&self) -> DriverResult<bool> {
        driver_panic_guard!("canOutputReady", self.inner.can_output_ready())
    }

    fn output_ready(&self) -> DriverResult<()> {
        driver_panic_guard!("outputReady", self.inner.output_ready())
    }

    fn control_panel(&self) -> DriverResult<()> {
        driver_panic_guard!("controlPanel", self.inner.control_panel())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAULT CLASSIFICATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-device fault handler.
pub struct FaultContext {
    description: String,
    events: Arc<dyn DeviceEvents>,
}

impl FaultContext {
    pub fn new(device_id: &str, events: Arc<dyn DeviceEvents>) -> Self {
        Self {
            description: format!("ASIO Driver: {device_id}"),
            events,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn events(&self) -> &Arc<dyn DeviceEvents> {
        &self.events
    }

    /// Run one driver call on behalf of `func`, classifying a failure.
    #[inline]
    pub fn call<T>(
        &self,
        func: &'static str,
        f: impl FnOnce() -> DriverResult<T>,
    ) -> Result<T, AsioError> {
        f().map_err(|err| self.handle(func, &err))
    }

    /// Like [`call`](Self::call), but a panic is contained even when the
    /// driver is not wrapped in [`CrashGuardDriver`]. Used on paths that
    /// release resources and must run to the end.
    pub fn call_guarded<T>(
        &self,
        func: &'static str,
        f: impl FnOnce() -> DriverResult<T>,
    ) -> Result<T, AsioError> {
        driver_panic_guard!(func, f()).map_err(|err| self.handle(func, &err))
    }

    /// Log `err` by kind and convert it. A crash taints the process and is
    /// reported to the user.
    pub fn handle(&self, func: &'static str, err: &DriverError) -> AsioError {
        match err {
            DriverError::Crash { func: crashed } => {
                taint_process();
                log::error!(
                    "ASIO: {}: Driver Crash: {}! ({})",
                    func,
                    crashed,
                    self.description
                );
                self.events.device_message(
                    MessageLevel::Error,
                    &format!("ASIO Driver Crash: {crashed}"),
                );
            }
            DriverError::OutOfMemory => {
                log::error!("ASIO: {}: Out of memory", func);
            }
            DriverError::LoadFailed(msg) => {
                log::debug!("ASIO: {}: Driver Load: {}", func, msg);
            }
            DriverError::InitFailed(msg) => {
                log::debug!("ASIO: {}: Driver Init: {}", func, msg);
            }
            DriverError::Protocol { .. } => {
                log::debug!("ASIO: {}: Error: {}", func, err);
            }
            DriverError::Other(msg) => {
                log::debug!("ASIO: {}: Exception: {}", func, msg);
            }
        }
        AsioError::from_driver(func, err)
    }

    /// Internal state disagreement. Logged, execution continues.
    pub fn consistency_fault(&self, func: &'static str, message: &str) -> AsioError {
        log::warn!("ASIO: {}: consistency fault: {}", func, message);
        AsioError::new(AsioErrorKind::ConsistencyFault, func, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConfig, MockDriver, MockFault};
    use crate::source::NoEvents;

    #[test]
    fn test_crash_guard_converts_panic() {
        let mock = MockDriver::new(MockConfig::default());
        mock.inject_fault("getChannels", MockFault::Panic);
        let guarded = CrashGuardDriver::new(Box::new(mock.clone()));
        assert_eq!(
            guarded.channels(),
            Err(DriverError::Crash { func: "getChannels" })
        );
        // other calls are unaffected
        assert!(guarded.buffer_sizes().is_ok());
    }

    #[test]
    fn test_classification_taints_on_crash() {
        let faults = FaultContext::new("{mock}", Arc::new(NoEvents));
        assert_eq!(faults.description(), "ASIO Driver: {mock}");

        let err = faults.call::<()>("start", || Err(DriverError::not_present("gone")));
        assert_eq!(err.map_err(|e| e.kind), Err(AsioErrorKind::Protocol));

        let err = faults.call::<()>("stop", || Err(DriverError::Crash { func: "stop" }));
        assert!(err.is_err_and(|e| e.is_crash()));
        assert!(process_tainted());

        let ok = faults.call("getSampleRate", || Ok(48000.0));
        assert_eq!(ok, Ok(48000.0));
    }

    #[test]
    fn test_call_guarded_contains_panic() {
        let faults = FaultContext::new("{mock}", Arc::new(NoEvents));
        let err = faults
            .call_guarded("stop", || -> DriverResult<()> { panic!("driver died") })
            .expect_err("crash");
        assert!(err.is_crash());
        assert!(process_tainted());
        assert_eq!(faults.call_guarded("stop", || Ok(7)).ok(), Some(7));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
