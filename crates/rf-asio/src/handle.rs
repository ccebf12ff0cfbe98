//! Driver handle: lifecycle of the connection to one driver instance

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::dispatcher::DeferredDispatcher;
use crate::driver::{AsioDriver, DriverRegistry};
use crate::error::{AsioError, AsioErrorKind, AsioResult, DriverError};
use crate::fault::{CrashGuardDriver, panic_message};
use crate::realtime::Realtime;
use crate::settings::EngineOptions;

/// Owns the driver instance and the deferred dispatcher attached to it.
///
/// `open_driver` and `close_driver` are idempotent; a failed open always
/// leaves the handle closed.
pub struct DriverHandle {
    registry: Arc<dyn DriverRegistry>,
    id: String,
    options: EngineOptions,
    realtime: Arc<Realtime>,
    driver: Option<Arc<dyn AsioDriver>>,
}

impl DriverHandle {
    pub fn new(
        registry: Arc<dyn DriverRegistry>,
        id: impl Into<String>,
        options: EngineOptions,
        realtime: Arc<Realtime>,
    ) -> Self {
        Self {
            registry,
            id: id.into(),
            options,
            realtime,
            driver: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn is_driver_open(&self) -> bool {
        self.driver.is_some()
    }

    #[inline]
    pub fn driver(&self) -> Option<&Arc<dyn AsioDriver>> {
        self.driver.as_ref()
    }

    pub fn open_driver(&mut self) -> AsioResult<()> {
        if self.is_driver_open() {
            return Ok(());
        }
        if self.options.allow_deferred_processing {
            let weak = Arc::downgrade(&self.realtime);
            let dispatcher = DeferredDispatcher::spawn(move |period| {
                if let Some(realtime) = weak.upgrade() {
                    realtime.run_deferred(period);
                }
            })
            .map_err(|e| AsioError::new(AsioErrorKind::Other, "openDriver", e.to_string()))?;
            self.realtime.install_dispatcher(dispatcher);
        }

        let faults = self.realtime.faults();
        let instantiated = faults.call("openDriver", || {
            if self.options.mask_driver_crashes {
                CrashGuardDriver::instantiate(self.registry.as_ref(), &self.id)
                    .map(|driver| Arc::new(driver) as Arc<dyn AsioDriver>)
            } else {
                self.registry.instantiate(&self.id).map(Arc::from)
            }
        });
        let driver = match instantiated {
            Ok(driver) => driver,
            Err(err) => {
                drop(self.realtime.take_dispatcher());
                return Err(err);
            }
        };
        self.driver = Some(Arc::clone(&driver));

        let identity = faults.call("openDriver", || {
            Ok((
                driver.driver_name()?,
                driver.driver_version()?,
                driver.error_message()?,
            ))
        });
        match identity {
            Ok((name, version, message)) => {
                log::info!(
                    "ASIO: Opened driver {} Version 0x{:08X}: {}",
                    name,
                    version,
                    message
                );
                Ok(())
            }
            Err(err) => {
                self.close_driver();
                Err(err)
            }
        }
    }

    /// Release the driver. Never fails; a panic during release is logged.
    pub fn close_driver(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        let released = panic::catch_unwind(AssertUnwindSafe(move || drop(driver)));
        if let Err(e) = released {
            log::error!("ASIO: closeDriver: panic during release: {}", panic_message(&*e));
            self.realtime
                .faults()
                .handle("closeDriver", &DriverError::Crash { func: "release" });
        }
        drop(self.realtime.take_dispatcher());
        log::debug!("ASIO: closeDriver('{}')", self.id);
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.close_driver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConfig, MockFault, MockRegistry, SilentSource};
    use crate::source::NoEvents;

    fn handle(registry: &MockRegistry, options: EngineOptions) -> DriverHandle {
        let realtime = Arc::new(Realtime::new(
            "{mock}",
            Arc::new(SilentSource),
            Arc::new(NoEvents),
        ));
        DriverHandle::new(Arc::new(registry.clone()), "{mock}", options, realtime)
    }

    #[test]
    fn test_open_close_idempotent() {
        let registry = MockRegistry::with_driver("{mock}", MockConfig::default());
        let mut h = handle(&registry, EngineOptions::default());
        assert!(!h.is_driver_open());
        h.close_driver();
        assert!(h.open_driver().is_ok());
        assert!(h.open_driver().is_ok());
        assert!(h.is_driver_open());
        assert_eq!(registry.instantiations(), 1);
        h.close_driver();
        h.close_driver();
        assert!(!h.is_driver_open());
    }

    #[test]
    fn test_dispatcher_follows_driver() {
        let registry = MockRegistry::with_driver("{mock}", MockConfig::default());
        let mut h = handle(&registry, EngineOptions::default());
        h.open_driver().expect("open");
        assert!(h.realtime.has_dispatcher());
        h.close_driver();
        assert!(!h.realtime.has_dispatcher());

        let options = EngineOptions {
            allow_deferred_processing: false,
            ..Default::default()
        };
        let mut h = handle(&registry, options);
        h.open_driver().expect("open");
        assert!(!h.realtime.has_dispatcher());
    }

    #[test]
    fn test_unknown_driver_fails_closed() {
        let registry = MockRegistry::default();
        let mut h = handle(&registry, EngineOptions::default());
        let err = h.open_driver().expect_err("no such driver");
        assert_eq!(err.kind, AsioErrorKind::DriverLoad);
        assert!(!h.is_driver_open());
        assert!(!h.realtime.has_dispatcher());
    }

    #[test]
    fn test_crash_while_identifying_closes() {
        let registry = MockRegistry::with_driver("{mock}", MockConfig::default());
        registry.driver("{mock}").expect("mock").inject_fault("getDriverName", MockFault::Panic);
        let mut h = handle(&registry, EngineOptions::default());
        let err = h.open_driver().expect_err("crash");
        assert!(err.is_crash());
        assert!(!h.is_driver_open());
    }
}
