//! Deferred buffer-switch dispatcher
//!
//! Some drivers call back on a thread that must not block. When such a driver
//! requests deferred processing, each buffer switch is handed through a
//! single-slot queue to a dedicated worker that runs the period instead.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::driver::{BufferIndex, DriverTime};
use crate::rt_cell::RtCell;

/// One buffer period handed to the worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Period {
    pub index: BufferIndex,
    pub time: Option<DriverTime>,
}

struct DispatchShared {
    shutdown: AtomicBool,
    dispatched: AtomicU64,
    overruns: AtomicU64,
}

/// Single-producer handoff to one worker thread.
pub struct DeferredDispatcher {
    producer: RtCell<Producer<Period>>,
    pushing: AtomicBool,
    shared: Arc<DispatchShared>,
    worker: Option<JoinHandle<()>>,
}

impl DeferredDispatcher {
    /// Spawn the worker. `handler` runs once per dispatched period.
    pub fn spawn<F>(handler: F) -> io::Result<Self>
    where
        F: FnMut(Period) + Send + 'static,
    {
        let (producer, consumer) = RingBuffer::<Period>::new(1);
        let shared = Arc::new(DispatchShared {
            shutdown: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("asio-deferred".into())
            .spawn(move || run_worker(consumer, worker_shared, handler))?;
        Ok(Self {
            producer: RtCell::new(producer),
            pushing: AtomicBool::new(false),
            shared,
            worker: Some(worker),
        })
    }

    /// Hand `period` to the worker. Returns `false` and counts an overrun when
    /// the previous period is still queued.
    pub fn dispatch(&self, period: Period) -> bool {
        if self
            .pushing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Safety: the pushing flag makes this the only producer access.
        let pushed = unsafe { self.producer.get_mut() }.push(period).is_ok();
        self.pushing.store(false, Ordering::Release);

        if pushed {
            self.shared.dispatched.fetch_add(1, Ordering::Relaxed);
            if let Some(worker) = &self.worker {
                worker.thread().unpark();
            }
        } else {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }

    pub fn dispatched(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}

fn run_worker<F>(mut consumer: Consumer<Period>, shared: Arc<DispatchShared>, mut handler: F)
where
    F: FnMut(Period),
{
    log::debug!("ASIO: deferred dispatcher started");
    loop {
        while let Ok(period) = consumer.pop() {
            handler(period);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        thread::park();
    }
    log::debug!("ASIO: deferred dispatcher stopped");
}

impl Drop for DeferredDispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.thread().id() == thread::current().id() {
                // dropped from inside the handler; the loop exits on its own
                return;
            }
            if worker.join().is_err() {
                log::error!("ASIO: deferred dispatcher worker panicked");
            }
        }
    }
}
