//! Cell for state owned by whichever thread currently holds the session

use std::cell::UnsafeCell;

/// Interior-mutable slot shared between the control thread and the realtime
/// thread without a lock.
///
/// Exclusivity is established by the session protocol in `realtime.rs`: the
/// control thread touches the contents only while no session is live and no
/// callback is in flight, the realtime thread only while holding the busy
/// flag of a live session.
pub(crate) struct RtCell<T>(UnsafeCell<T>);

// Safety: access is serialised by the protocol above.
unsafe impl<T: Send> Sync for RtCell<T> {}

impl<T> RtCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    ///
    /// No `get_mut` borrow may be alive for the lifetime of the returned
    /// reference.
    #[inline]
    pub(crate) unsafe fn get(&self) -> &T {
        unsafe { &*self.0.get() }
    }

    /// # Safety
    ///
    /// The caller must hold exclusive access under the session protocol for
    /// the lifetime of the returned reference.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }
}
