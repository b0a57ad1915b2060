//! Synchronization primitives used by the framework

use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

/// A spin-lock based mutex protecting some data.
///
/// Held only for short state updates; module callbacks are never invoked
/// while one of these is locked.
pub type SpinMutex<T> = lock_api::Mutex<RawSpinLock, T>;

pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// Raw spin lock backing [`SpinMutex`].
///
/// In a KMDF build this role is played by a framework spin lock, which also
/// raises the IRQL to `DISPATCH_LEVEL` while held.
pub struct RawSpinLock {
    locked: AtomicBool,
}

// SAFETY: `locked` is only set by a successful compare exchange, so only one
// holder can exist at a time, and `unlock` is only called by that holder.
unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        let backoff = Backoff::new();
        while !self.try_lock() {
            // Wait for the lock to look free before trying again
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// The maximum IRQL a Module's callbacks and Methods are invoked at
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ExecutionLevel {
    /// Callbacks may run at IRQL <= `DISPATCH_LEVEL`, and must not block
    #[default]
    Dispatch,
    /// Callbacks always run at `PASSIVE_LEVEL`, and may block or touch paged memory
    Passive,
}

impl ExecutionLevel {
    /// If callbacks at this level are allowed to block
    pub fn may_block(self) -> bool {
        matches!(self, Self::Passive)
    }
}
