//! A reference count that can be drained.
//!
//! Mirrors the kernel's `EX_RUNDOWN_REF`: callers [`acquire`] protection
//! before touching an object, and the teardown path calls
//! [`wait_for_release`] to stop new acquisitions and wait for the
//! outstanding ones to be released.
//!
//! [`acquire`]: RundownRef::acquire
//! [`wait_for_release`]: RundownRef::wait_for_release
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

// During tests, allow importing std
#[cfg(any(feature = "std", test))]
extern crate std;

use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// Set once rundown has begun
const RUNDOWN_ACTIVE: usize = 0b1;
/// Each acquisition adds one of these
const COUNT_INCREMENT: usize = 0b10;

/// Rundown protection for a single object
pub struct RundownRef {
    /// Invariant: bit 0 is [`RUNDOWN_ACTIVE`], the remaining bits are the
    /// number of outstanding acquisitions.
    ///
    /// Keeping both in one word means an `acquire` can never slip past
    /// the rundown bit.
    state: CachePadded<AtomicUsize>,
}

impl core::fmt::Debug for RundownRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RundownRef")
            .field("active_count", &self.active_count())
            .field("running_down", &self.is_running_down())
            .finish()
    }
}

impl Default for RundownRef {
    fn default() -> Self {
        Self::new()
    }
}

impl RundownRef {
    /// Creates rundown protection in the usable (not running down) state
    pub const fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the protection usable again after a completed rundown.
    ///
    /// Must only be called once [`RundownRef::wait_for_release`] has
    /// returned, i.e. when nobody can be holding protection.
    pub fn reinitialize(&self) {
        debug_assert!(
            self.is_completed(),
            "reinitialize called before rundown completed"
        );

        // Release so that the next successful `acquire` observes everything
        // the teardown path did before reopening
        self.state.store(0, Ordering::Release);
    }

    /// Tries to acquire rundown protection.
    ///
    /// Returns `None` once rundown has started. Callers must treat that as
    /// the object being gone rather than retrying.
    ///
    /// ## Examples
    ///
    /// ```rust
    ///# use rundown_ref::RundownRef;
    /// let rundown = RundownRef::new();
    ///
    /// let guard = rundown.acquire();
    /// assert!(guard.is_some());
    /// ```
    #[must_use]
    pub fn acquire(&self) -> Option<RundownGuard<'_>> {
        // Lazily, since dropping a guard releases protection
        self.acquire_raw().then(|| RundownGuard { rundown: self })
    }

    /// Acquires protection without producing a guard.
    ///
    /// Every `true` returned must be paired with exactly one
    /// [`RundownRef::release_raw`].
    pub fn acquire_raw(&self) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);

        loop {
            if current & RUNDOWN_ACTIVE != 0 {
                return false;
            }

            let Some(next) = current.checked_add(COUNT_INCREMENT) else {
                // Too many outstanding holders, treat like a failed acquire
                return false;
            };

            // Acquire on success so the protected object is visible to us
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases protection taken with [`RundownRef::acquire_raw`] or
    /// leaked with [`RundownGuard::forget`].
    ///
    /// ## Safety
    ///
    /// Must be paired 1:1 with a successful acquisition. An unpaired release
    /// lets the teardown path proceed while another holder still uses the
    /// protected object.
    pub unsafe fn release_raw(&self) {
        // Release so that the teardown path sees all of our accesses
        let previous = self.state.fetch_sub(COUNT_INCREMENT, Ordering::Release);
        debug_assert!(previous >= COUNT_INCREMENT, "unpaired rundown release");
    }

    /// Begins rundown and blocks until every outstanding acquisition has
    /// been released.
    ///
    /// Calling this again after completion returns immediately.
    ///
    /// ## IRQL: Passive
    pub fn wait_for_release(&self) {
        self.begin_rundown();

        let backoff = Backoff::new();
        // Acquire pairs with the `Release` in `release_raw`
        while self.state.load(Ordering::Acquire) != RUNDOWN_ACTIVE {
            backoff.snooze();
        }
    }

    /// Stops new acquisitions without waiting for existing ones to drain.
    ///
    /// Returns `true` if this call started the rundown.
    pub fn begin_rundown(&self) -> bool {
        self.state.fetch_or(RUNDOWN_ACTIVE, Ordering::AcqRel) & RUNDOWN_ACTIVE == 0
    }

    /// If rundown has started, successfully or not
    pub fn is_running_down(&self) -> bool {
        self.state.load(Ordering::Acquire) & RUNDOWN_ACTIVE != 0
    }

    /// If rundown has started and every holder has released
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNDOWN_ACTIVE
    }

    /// Number of currently outstanding acquisitions (best effort)
    pub fn active_count(&self) -> usize {
        self.state.load(Ordering::Relaxed) / COUNT_INCREMENT
    }
}

/// Holds rundown protection until dropped
#[must_use = "protection is released as soon as the guard is dropped"]
pub struct RundownGuard<'a> {
    rundown: &'a RundownRef,
}

impl<'a> RundownGuard<'a> {
    /// Leaks the guard, keeping protection held.
    ///
    /// The protection must later be released with [`RundownRef::release_raw`].
    pub fn forget(self) {
        core::mem::forget(self)
    }

    /// The rundown protection this guard holds
    pub fn rundown(&self) -> &'a RundownRef {
        self.rundown
    }
}

impl<'a> Drop for RundownGuard<'a> {
    fn drop(&mut self) {
        // SAFETY: A guard only exists for a successful acquisition,
        // and is only dropped once.
        unsafe { self.rundown.release_raw() }
    }
}

impl<'a> core::fmt::Debug for RundownGuard<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RundownGuard").finish_non_exhaustive()
    }
}
