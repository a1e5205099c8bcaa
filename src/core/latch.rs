/*!
 * Process Lifecycle Latch
 *
 * One-way `Running → Exiting → Terminated` switch consulted by every
 * lock-acquisition wrapper in the runtime.
 *
 * # Relaxed Window
 *
 * Once the latch leaves `Running`, `LatchedMutex::lock` no longer touches
 * the underlying mutex. Host threads may already have been torn down by the
 * runtime shutdown while holding it, and blocking on it would deadlock the
 * exit sequence. Mutual exclusion is therefore NOT guaranteed during the
 * terminal phase; only the exiting thread is expected to touch latched
 * structures at that point.
 */

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Process lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessPhase {
    Running = 0,
    Exiting = 1,
    Terminated = 2,
}

impl ProcessPhase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ProcessPhase::Running,
            1 => ProcessPhase::Exiting,
            _ => ProcessPhase::Terminated,
        }
    }
}

/// Monotonic tri-state latch
#[derive(Debug)]
pub struct ProcessLatch {
    phase: AtomicU8,
}

impl ProcessLatch {
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(ProcessPhase::Running as u8),
        }
    }

    #[inline]
    pub fn phase(&self) -> ProcessPhase {
        ProcessPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// True once the terminal exit sequence has begun
    #[inline(always)]
    pub fn is_exiting(&self) -> bool {
        self.phase.load(Ordering::Acquire) != ProcessPhase::Running as u8
    }

    /// Move to `Exiting`; returns true for the caller that won the transition
    pub fn begin_exit(&self) -> bool {
        self.phase
            .compare_exchange(
                ProcessPhase::Running as u8,
                ProcessPhase::Exiting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Terminated`; never goes backwards
    pub fn terminate(&self) {
        self.phase
            .fetch_max(ProcessPhase::Terminated as u8, Ordering::AcqRel);
    }
}

impl Default for ProcessLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutex whose lock and unlock become no-ops once the latch is set
pub struct LatchedMutex<T> {
    raw: RawMutex,
    latch: Arc<ProcessLatch>,
    data: UnsafeCell<T>,
}

// SAFETY: access is serialized by `raw` while the latch is `Running`. After
// that the relaxed window documented at module level applies.
unsafe impl<T: Send> Send for LatchedMutex<T> {}
unsafe impl<T: Send> Sync for LatchedMutex<T> {}

impl<T> LatchedMutex<T> {
    pub fn new(value: T, latch: Arc<ProcessLatch>) -> Self {
        Self {
            raw: RawMutex::INIT,
            latch,
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> LatchedGuard<'_, T> {
        let held = if self.latch.is_exiting() {
            false
        } else {
            self.raw.lock();
            true
        };
        LatchedGuard { mutex: self, held }
    }

    /// Non-blocking acquisition, for paths that must not wait
    pub fn try_lock(&self) -> Option<LatchedGuard<'_, T>> {
        if self.latch.is_exiting() {
            return Some(LatchedGuard {
                mutex: self,
                held: false,
            });
        }
        if self.raw.try_lock() {
            Some(LatchedGuard {
                mutex: self,
                held: true,
            })
        } else {
            None
        }
    }

    pub fn latch(&self) -> &Arc<ProcessLatch> {
        &self.latch
    }
}

/// Guard returned by [`LatchedMutex::lock`]
pub struct LatchedGuard<'a, T> {
    mutex: &'a LatchedMutex<T>,
    held: bool,
}

impl<T> LatchedGuard<'_, T> {
    /// Whether the underlying mutex is actually held
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl<T> Deref for LatchedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: see `LatchedMutex` Sync impl
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for LatchedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `LatchedMutex` Sync impl
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for LatchedGuard<'_, T> {
    fn drop(&mut self) {
        if self.held {
            // SAFETY: we acquired `raw` in `lock`/`try_lock`
            unsafe { self.mutex.raw.unlock() };
        }
    }
}
