/*!
 * Thread Types
 * Control blocks, lifecycle states and errors for guest threads
 */

use crate::core::limits::GDI_TEB_BATCH_SIZE;
use crate::core::status::NtStatus;
use crate::core::types::{Address, SlotId};
use crate::memory::MemoryError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use thiserror::Error;

/// Thread operation result
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Thread lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    #[error("No free thread slot (capacity {capacity})")]
    ResourceExhausted { capacity: usize },

    #[error("Unknown thread slot: {0}")]
    InvalidSlot(SlotId),

    #[error("Invalid state transition for {slot}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        slot: SlotId,
        from: ThreadState,
        to: ThreadState,
    },

    #[error("Thread {0} has not exited")]
    StillRunning(SlotId),

    #[error("Host thread spawn failed: {0}")]
    Spawn(String),

    #[error("Thread {0} has no coordinator channel")]
    NoChannel(SlotId),

    #[error("Unknown async I/O request: {0}")]
    UnknownRequest(u32),

    #[error("Async I/O table full (capacity {capacity})")]
    AsyncIoExhausted { capacity: usize },

    #[error("Completion could not be posted: {0}")]
    Completion(NtStatus),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl From<&ThreadError> for NtStatus {
    fn from(err: &ThreadError) -> Self {
        match err {
            ThreadError::ResourceExhausted { .. } => NtStatus::TOO_MANY_THREADS,
            ThreadError::AsyncIoExhausted { .. } => NtStatus::NO_MEMORY,
            ThreadError::InvalidSlot(_) | ThreadError::UnknownRequest(_) => NtStatus::INVALID_HANDLE,
            ThreadError::InvalidStateTransition { .. } | ThreadError::StillRunning(_) => {
                NtStatus::INVALID_PARAMETER
            }
            ThreadError::Spawn(_) => NtStatus::NO_MEMORY,
            ThreadError::NoChannel(_) => NtStatus::PIPE_DISCONNECTED,
            ThreadError::Completion(status) => *status,
            ThreadError::Memory(err) => NtStatus::from(err),
        }
    }
}

/// Lifecycle of a guest thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ThreadState {
    Unborn = 0,
    /// Slot taken, control block initialized
    Allocated = 1,
    /// Host thread spawned, not yet executing guest code
    Started = 2,
    Running = 3,
    Exiting = 4,
    /// Slot returned to the arena
    Reclaimed = 5,
}

impl ThreadState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Unborn,
            1 => ThreadState::Allocated,
            2 => ThreadState::Started,
            3 => ThreadState::Running,
            4 => ThreadState::Exiting,
            _ => ThreadState::Reclaimed,
        }
    }

    /// Legal edges of the lifecycle
    pub fn can_transition_to(self, next: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, next),
            (Unborn, Allocated)
                | (Allocated, Started)
                | (Allocated, Reclaimed)
                | (Started, Running)
                | (Started, Exiting)
                | (Running, Exiting)
                | (Exiting, Reclaimed)
        )
    }

    /// Whether the slot may be freed from this state
    #[inline]
    pub fn is_reclaimable(self) -> bool {
        matches!(self, ThreadState::Allocated | ThreadState::Exiting)
    }
}

/// Sentinel for an absent list link
pub const NO_SLOT: u32 = u32::MAX;

/// Per-thread data embedded in the guest TEB
///
/// Lives in the GDI batch area so the signal handler can reach it from the
/// TEB address alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ThreadData {
    /// CPU-specific scratch area
    pub cpu_data: [u64; 16],
    /// Top of the kernel stack used for startup and syscalls
    pub kernel_stack: u64,
    pub request_fd: i32,
    pub reply_fd: i32,
    pub wait_fd: [i32; 2],
    pub pthread_id: u64,
    pub prev: u32,
    pub next: u32,
    /// Deferred start routine and argument
    pub start: u64,
    pub param: u64,
    /// Host recovery point, 0 when none is registered
    pub recovery: u64,
    /// Descriptor signalled when a user APC is queued
    pub apc_fd: i32,
    pub reserved: u32,
}

const _: () = assert!(std::mem::size_of::<ThreadData>() <= GDI_TEB_BATCH_SIZE);

impl ThreadData {
    /// Freshly zeroed block with no links and no descriptors
    pub const fn new() -> Self {
        Self {
            cpu_data: [0; 16],
            kernel_stack: 0,
            request_fd: -1,
            reply_fd: -1,
            wait_fd: [-1, -1],
            pthread_id: 0,
            prev: NO_SLOT,
            next: NO_SLOT,
            start: 0,
            param: 0,
            recovery: 0,
            apc_fd: -1,
            reserved: 0,
        }
    }
}

impl Default for ThreadData {
    fn default() -> Self {
        Self::new()
    }
}

/// Host code location a faulting host access resumes at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RecoveryPoint {
    pub ip: u64,
    pub sp: u64,
}

/// Deferred start of a guest thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStart {
    pub slot: SlotId,
    pub teb: Address,
    pub entry: u64,
    pub arg: u64,
    pub suspended: bool,
}

/// Lifecycle state shared between the table and the host thread
///
/// Lock-free so exit paths running on the signal stack can update it.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    exit_status: AtomicU32,
}

impl Lifecycle {
    pub(crate) fn new(state: ThreadState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            exit_status: AtomicU32::new(NtStatus::PENDING.raw()),
        }
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Move `from -> to`; fails if the edge is illegal or the state moved underneath
    pub(crate) fn transition(&self, slot: SlotId, from: ThreadState, to: ThreadState) -> ThreadResult<()> {
        if !from.can_transition_to(to) {
            return Err(ThreadError::InvalidStateTransition { slot, from, to });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| ThreadError::InvalidStateTransition {
                slot,
                from: ThreadState::from_raw(actual),
                to,
            })
    }

    /// Move to `Exiting` from whichever live state the thread is in
    pub(crate) fn mark_exiting(&self, status: NtStatus) {
        self.exit_status.store(status.raw(), Ordering::Release);
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let state = ThreadState::from_raw(raw);
            state
                .can_transition_to(ThreadState::Exiting)
                .then_some(ThreadState::Exiting as u8)
        });
    }

    pub fn exit_status(&self) -> Option<NtStatus> {
        (self.state() == ThreadState::Exiting || self.state() == ThreadState::Reclaimed)
            .then(|| NtStatus(self.exit_status.load(Ordering::Acquire)))
    }
}

/// Snapshot of one thread for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ThreadInfo {
    pub slot: SlotId,
    pub teb: Address,
    pub state: ThreadState,
    pub pid: u32,
    pub tid: u32,
    pub pending_io: usize,
}
