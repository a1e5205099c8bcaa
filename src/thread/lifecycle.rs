/*!
 * Thread Lifecycle
 *
 * Allocation, start, resume, join and teardown of guest threads. Every
 * guest thread is a 1:1 host thread whose first guest instruction runs
 * through the registered [`ThreadLauncher`].
 */

use super::async_io::IoArena;
use super::table::{EmbeddedData, ThreadTable};
use super::types::{
    Lifecycle, RecoveryPoint, ThreadData, ThreadError, ThreadInfo, ThreadResult, ThreadStart,
    ThreadState, NO_SLOT,
};
use crate::core::latch::{LatchedMutex, ProcessLatch};
use crate::core::status::NtStatus;
use crate::core::types::{Address, SlotId};
use crate::ipc::SessionClient;
use crate::memory::{AddressSpace, MemoryError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::Cell;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::thread::JoinHandleExt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Runs the first guest instruction of a new thread
#[cfg_attr(test, mockall::automock)]
pub trait ThreadLauncher: Send + Sync {
    /// Execute the thread and return its exit status
    fn start_thread(&self, start: ThreadStart) -> NtStatus;
}

thread_local! {
    static CURRENT_TEB: Cell<Address> = const { Cell::new(0) };
    static CURRENT_EXIT: Cell<*const ExitSignal> = const { Cell::new(std::ptr::null()) };
}

/// TEB of the calling guest thread
#[inline]
pub fn current_teb() -> Option<Address> {
    let teb = CURRENT_TEB.with(Cell::get);
    (teb != 0).then_some(teb)
}

fn current_embedded() -> Option<EmbeddedData> {
    // SAFETY: CURRENT_TEB is only set while the thread owns its TEB
    current_teb().map(|teb| unsafe { EmbeddedData::of(teb) })
}

/// Snapshot of the calling guest thread's embedded data
pub fn current_thread_data() -> Option<ThreadData> {
    current_embedded().map(EmbeddedData::snapshot)
}

/// Recovery point registered by host code on the calling thread
pub fn current_recovery_point() -> Option<RecoveryPoint> {
    let recovery = current_embedded()?.recovery();
    if recovery == 0 {
        return None;
    }
    // SAFETY: registered through `RecoveryGuard`, which outlives the registration
    Some(unsafe { *(recovery as *const RecoveryPoint) })
}

pub(crate) fn set_current_teb(teb: Address) {
    CURRENT_TEB.with(|cell| cell.set(teb));
}

/// Record the exit of the calling guest thread
///
/// Async-signal-safe; returns false when the caller is not a guest thread.
pub fn post_current_exit(status: NtStatus) -> bool {
    let exit = CURRENT_EXIT.with(Cell::get);
    if exit.is_null() {
        return false;
    }
    // SAFETY: the pointer is installed by the thread body, which keeps the Arc alive
    unsafe { (*exit).post(status) };
    true
}

/// Registers a host recovery point for the calling thread while alive
pub struct RecoveryGuard {
    point: Box<RecoveryPoint>,
}

impl RecoveryGuard {
    pub fn register(point: RecoveryPoint) -> Option<Self> {
        let data = current_embedded()?;
        let point = Box::new(point);
        data.set_recovery(point.as_ref() as *const RecoveryPoint as u64);
        Some(Self { point })
    }

    pub fn point(&self) -> &RecoveryPoint {
        &self.point
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        if let Some(data) = current_embedded() {
            data.set_recovery(0);
        }
    }
}

/// Exit notification written by the exiting thread, read by `join`
///
/// Posting only reports the guest exit status. The host thread may still be
/// running on its TEB and signal stack until its [`JoinHandle`] completes.
struct ExitSignal {
    lifecycle: Arc<Lifecycle>,
    tx: UnixStream,
}

impl ExitSignal {
    fn post(&self, status: NtStatus) {
        self.lifecycle.mark_exiting(status);
        let bytes = status.raw().to_le_bytes();
        // SAFETY: plain write(2) on an owned socket, async-signal-safe
        unsafe {
            libc::write(self.tx.as_raw_fd(), bytes.as_ptr().cast(), bytes.len());
        }
    }
}

#[derive(Default)]
struct ResumeGate {
    resumed: Mutex<bool>,
    cond: Condvar,
}

impl ResumeGate {
    fn wait(&self) {
        let mut resumed = self.resumed.lock();
        while !*resumed {
            self.cond.wait(&mut resumed);
        }
    }

    fn open(&self) -> bool {
        let mut resumed = self.resumed.lock();
        let was_waiting = !*resumed;
        *resumed = true;
        self.cond.notify_all();
        was_waiting
    }
}

/// Owning part of a guest thread
pub struct ThreadControlBlock {
    pub slot: SlotId,
    pub teb: Address,
    pub pid: u32,
    pub tid: u32,
    lifecycle: Arc<Lifecycle>,
    exit: Arc<ExitSignal>,
    exit_rx: Arc<Mutex<UnixStream>>,
    resume: Arc<ResumeGate>,
    host: Arc<Mutex<Option<JoinHandle<()>>>>,
    suspended: bool,
    session: Option<Arc<SessionClient>>,
    pub(crate) io_head: u32,
    pub(crate) io_tail: u32,
}

impl ThreadControlBlock {
    #[inline]
    pub fn state(&self) -> ThreadState {
        self.lifecycle.state()
    }

    pub fn session(&self) -> Option<&Arc<SessionClient>> {
        self.session.as_ref()
    }

    pub(crate) fn data(&self) -> EmbeddedData {
        // SAFETY: the block owns its TEB until freed
        unsafe { EmbeddedData::of(self.teb) }
    }
}

/// Process-wide owner of guest threads
pub struct ThreadManager {
    space: Arc<AddressSpace>,
    table: LatchedMutex<ThreadTable>,
    pub(crate) io: Mutex<IoArena>,
    launcher: RwLock<Option<Weak<dyn ThreadLauncher>>>,
}

impl ThreadManager {
    pub fn new(space: Arc<AddressSpace>, latch: Arc<ProcessLatch>) -> Self {
        let capacity = space.tebs().capacity();
        info!(capacity, "Thread manager initialized");
        Self {
            space,
            table: LatchedMutex::new(ThreadTable::new(capacity), latch),
            io: Mutex::new(IoArena::new()),
            launcher: RwLock::new(None),
        }
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn latch(&self) -> &Arc<ProcessLatch> {
        self.table.latch()
    }

    /// Register the component that runs new threads
    pub fn set_launcher(&self, launcher: Weak<dyn ThreadLauncher>) {
        *self.launcher.write() = Some(launcher);
    }

    /// Take a TEB slot and link a fresh control block at the list tail
    pub fn allocate(&self) -> ThreadResult<SlotId> {
        let slot = self.space.alloc_teb().map_err(|err| match err {
            MemoryError::SlotsExhausted { capacity } => ThreadError::ResourceExhausted { capacity },
            other => ThreadError::Memory(other),
        })?;
        let teb = self.space.tebs().teb_address(slot);

        let (tx, rx) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(err) => {
                let _ = self.space.free_teb(slot);
                return Err(ThreadError::Spawn(err.to_string()));
            }
        };

        let lifecycle = Arc::new(Lifecycle::new(ThreadState::Unborn));
        lifecycle.transition(slot, ThreadState::Unborn, ThreadState::Allocated)?;

        // SAFETY: the slot was just handed out and its TEB zeroed
        let data = unsafe { EmbeddedData::of(teb) };
        data.init(self.space.tebs().kernel_stack(slot).end() as u64);

        let block = ThreadControlBlock {
            slot,
            teb,
            pid: 0,
            tid: 0,
            lifecycle: lifecycle.clone(),
            exit: Arc::new(ExitSignal { lifecycle, tx }),
            exit_rx: Arc::new(Mutex::new(rx)),
            resume: Arc::new(ResumeGate::default()),
            host: Arc::new(Mutex::new(None)),
            suspended: false,
            session: None,
            io_head: NO_SLOT,
            io_tail: NO_SLOT,
        };
        self.table.lock().push_back(block);
        debug!(%slot, teb = format_args!("{:#x}", teb), "Thread allocated");
        Ok(slot)
    }

    /// Spawn the host thread for `slot`
    ///
    /// A suspended thread blocks before its first guest instruction until
    /// [`ThreadManager::resume`].
    pub fn start(&self, slot: SlotId, entry: u64, arg: u64, suspended: bool) -> ThreadResult<()> {
        let launcher = self
            .launcher
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ThreadError::Spawn("no thread launcher registered".into()))?;

        let (start, lifecycle, exit, resume, host) = {
            let mut table = self.table.lock();
            let block = table.get_mut(slot)?;
            block.lifecycle.transition(slot, ThreadState::Allocated, ThreadState::Started)?;
            block.data().set_start(entry, arg);
            block.suspended = suspended;
            let start = ThreadStart {
                slot,
                teb: block.teb,
                entry,
                arg,
                suspended,
            };
            (
                start,
                block.lifecycle.clone(),
                block.exit.clone(),
                block.resume.clone(),
                block.host.clone(),
            )
        };

        let body_lifecycle = lifecycle.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("guest-{}", slot.0))
            .spawn(move || {
                set_current_teb(start.teb);
                CURRENT_EXIT.with(|cell| cell.set(Arc::as_ptr(&exit)));

                if start.suspended {
                    resume.wait();
                }
                let status = match body_lifecycle.transition(
                    start.slot,
                    ThreadState::Started,
                    ThreadState::Running,
                ) {
                    Ok(()) => launcher.start_thread(start),
                    Err(_) => NtStatus::PROCESS_IS_TERMINATING,
                };
                exit.post(status);
                CURRENT_EXIT.with(|cell| cell.set(std::ptr::null()));
                set_current_teb(0);
            });

        match spawned {
            Ok(handle) => {
                if let Ok(block) = self.table.lock().get(slot) {
                    block.data().set_pthread_id(handle.as_pthread_t() as u64);
                }
                *host.lock() = Some(handle);
                info!(%slot, entry = format_args!("{:#x}", entry), suspended, "Thread started");
                Ok(())
            }
            Err(err) => {
                lifecycle.mark_exiting(NtStatus::NO_MEMORY);
                warn!(%slot, error = %err, "Host thread spawn failed");
                Err(ThreadError::Spawn(err.to_string()))
            }
        }
    }

    /// Let a suspended thread run; returns whether it was waiting
    pub fn resume(&self, slot: SlotId) -> ThreadResult<bool> {
        let resume = {
            let table = self.table.lock();
            let block = table.get(slot)?;
            if !block.suspended || block.state() == ThreadState::Allocated {
                return Ok(false);
            }
            block.resume.clone()
        };
        Ok(resume.open())
    }

    /// Block until the host thread of `slot` has exited; returns its status
    pub fn join(&self, slot: SlotId) -> ThreadResult<NtStatus> {
        let (lifecycle, rx) = {
            let table = self.table.lock();
            let block = table.get(slot)?;
            if block.state() == ThreadState::Allocated {
                return Err(ThreadError::InvalidStateTransition {
                    slot,
                    from: ThreadState::Allocated,
                    to: ThreadState::Exiting,
                });
            }
            (block.lifecycle.clone(), block.exit_rx.clone())
        };
        if let Some(status) = lifecycle.exit_status() {
            return Ok(status);
        }
        let mut rx = rx.lock();
        if let Some(status) = lifecycle.exit_status() {
            return Ok(status);
        }
        let mut bytes = [0u8; 4];
        rx.read_exact(&mut bytes)
            .map_err(|err| ThreadError::Spawn(err.to_string()))?;
        Ok(NtStatus(u32::from_le_bytes(bytes)))
    }

    /// Unlink `slot` and return its TEB to the arena
    ///
    /// Only threads observed as exited, or never started, can be freed. An
    /// exited thread is reaped first, so the slot is recycled only once the
    /// host thread has left its TEB and signal stack.
    pub fn free(&self, slot: SlotId) -> ThreadResult<()> {
        let host = {
            let table = self.table.lock();
            let block = table.get(slot)?;
            if !block.state().is_reclaimable() {
                return Err(ThreadError::StillRunning(slot));
            }
            block.host.clone()
        };
        self.reap(slot, &host)?;

        let block = {
            let mut table = self.table.lock();
            let block = table.get(slot)?;
            let state = block.state();
            if !state.is_reclaimable() {
                return Err(ThreadError::StillRunning(slot));
            }
            block.lifecycle.transition(slot, state, ThreadState::Reclaimed)?;
            self.drop_thread_io(block);
            table.remove(slot)?
        };
        self.space.free_teb(slot)?;
        debug!(%slot, "Thread freed");
        drop(block);
        Ok(())
    }

    /// Wait for the host thread behind `slot` to terminate
    fn reap(&self, slot: SlotId, host: &Mutex<Option<JoinHandle<()>>>) -> ThreadResult<()> {
        let mut host = host.lock();
        let Some(handle) = host.as_ref() else {
            return Ok(());
        };
        if handle.thread().id() == std::thread::current().id() {
            return Err(ThreadError::StillRunning(slot));
        }
        if let Some(handle) = host.take() {
            if handle.join().is_err() {
                warn!(%slot, "Guest thread body panicked");
            }
        }
        Ok(())
    }

    /// Record the coordinator channel in the owning and embedded blocks
    pub fn attach_channel(&self, slot: SlotId, session: Arc<SessionClient>) -> ThreadResult<()> {
        let mut table = self.table.lock();
        let block = table.get_mut(slot)?;
        let fds = session.fds();
        block.data().set_channel(fds.request, fds.reply, fds.wait);
        block.session = Some(session);
        Ok(())
    }

    pub fn set_thread_id(&self, slot: SlotId, pid: u32, tid: u32) -> ThreadResult<()> {
        let mut table = self.table.lock();
        let block = table.get_mut(slot)?;
        block.pid = pid;
        block.tid = tid;
        Ok(())
    }

    pub fn state(&self, slot: SlotId) -> ThreadResult<ThreadState> {
        Ok(self.table.lock().get(slot)?.state())
    }

    pub fn session(&self, slot: SlotId) -> Option<Arc<SessionClient>> {
        self.table.lock().get(slot).ok()?.session.clone()
    }

    /// Session lookup that never blocks, for the signal path
    pub fn try_session(&self, slot: SlotId) -> Option<Arc<SessionClient>> {
        self.table.try_lock()?.get(slot).ok()?.session.clone()
    }

    /// Embedded data of `slot`
    pub fn thread_data(&self, slot: SlotId) -> ThreadResult<ThreadData> {
        Ok(self.table.lock().get(slot)?.data().snapshot())
    }

    /// Live threads in list order
    pub fn threads(&self) -> Vec<SlotId> {
        self.table.lock().slots()
    }

    pub fn count(&self) -> usize {
        self.table.lock().len()
    }

    pub fn info(&self, slot: SlotId) -> ThreadResult<ThreadInfo> {
        let table = self.table.lock();
        let block = table.get(slot)?;
        let pending_io = self.pending_in(block).len();
        Ok(ThreadInfo {
            slot,
            teb: block.teb,
            state: block.state(),
            pid: block.pid,
            tid: block.tid,
            pending_io,
        })
    }

    pub(crate) fn with_table<R>(&self, f: impl FnOnce(&mut ThreadTable) -> R) -> R {
        f(&mut self.table.lock())
    }
}
