/*!
 * Dispatch Core
 *
 * Decides how each captured trap resumes. The raw handler captures the
 * host context and redirects the thread onto a trampoline, which calls
 * [`DispatchCore::handle_trap`] outside signal context and applies the
 * returned [`Resumption`]; everything here works on the captured copy and
 * never touches the host signal frame.
 *
 * # Fault Routing
 *
 * 1. Faults taken with the stack pointer on a signal stack, or on a kernel
 *    stack guard page, abort the thread.
 * 2. The address-space manager gets the first chance (guard pages, stack
 *    growth, stale protections).
 * 3. Host code that registered a recovery point is unwound to it.
 * 4. Anything left becomes a guest exception.
 */

use super::dispatcher::GuestDispatcher;
use super::stats::{DispatchStats, DispatchStatsSnapshot};
use super::types::{
    CallbackReturn, CtrlEvent, ExceptionDisposition, ExceptionRecord, HostTrap, Resumption,
    SyscallArgs, TrapKind, BREAKPOINT_BREAK,
};
use crate::context::{Amd64Context, ContextFlags, NativeContext, TranslatedContext};
use crate::core::latch::ProcessLatch;
use crate::core::status::NtStatus;
use crate::core::types::{Address, SlotId};
use crate::ipc::{ApcCall, IpcError};
use crate::memory::{AccessKind, AddressSpace, FaultResolution};
use crate::monitoring::span_dispatch;
use crate::thread::{current_recovery_point, ThreadLauncher, ThreadManager, ThreadStart};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// Linux `si_code` values for SIGFPE
const FPE_INTDIV: i32 = 1;
const FPE_INTOVF: i32 = 2;
const FPE_FLTDIV: i32 = 3;
const FPE_FLTOVF: i32 = 4;
const FPE_FLTUND: i32 = 5;
const FPE_FLTRES: i32 = 6;
const FPE_FLTINV: i32 = 7;
const FPE_FLTSUB: i32 = 8;

const INITIAL_MXCSR: u32 = 0x1f80;
const INITIAL_FPU_CONTROL: u16 = 0x27f;

/// Guest status for an arithmetic fault `si_code`
pub fn arithmetic_status(code: i32) -> NtStatus {
    match code {
        FPE_INTDIV => NtStatus::INTEGER_DIVIDE_BY_ZERO,
        FPE_INTOVF => NtStatus::INTEGER_OVERFLOW,
        FPE_FLTDIV => NtStatus::FLOAT_DIVIDE_BY_ZERO,
        FPE_FLTOVF => NtStatus::FLOAT_OVERFLOW,
        FPE_FLTUND => NtStatus::FLOAT_UNDERFLOW,
        FPE_FLTRES => NtStatus::FLOAT_INEXACT_RESULT,
        FPE_FLTSUB => NtStatus::ARRAY_BOUNDS_EXCEEDED,
        FPE_FLTINV => NtStatus::FLOAT_INVALID_OPERATION,
        _ => NtStatus::FLOAT_INVALID_OPERATION,
    }
}

/// Trap-to-guest dispatch decisions and trampolines
pub struct DispatchCore {
    dispatcher: Arc<dyn GuestDispatcher>,
    space: Arc<AddressSpace>,
    threads: Arc<ThreadManager>,
    compaction: bool,
    stats: DispatchStats,
}

impl DispatchCore {
    pub fn new(
        dispatcher: Arc<dyn GuestDispatcher>,
        space: Arc<AddressSpace>,
        threads: Arc<ThreadManager>,
        compaction: bool,
    ) -> Self {
        Self {
            dispatcher,
            space,
            threads,
            compaction,
            stats: DispatchStats::new(),
        }
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn threads(&self) -> &Arc<ThreadManager> {
        &self.threads
    }

    pub fn latch(&self) -> &Arc<ProcessLatch> {
        self.threads.latch()
    }

    /// Compaction setting snapshotted into every captured context
    pub fn compaction(&self) -> bool {
        self.compaction
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Route one captured trap
    pub fn handle_trap(&self, trap: HostTrap, mut ctx: TranslatedContext) -> Resumption {
        self.stats.inc_traps();
        let ip = ctx.native.instruction_pointer();

        match trap.kind {
            TrapKind::Syscall { insn_len } => {
                self.stats.inc_syscalls();
                let args = SyscallArgs::from_context(&ctx.native);
                let status = self.dispatcher.dispatch_syscall(&args);
                ctx.native.set_accumulator(status.raw() as u64);
                ctx.native.set_instruction_pointer(ip + insn_len as u64);
                Resumption::Continue(ctx)
            }
            TrapKind::MemoryFault { address, access } => self.handle_memory_fault(trap.slot, address, access, ctx),
            TrapKind::Arithmetic { code } => {
                let record = ExceptionRecord::new(arithmetic_status(code), ip);
                self.call_user_exception_dispatcher(record, ctx)
            }
            TrapKind::Breakpoint => {
                // int3 has already executed; report its own address
                let address = ip.saturating_sub(1);
                ctx.native.set_instruction_pointer(address);
                let record = ExceptionRecord::new(NtStatus::BREAKPOINT, address).with_params(&[BREAKPOINT_BREAK]);
                self.call_user_exception_dispatcher(record, ctx)
            }
            TrapKind::SingleStep => {
                self.call_user_exception_dispatcher(ExceptionRecord::new(NtStatus::SINGLE_STEP, ip), ctx)
            }
            TrapKind::IllegalInstruction => {
                self.call_user_exception_dispatcher(ExceptionRecord::new(NtStatus::ILLEGAL_INSTRUCTION, ip), ctx)
            }
            TrapKind::PrivilegedInstruction => self.call_user_exception_dispatcher(
                ExceptionRecord::new(NtStatus::PRIVILEGED_INSTRUCTION, ip),
                ctx,
            ),
            TrapKind::Interrupt => self.call_ctrl_routine(CtrlEvent::CtrlC, ctx),
            TrapKind::Quit => {
                self.stats.inc_thread_aborts();
                Resumption::AbortThread(NtStatus::SUCCESS)
            }
            TrapKind::Suspend => self.suspend(trap.slot, ctx),
            TrapKind::Unknown { signal, code } => {
                self.stats.inc_unresolved();
                self.stats.inc_thread_aborts();
                error!(signal, code, ip, "Trap has no guest exception policy");
                Resumption::AbortThread(NtStatus::UNHANDLED_EXCEPTION)
            }
        }
    }

    fn handle_memory_fault(
        &self,
        slot: Option<SlotId>,
        address: Address,
        access: AccessKind,
        ctx: TranslatedContext,
    ) -> Resumption {
        let sp = ctx.native.stack_pointer() as Address;
        let tebs = self.space.tebs();
        if tebs.signal_stack_owner(sp).is_some() {
            self.stats.inc_thread_aborts();
            error!(?slot, address, sp, "Nested fault on the signal stack");
            return Resumption::AbortThread(NtStatus::ACCESS_VIOLATION);
        }
        if tebs.is_kernel_stack_guard(address) {
            self.stats.inc_thread_aborts();
            error!(?slot, address, "Kernel stack overflow");
            return Resumption::AbortThread(NtStatus::STACK_OVERFLOW);
        }

        let status = match self.space.handle_fault(address, access) {
            FaultResolution::Handled => {
                self.stats.inc_faults_resolved();
                return Resumption::Continue(ctx);
            }
            FaultResolution::Unhandled(status) => status,
        };

        if let Some(point) = current_recovery_point() {
            self.stats.inc_host_recoveries();
            debug!(address, ip = point.ip, "Host access fault recovered");
            return Resumption::RecoverHost(point);
        }

        let ip = ctx.native.instruction_pointer();
        let record = ExceptionRecord::memory_fault(status, ip, access, address);
        self.call_user_exception_dispatcher(record, ctx)
    }

    /// Hand an exception to the guest, with a second chance on refusal
    pub fn call_user_exception_dispatcher(&self, record: ExceptionRecord, mut ctx: TranslatedContext) -> Resumption {
        self.stats.inc_exceptions();
        let span = span_dispatch("exception", None);
        let _entered = span.enter();
        span.record_status(record.code.raw());

        let disposition = self.dispatcher.dispatch_exception(&record, &mut ctx, true);
        if let Some(resumption) = self.resolve_disposition(&record, disposition, ctx) {
            return resumption;
        }

        self.stats.inc_second_chance();
        warn!(code = %record.code, address = record.address, "Unhandled exception, second chance");
        let disposition = self.dispatcher.dispatch_exception(&record, &mut ctx, false);
        if let Some(resumption) = self.resolve_disposition(&record, disposition, ctx) {
            return resumption;
        }

        self.stats.inc_thread_aborts();
        error!(code = %record.code, address = record.address, "Exception not handled, aborting thread");
        Resumption::AbortThread(record.code)
    }

    fn resolve_disposition(
        &self,
        record: &ExceptionRecord,
        disposition: ExceptionDisposition,
        ctx: TranslatedContext,
    ) -> Option<Resumption> {
        match disposition {
            ExceptionDisposition::ContinueSearch => None,
            ExceptionDisposition::ContinueExecution if record.is_noncontinuable() => {
                self.stats.inc_thread_aborts();
                Some(Resumption::AbortThread(NtStatus::NONCONTINUABLE_EXCEPTION))
            }
            ExceptionDisposition::ContinueExecution => Some(Resumption::Continue(ctx)),
        }
    }

    /// Exception raised by guest code through the runtime
    pub fn call_raise_user_exception_dispatcher(
        &self,
        record: ExceptionRecord,
        mut ctx: TranslatedContext,
    ) -> Resumption {
        self.stats.inc_exceptions();
        let span = span_dispatch("raise", None);
        let _entered = span.enter();

        match self.dispatcher.raise_user_exception(&record, &mut ctx) {
            ExceptionDisposition::ContinueExecution if !record.is_noncontinuable() => Resumption::Continue(ctx),
            ExceptionDisposition::ContinueExecution => {
                self.stats.inc_thread_aborts();
                Resumption::AbortThread(NtStatus::NONCONTINUABLE_EXCEPTION)
            }
            ExceptionDisposition::ContinueSearch => self.call_user_exception_dispatcher(record, ctx),
        }
    }

    /// Run a user APC, then resume the interrupted context
    pub fn call_user_apc_dispatcher(&self, call: ApcCall, mut ctx: TranslatedContext) -> Resumption {
        let ApcCall::User { func, args } = call else {
            debug!(?call, "Not a user APC");
            return Resumption::Continue(ctx);
        };
        self.stats.inc_apcs();
        let span = span_dispatch("apc", None);
        let _entered = span.enter();
        self.dispatcher.dispatch_apc(func, args, &mut ctx);
        Resumption::Continue(ctx)
    }

    /// Initial context of a new thread: entry in rcx, argument in rdx
    pub fn initial_context(&self, start: &ThreadStart) -> TranslatedContext {
        let mut native = Amd64Context {
            rip: start.entry,
            rcx: start.entry,
            rdx: start.arg,
            mx_csr: INITIAL_MXCSR,
            ..Default::default()
        };
        native.flt_save.control_word = INITIAL_FPU_CONTROL;
        native.flt_save.mx_csr = INITIAL_MXCSR;
        native.set_groups(ContextFlags::FULL);
        TranslatedContext::new(NativeContext::Amd64(native), self.compaction)
    }

    /// First guest execution of a thread; it ends by terminating the thread
    pub fn start_thread(&self, start: &ThreadStart) -> Resumption {
        let span = span_dispatch("start_thread", Some(start.slot));
        let _entered = span.enter();
        let mut ctx = self.initial_context(start);
        let status = self.dispatcher.start_thread(start.entry, start.arg, &mut ctx);
        span.record_status(status.raw());
        info!(slot = %start.slot, status = %status, "Guest thread returned");
        Resumption::AbortThread(status)
    }

    /// Nested call into guest code; returns to the host caller
    pub fn call_user_callback(&self, id: u32, args: &[u8]) -> CallbackReturn {
        let span = span_dispatch("callback", None);
        let _entered = span.enter();
        let result = self.dispatcher.user_callback(id, args);
        span.record_status(result.status.raw());
        result
    }

    /// Console control event; unhandled events end the process
    pub fn call_ctrl_routine(&self, event: CtrlEvent, ctx: TranslatedContext) -> Resumption {
        let span = span_dispatch("ctrl", None);
        let _entered = span.enter();
        match self.dispatcher.ctrl_routine(event) {
            NtStatus::SUCCESS => Resumption::Continue(ctx),
            status => {
                info!(?event, status = %status, "Control event not handled, exiting");
                Resumption::ExitProcess(NtStatus::CONTROL_C_EXIT)
            }
        }
    }

    fn suspend(&self, slot: Option<SlotId>, ctx: TranslatedContext) -> Resumption {
        let Some(session) = slot.and_then(|slot| self.threads.try_session(slot)) else {
            warn!(?slot, "Suspend request without a coordinator session");
            return Resumption::Continue(ctx);
        };
        match session.suspend(&ctx) {
            Ok(resumed) => Resumption::Continue(resumed),
            Err(IpcError::Killed(status)) => {
                self.stats.inc_thread_aborts();
                Resumption::AbortThread(status)
            }
            Err(err) => {
                warn!(?slot, error = %err, "Suspend failed, resuming unchanged");
                Resumption::Continue(ctx)
            }
        }
    }
}

impl ThreadLauncher for DispatchCore {
    fn start_thread(&self, start: ThreadStart) -> NtStatus {
        if let Err(err) = super::init_thread(start.teb) {
            warn!(slot = %start.slot, error = %err, "Signal stack setup failed");
            return NtStatus::from(&err);
        }
        match DispatchCore::start_thread(self, &start) {
            Resumption::AbortThread(status) => status,
            Resumption::AbortProcess(status) => super::exit::abort_process(self.latch(), status),
            Resumption::ExitProcess(status) => super::exit::exit_process(self.latch(), status),
            Resumption::Continue(_) | Resumption::RecoverHost(_) => NtStatus::SUCCESS,
        }
    }
}
