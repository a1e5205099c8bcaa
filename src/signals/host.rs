/*!
 * Host Trap Handlers (x86-64 Linux)
 *
 * The raw handler runs on the thread's signal stack with every signal
 * blocked and stays async-signal-safe: it copies the host `ucontext` into a
 * [`TrapFrame`] on the thread's kernel stack, then rewrites the interrupted
 * context so that returning from the handler enters [`dispatch_trampoline`]
 * on that stack. The trampoline runs as ordinary code with the interrupted
 * signal mask, so the dispatch core may lock, log and call the coordinator.
 *
 * A resumed guest context is restored by raising [`RESUME_SIGNAL`] on the
 * trampoline; its handler writes the context into the new frame and the
 * kernel's sigreturn reloads every register, FP state included.
 */

use super::dispatch::DispatchCore;
use super::exit::{abort_process, abort_thread, exit_process};
use super::types::{DispatchError, DispatchResult, HostTrap, Resumption, TrapKind};
use crate::context::{
    Amd64Context, ContextFlags, NativeContext, TranslatedContext, XState, XsaveFormat, M128,
    XSTATE_MASK_AVX,
};
use crate::core::limits::{MIN_KERNEL_STACK, SIGNAL_STACK_SIZE};
use crate::core::status::NtStatus;
use crate::core::types::Address;
use crate::memory::{signal_stack_for, AccessKind, Region};
use crate::thread::{current_teb, RecoveryPoint};
use libc::{c_int, c_void, siginfo_t, sigset_t, ucontext_t};
use nix::sys::signal::{pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::cell::Cell;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

static CORE: OnceLock<Arc<DispatchCore>> = OnceLock::new();

/// Signals routed through the dispatch core
pub const TRAP_SIGNALS: [Signal; 9] = [
    Signal::SIGILL,
    Signal::SIGSYS,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGTRAP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
];

/// Raised by a trampoline to reload a resumed context
pub const RESUME_SIGNAL: Signal = Signal::SIGUSR2;

// Offsets into the kernel's extended signal frame
const FP_XSTATE_MAGIC1: u32 = 0x4650_5853;
const SW_RESERVED_OFFSET: usize = 464;
const XSAVE_HEADER_OFFSET: usize = 512;
const YMM_HIGH_OFFSET: usize = 576;
const FXSAVE_MXCSR_OFFSET: usize = 24;

// Page-fault error code bits
const PF_WRITE: i64 = 0x2;
const PF_INSTR: i64 = 0x10;

// si_code values
const ILL_PRVOPC: i32 = 5;
const ILL_PRVREG: i32 = 6;
const TRAP_TRACE: i32 = 2;

const RED_ZONE: usize = 128;
const HOST_CODE_SELECTOR: u64 = 0x33;
const EFL_TRAP: i64 = 0x100;
const EFL_DIRECTION: i64 = 0x400;
const HOST_FPU_CONTROL: u16 = 0x37f;
const HOST_MXCSR: u32 = 0x1f80;

/// Trap captured by the raw handler, consumed by the trampoline
struct TrapFrame {
    trap: HostTrap,
    ctx: TranslatedContext,
    sigmask: sigset_t,
}

const FRAME_ALIGN: usize = if std::mem::align_of::<TrapFrame>() > 16 {
    std::mem::align_of::<TrapFrame>()
} else {
    16
};

/// Context handed from a trampoline to the resume handler
struct PendingResume {
    ctx: TranslatedContext,
    sigmask: sigset_t,
}

thread_local! {
    static PENDING_RESUME: Cell<*const PendingResume> = const { Cell::new(std::ptr::null()) };
}

/// Install the host trap handlers for the whole process
pub fn install(core: Arc<DispatchCore>) -> DispatchResult<()> {
    CORE.set(core).map_err(|_| DispatchError::AlreadyInstalled)?;
    let flags = SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK | SaFlags::SA_RESTART;
    let action = SigAction::new(SigHandler::SigAction(trap_handler), flags, SigSet::all());
    for signal in TRAP_SIGNALS {
        // SAFETY: trap_handler only captures and redirects
        unsafe { sigaction(signal, &action) }.map_err(DispatchError::Install)?;
    }
    let resume = SigAction::new(SigHandler::SigAction(resume_handler), flags, SigSet::all());
    // SAFETY: resume_handler only copies a pending context into its frame
    unsafe { sigaction(RESUME_SIGNAL, &resume) }.map_err(DispatchError::Install)?;
    info!(signals = TRAP_SIGNALS.len(), "Host trap handlers installed");
    Ok(())
}

pub fn is_installed() -> bool {
    CORE.get().is_some()
}

/// Point the calling thread's alternate signal stack at its TEB block
pub fn init_thread(teb: Address) -> DispatchResult<()> {
    let stack = libc::stack_t {
        ss_sp: signal_stack_for(teb) as *mut c_void,
        ss_flags: 0,
        ss_size: SIGNAL_STACK_SIZE,
    };
    // SAFETY: the signal stack lives as long as the TEB slot
    let rc = unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(DispatchError::Install(nix::errno::Errno::last()));
    }
    Ok(())
}

extern "C" fn trap_handler(signal: c_int, info: *mut siginfo_t, ucontext: *mut c_void) {
    let Some(core) = CORE.get() else {
        return;
    };
    // SAFETY: the kernel passes valid siginfo and ucontext pointers for SA_SIGINFO handlers
    let (info, uc) = unsafe { (&*info, &mut *(ucontext as *mut ucontext_t)) };

    let kind = classify(signal, info, uc);
    let slot = current_teb().and_then(|teb| core.space().tebs().slot_of_teb(teb));
    let stack = match slot {
        Some(slot) => Some(core.space().tebs().kernel_stack(slot)),
        None if kind == TrapKind::Suspend => return,
        // Host threads take console events on their own stack
        None if kind == TrapKind::Interrupt => None,
        None => {
            // Not a guest thread: fall back to the default action
            // SAFETY: signal and raise are async-signal-safe
            unsafe {
                libc::signal(signal, libc::SIG_DFL);
                libc::raise(signal);
            }
            return;
        }
    };

    let sp = uc.uc_mcontext.gregs[libc::REG_RSP as usize] as Address;
    let Some(frame) = frame_address(stack, sp) else {
        abort_thread(NtStatus::STACK_OVERFLOW);
    };
    let trap = TrapFrame {
        trap: HostTrap::new(kind, slot),
        ctx: capture(uc, core.compaction()),
        sigmask: uc.uc_sigmask,
    };
    // SAFETY: frame_address reserved an aligned, unused TrapFrame at `frame`
    unsafe { (frame as *mut TrapFrame).write(trap) };
    redirect(uc, dispatch_trampoline as usize, frame);
}

/// Where the trap frame goes, with the trampoline's stack right below it
///
/// On a kernel stack the frame sits at the top, or below the interrupted
/// frame when the trap hit code already running there. `None` means there
/// is no room left for a dispatch.
fn frame_address(stack: Option<Region>, sp: Address) -> Option<Address> {
    let size = std::mem::size_of::<TrapFrame>();
    let Some(stack) = stack else {
        let top = sp.checked_sub(RED_ZONE + size)?;
        return Some(top & !(FRAME_ALIGN - 1));
    };
    let top = if stack.contains(sp) {
        sp.checked_sub(RED_ZONE)?
    } else {
        stack.end()
    };
    let frame = top.checked_sub(size)? & !(FRAME_ALIGN - 1);
    (frame >= stack.base + MIN_KERNEL_STACK).then_some(frame)
}

/// Make the interrupted context call `entry(frame)` with its stack below `frame`
fn redirect(uc: &mut ucontext_t, entry: usize, frame: Address) {
    let sp = frame - std::mem::size_of::<u64>();
    // SAFETY: the word below the frame belongs to the fresh stack; it is the
    // return slot of an entry point that never returns
    unsafe { (sp as *mut u64).write(0) };

    let gregs = &mut uc.uc_mcontext.gregs;
    gregs[libc::REG_RIP as usize] = entry as i64;
    gregs[libc::REG_RSP as usize] = sp as i64;
    gregs[libc::REG_RBP as usize] = 0;
    gregs[libc::REG_RDI as usize] = frame as i64;
    gregs[libc::REG_EFL as usize] &= !(EFL_TRAP | EFL_DIRECTION);
    let csgsfs = gregs[libc::REG_CSGSFS as usize] as u64;
    gregs[libc::REG_CSGSFS as usize] = ((csgsfs & !0xffff) | HOST_CODE_SELECTOR) as i64;

    let fpregs = uc.uc_mcontext.fpregs as *mut u8;
    if !fpregs.is_null() {
        // SAFETY: fpregs points at the kernel's writable fxsave image
        unsafe {
            std::ptr::write_unaligned(fpregs as *mut u16, HOST_FPU_CONTROL);
            std::ptr::write_unaligned(fpregs.add(FXSAVE_MXCSR_OFFSET) as *mut u32, HOST_MXCSR);
        }
    }
}

/// First code run outside signal context after a trap
extern "C" fn dispatch_trampoline(frame: *mut TrapFrame) -> ! {
    // SAFETY: written by trap_handler just above this stack
    let TrapFrame { trap, ctx, sigmask } = unsafe { frame.read() };
    let Some(core) = CORE.get() else {
        abort_thread(NtStatus::UNSUCCESSFUL);
    };
    match core.handle_trap(trap, ctx) {
        Resumption::Continue(ctx) => resume(PendingResume { ctx, sigmask }),
        Resumption::RecoverHost(point) => resume(PendingResume {
            ctx: recovered(ctx, point),
            sigmask,
        }),
        Resumption::AbortThread(status) => abort_thread(status),
        Resumption::AbortProcess(status) => abort_process(core.latch(), status),
        Resumption::ExitProcess(status) => exit_process(core.latch(), status),
    }
}

/// Faulting context unwound to a host recovery point, reporting failure in rax
fn recovered(mut ctx: TranslatedContext, point: RecoveryPoint) -> TranslatedContext {
    if let NativeContext::Amd64(native) = &mut ctx.native {
        native.rip = point.ip;
        native.rsp = point.sp;
        native.rax = 1;
    }
    ctx
}

fn resume(pending: PendingResume) -> ! {
    if let Err(err) = unblock_resume_signal() {
        error!(error = %err, "Cannot unblock the resume signal");
        abort_thread(NtStatus::from(&err));
    }
    PENDING_RESUME.with(|cell| cell.set(&pending));
    // SAFETY: an unblocked signal raised at the calling thread is delivered
    // before raise returns; the handler never comes back here
    unsafe { libc::raise(RESUME_SIGNAL as c_int) };
    PENDING_RESUME.with(|cell| cell.set(std::ptr::null()));
    error!("Resume signal returned to its trampoline");
    abort_thread(NtStatus::UNSUCCESSFUL)
}

fn unblock_resume_signal() -> DispatchResult<()> {
    let mut set = SigSet::empty();
    set.add(RESUME_SIGNAL);
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None).map_err(DispatchError::Install)
}

extern "C" fn resume_handler(_signal: c_int, _info: *mut siginfo_t, ucontext: *mut c_void) {
    let pending = PENDING_RESUME.with(|cell| cell.replace(std::ptr::null()));
    if pending.is_null() {
        return;
    }
    // SAFETY: the pending context lives in the raising trampoline's frame,
    // which stays intact until this handler returns
    let (pending, uc) = unsafe { (&*pending, &mut *(ucontext as *mut ucontext_t)) };
    write_back(&pending.ctx, uc);
    uc.uc_sigmask = pending.sigmask;
}

fn classify(signal: c_int, info: &siginfo_t, uc: &ucontext_t) -> TrapKind {
    let code = info.si_code;
    let Ok(sig) = Signal::try_from(signal) else {
        return TrapKind::Unknown { signal, code };
    };
    match sig {
        Signal::SIGSEGV | Signal::SIGBUS => {
            // SAFETY: si_addr is valid for fault signals
            let address = unsafe { info.si_addr() } as Address;
            let err = uc.uc_mcontext.gregs[libc::REG_ERR as usize];
            let access = if err & PF_INSTR != 0 {
                AccessKind::Execute
            } else if err & PF_WRITE != 0 {
                AccessKind::Write
            } else {
                AccessKind::Read
            };
            TrapKind::MemoryFault { address, access }
        }
        // The kernel reports the instruction pointer past the syscall
        Signal::SIGSYS => TrapKind::Syscall { insn_len: 0 },
        Signal::SIGILL if code == ILL_PRVOPC || code == ILL_PRVREG => TrapKind::PrivilegedInstruction,
        Signal::SIGILL => TrapKind::IllegalInstruction,
        Signal::SIGFPE => TrapKind::Arithmetic { code },
        Signal::SIGTRAP if code == TRAP_TRACE => TrapKind::SingleStep,
        Signal::SIGTRAP => TrapKind::Breakpoint,
        Signal::SIGINT => TrapKind::Interrupt,
        Signal::SIGQUIT => TrapKind::Quit,
        Signal::SIGUSR1 => TrapKind::Suspend,
        _ => TrapKind::Unknown { signal, code },
    }
}

fn capture(uc: &ucontext_t, compaction: bool) -> TranslatedContext {
    let gregs = &uc.uc_mcontext.gregs;
    let reg = |index: c_int| gregs[index as usize] as u64;
    let csgsfs = reg(libc::REG_CSGSFS);

    let mut native = Amd64Context {
        rax: reg(libc::REG_RAX),
        rbx: reg(libc::REG_RBX),
        rcx: reg(libc::REG_RCX),
        rdx: reg(libc::REG_RDX),
        rsi: reg(libc::REG_RSI),
        rdi: reg(libc::REG_RDI),
        rbp: reg(libc::REG_RBP),
        rsp: reg(libc::REG_RSP),
        r8: reg(libc::REG_R8),
        r9: reg(libc::REG_R9),
        r10: reg(libc::REG_R10),
        r11: reg(libc::REG_R11),
        r12: reg(libc::REG_R12),
        r13: reg(libc::REG_R13),
        r14: reg(libc::REG_R14),
        r15: reg(libc::REG_R15),
        rip: reg(libc::REG_RIP),
        eflags: reg(libc::REG_EFL) as u32,
        seg_cs: csgsfs as u16,
        seg_gs: (csgsfs >> 16) as u16,
        seg_fs: (csgsfs >> 32) as u16,
        seg_ss: (csgsfs >> 48) as u16,
        ..Default::default()
    };
    let mut groups = ContextFlags::CONTROL | ContextFlags::INTEGER | ContextFlags::SEGMENTS;

    let fpregs = uc.uc_mcontext.fpregs as *const u8;
    let mut ymm = None;
    if !fpregs.is_null() {
        let mut raw = [0u8; 512];
        // SAFETY: fpregs points at the kernel's fxsave image of at least 512 bytes
        unsafe { std::ptr::copy_nonoverlapping(fpregs, raw.as_mut_ptr(), raw.len()) };
        native.flt_save = XsaveFormat::from_bytes(&raw);
        native.mx_csr = native.flt_save.mx_csr;
        groups |= ContextFlags::FLOATING_POINT;
        // SAFETY: the extended frame is present when magic1 matches
        ymm = unsafe { capture_ymm(fpregs) };
    }
    native.set_groups(groups);

    let ctx = TranslatedContext::new(NativeContext::Amd64(native), compaction);
    match ymm {
        Some(ymm) => ctx.with_xstate(XState {
            mask: XSTATE_MASK_AVX,
            ymm,
            ..XState::default()
        }),
        None => ctx,
    }
}

/// YMM upper halves from the XSAVE extension, if the frame carries them
unsafe fn capture_ymm(fpregs: *const u8) -> Option<[M128; 16]> {
    let magic = std::ptr::read_unaligned(fpregs.add(SW_RESERVED_OFFSET) as *const u32);
    if magic != FP_XSTATE_MAGIC1 {
        return None;
    }
    let xstate_bv = std::ptr::read_unaligned(fpregs.add(XSAVE_HEADER_OFFSET) as *const u64);
    if xstate_bv & XSTATE_MASK_AVX == 0 {
        return None;
    }
    let mut ymm = [M128::ZERO; 16];
    for (index, reg) in ymm.iter_mut().enumerate() {
        let base = fpregs.add(YMM_HIGH_OFFSET + index * 16);
        reg.low = std::ptr::read_unaligned(base as *const u64);
        reg.high = std::ptr::read_unaligned(base.add(8) as *const u64);
    }
    Some(ymm)
}

fn write_back(ctx: &TranslatedContext, uc: &mut ucontext_t) {
    let NativeContext::Amd64(native) = &ctx.native else {
        return;
    };
    let groups = native.groups();
    let gregs = &mut uc.uc_mcontext.gregs;
    if groups.contains(ContextFlags::SEGMENTS) && native.seg_cs != 0 {
        let csgsfs = gregs[libc::REG_CSGSFS as usize] as u64;
        gregs[libc::REG_CSGSFS as usize] = ((csgsfs & !0xffff) | native.seg_cs as u64) as i64;
    }
    let mut set = |index: c_int, value: u64| gregs[index as usize] = value as i64;

    if groups.contains(ContextFlags::CONTROL) {
        set(libc::REG_RIP, native.rip);
        set(libc::REG_RSP, native.rsp);
        set(libc::REG_RBP, native.rbp);
        set(libc::REG_EFL, native.eflags as u64);
    }
    if groups.contains(ContextFlags::INTEGER) {
        set(libc::REG_RAX, native.rax);
        set(libc::REG_RBX, native.rbx);
        set(libc::REG_RCX, native.rcx);
        set(libc::REG_RDX, native.rdx);
        set(libc::REG_RSI, native.rsi);
        set(libc::REG_RDI, native.rdi);
        set(libc::REG_R8, native.r8);
        set(libc::REG_R9, native.r9);
        set(libc::REG_R10, native.r10);
        set(libc::REG_R11, native.r11);
        set(libc::REG_R12, native.r12);
        set(libc::REG_R13, native.r13);
        set(libc::REG_R14, native.r14);
        set(libc::REG_R15, native.r15);
    }

    let fpregs = uc.uc_mcontext.fpregs as *mut u8;
    if fpregs.is_null() {
        return;
    }
    if groups.contains(ContextFlags::FLOATING_POINT) {
        let raw = native.flt_save.to_bytes();
        // SAFETY: fpregs points at the kernel's writable fxsave image
        unsafe { std::ptr::copy_nonoverlapping(raw.as_ptr(), fpregs, raw.len()) };
    }
    if let Some(xstate) = ctx.xstate() {
        // SAFETY: same frame layout as captured
        unsafe { restore_ymm(fpregs, xstate) };
    }
}

unsafe fn restore_ymm(fpregs: *mut u8, xstate: &XState) {
    let magic = std::ptr::read_unaligned(fpregs.add(SW_RESERVED_OFFSET) as *const u32);
    if magic != FP_XSTATE_MAGIC1 || xstate.mask & XSTATE_MASK_AVX == 0 {
        return;
    }
    let header = fpregs.add(XSAVE_HEADER_OFFSET) as *mut u64;
    let xstate_bv = std::ptr::read_unaligned(header);
    std::ptr::write_unaligned(header, xstate_bv | XSTATE_MASK_AVX);
    for (index, reg) in xstate.ymm.iter().enumerate() {
        let base = fpregs.add(YMM_HIGH_OFFSET + index * 16);
        std::ptr::write_unaligned(base as *mut u64, reg.low);
        std::ptr::write_unaligned(base.add(8) as *mut u64, reg.high);
    }
}
