/*!
 * Dispatch Tests
 * Trap routing through the runtime into a scripted guest
 */

use super::common::ScriptedDispatcher;
use personality_kernel::context::{Amd64Context, ContextFlags, NativeContext, TranslatedContext};
use personality_kernel::core::limits::PAGE_SIZE;
use personality_kernel::ipc::ApcCall;
use personality_kernel::memory::{AccessKind, ProtFlags};
use personality_kernel::signals::{CtrlEvent, ExceptionRecord, HostTrap, Resumption, TrapKind};
use personality_kernel::{NtStatus, Runtime, RuntimeConfig};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn runtime(dispatcher: Arc<ScriptedDispatcher>) -> Runtime {
    Runtime::builder(dispatcher)
        .with_config(RuntimeConfig::default().with_thread_capacity(2))
        .build()
        .unwrap()
}

fn context(rip: u64, rsp: u64) -> TranslatedContext {
    let mut native = Amd64Context {
        rip,
        rsp,
        ..Default::default()
    };
    native.set_groups(ContextFlags::FULL);
    TranslatedContext::new(NativeContext::Amd64(native), false)
}

fn continued(resumption: Resumption) -> TranslatedContext {
    match resumption {
        Resumption::Continue(ctx) => ctx,
        other => panic!("expected Continue, got {other:?}"),
    }
}

#[test]
fn test_syscall_marshals_and_advances() {
    let guest = Arc::new(ScriptedDispatcher::default());
    *guest.syscall_status.lock() = Some(NtStatus::ACCESS_DENIED);
    let runtime = runtime(guest.clone());

    let mut ctx = context(0x5000, 0x9000);
    if let NativeContext::Amd64(native) = &mut ctx.native {
        native.rax = 0x18;
        native.r10 = 1;
        native.rdx = 2;
        native.r8 = 3;
        native.r9 = 4;
    }

    let trap = HostTrap::new(TrapKind::Syscall { insn_len: 2 }, None);
    let ctx = continued(runtime.dispatch().handle_trap(trap, ctx));
    assert_eq!(ctx.native.instruction_pointer(), 0x5002);
    assert_eq!(ctx.native.accumulator(), NtStatus::ACCESS_DENIED.raw() as u64);

    let seen = guest.syscalls.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].number, 0x18);
    assert_eq!(seen[0].args, [1, 2, 3, 4]);
    assert_eq!(seen[0].stack, 0x9028);
    assert_eq!(runtime.status().dispatch.syscalls, 1);
}

#[test]
fn test_stack_growth_never_reaches_guest() {
    let guest = Arc::new(ScriptedDispatcher::default());
    let runtime = runtime(guest.clone());
    let stack = runtime.space().alloc_thread_stack(PAGE_SIZE * 8, PAGE_SIZE).unwrap();

    let guard = stack.limit - PAGE_SIZE;
    let trap = HostTrap::new(
        TrapKind::MemoryFault {
            address: guard,
            access: AccessKind::Write,
        },
        None,
    );
    continued(runtime.dispatch().handle_trap(trap, context(0x4000, guard as u64)));

    assert!(guest.exceptions.lock().is_empty());
    assert_eq!(runtime.status().dispatch.faults_resolved, 1);
}

#[test]
fn test_unhandled_fault_gets_second_chance_then_aborts() {
    let guest = Arc::new(ScriptedDispatcher::default());
    let runtime = runtime(guest.clone());

    let trap = HostTrap::new(
        TrapKind::MemoryFault {
            address: 0x10,
            access: AccessKind::Read,
        },
        None,
    );
    let resumption = runtime.dispatch().handle_trap(trap, context(0x4000, 0x9000));
    assert!(matches!(resumption, Resumption::AbortThread(NtStatus::ACCESS_VIOLATION)));
    assert!(resumption.is_fatal());
    assert_eq!(
        guest.exceptions.lock().as_slice(),
        &[(NtStatus::ACCESS_VIOLATION, true), (NtStatus::ACCESS_VIOLATION, false)]
    );

    let stats = runtime.status().dispatch;
    assert_eq!(stats.exceptions, 1);
    assert_eq!(stats.second_chance, 1);
    assert_eq!(stats.thread_aborts, 1);
}

#[test]
fn test_guard_page_reported_once() {
    let guest = Arc::new(ScriptedDispatcher::handling());
    let runtime = runtime(guest.clone());
    let guarded = ProtFlags {
        guard: true,
        ..ProtFlags::READ_WRITE
    };
    let region = runtime.space().reserve(PAGE_SIZE, guarded).unwrap();

    let trap = HostTrap::new(
        TrapKind::MemoryFault {
            address: region.base,
            access: AccessKind::Read,
        },
        None,
    );
    continued(runtime.dispatch().handle_trap(trap, context(0x4000, 0x9000)));
    assert_eq!(
        guest.exceptions.lock().as_slice(),
        &[(NtStatus::GUARD_PAGE_VIOLATION, true)]
    );

    // The guard is gone; the page is now plain read-write
    assert!(runtime.space().check_access(region.base, PAGE_SIZE, AccessKind::Write));
}

#[test]
fn test_fault_on_signal_stack_aborts_thread() {
    let guest = Arc::new(ScriptedDispatcher::handling());
    let runtime = runtime(guest.clone());
    let slot = runtime.space().alloc_teb().unwrap();
    let signal_stack = runtime.space().tebs().signal_stack(slot);

    let trap = HostTrap::new(
        TrapKind::MemoryFault {
            address: 0x10,
            access: AccessKind::Read,
        },
        Some(slot),
    );
    let sp = (signal_stack.base + signal_stack.size / 2) as u64;
    let resumption = runtime.dispatch().handle_trap(trap, context(0x4000, sp));
    assert!(matches!(resumption, Resumption::AbortThread(NtStatus::ACCESS_VIOLATION)));
    assert!(guest.exceptions.lock().is_empty());
}

#[test]
fn test_kernel_stack_guard_is_overflow() {
    let runtime = runtime(Arc::new(ScriptedDispatcher::handling()));
    let slot = runtime.space().alloc_teb().unwrap();
    let guard = runtime.space().tebs().kernel_stack(slot).base - PAGE_SIZE;

    let trap = HostTrap::new(
        TrapKind::MemoryFault {
            address: guard,
            access: AccessKind::Write,
        },
        Some(slot),
    );
    let resumption = runtime.dispatch().handle_trap(trap, context(0x4000, 0x9000));
    assert!(matches!(resumption, Resumption::AbortThread(NtStatus::STACK_OVERFLOW)));
}

#[test]
fn test_breakpoint_reports_its_own_address() {
    let guest = Arc::new(ScriptedDispatcher::handling());
    let runtime = runtime(guest.clone());

    let trap = HostTrap::new(TrapKind::Breakpoint, None);
    let ctx = continued(runtime.dispatch().handle_trap(trap, context(0x4001, 0x9000)));
    assert_eq!(ctx.native.instruction_pointer(), 0x4000);
    assert_eq!(guest.exceptions.lock().as_slice(), &[(NtStatus::BREAKPOINT, true)]);
}

#[test]
fn test_arithmetic_and_instruction_faults() {
    let guest = Arc::new(ScriptedDispatcher::handling());
    let runtime = runtime(guest.clone());

    for kind in [
        TrapKind::Arithmetic { code: 1 },
        TrapKind::Arithmetic { code: 3 },
        TrapKind::IllegalInstruction,
        TrapKind::PrivilegedInstruction,
        TrapKind::SingleStep,
    ] {
        continued(runtime.dispatch().handle_trap(HostTrap::new(kind, None), context(0x4000, 0x9000)));
    }
    let codes: Vec<NtStatus> = guest.exceptions.lock().iter().map(|(code, _)| *code).collect();
    assert_eq!(
        codes,
        vec![
            NtStatus::INTEGER_DIVIDE_BY_ZERO,
            NtStatus::FLOAT_DIVIDE_BY_ZERO,
            NtStatus::ILLEGAL_INSTRUCTION,
            NtStatus::PRIVILEGED_INSTRUCTION,
            NtStatus::SINGLE_STEP,
        ]
    );
}

#[test]
fn test_quit_and_unknown_traps() {
    let runtime = runtime(Arc::new(ScriptedDispatcher::handling()));
    let quit = runtime
        .dispatch()
        .handle_trap(HostTrap::new(TrapKind::Quit, None), context(0, 0));
    assert!(matches!(quit, Resumption::AbortThread(NtStatus::SUCCESS)));

    let unknown = runtime.dispatch().handle_trap(
        HostTrap::new(TrapKind::Unknown { signal: 31, code: 0 }, None),
        context(0, 0),
    );
    assert!(matches!(unknown, Resumption::AbortThread(NtStatus::UNHANDLED_EXCEPTION)));
    assert_eq!(runtime.status().dispatch.unresolved, 1);
}

#[test]
fn test_ctrl_events() {
    let runtime = runtime(Arc::new(ScriptedDispatcher::default()));
    let interrupt = runtime
        .dispatch()
        .handle_trap(HostTrap::new(TrapKind::Interrupt, None), context(0x4000, 0x9000));
    assert_eq!(continued(interrupt).native.instruction_pointer(), 0x4000);

    let ctrl_break = runtime
        .dispatch()
        .call_ctrl_routine(CtrlEvent::CtrlBreak, context(0x4000, 0x9000));
    assert!(matches!(ctrl_break, Resumption::ExitProcess(NtStatus::CONTROL_C_EXIT)));
}

#[test]
fn test_raise_noncontinuable() {
    let guest = Arc::new(ScriptedDispatcher::handling());
    let runtime = runtime(guest.clone());
    let record = ExceptionRecord::new(NtStatus(0xe06d_7363), 0x4000).noncontinuable();
    let resumption = runtime
        .dispatch()
        .call_raise_user_exception_dispatcher(record, context(0x4000, 0x9000));
    assert!(matches!(resumption, Resumption::AbortThread(NtStatus::NONCONTINUABLE_EXCEPTION)));
}

#[test]
fn test_raise_continuable_resumes() {
    let guest = Arc::new(ScriptedDispatcher::handling());
    let runtime = runtime(guest.clone());
    let record = ExceptionRecord::new(NtStatus(0x4001_0006), 0x4000).with_params(&[5, 0x1234]);
    continued(
        runtime
            .dispatch()
            .call_raise_user_exception_dispatcher(record, context(0x4000, 0x9000)),
    );
    assert_eq!(guest.exceptions.lock().len(), 1);
}

#[test]
fn test_user_apc_dispatch() {
    let guest = Arc::new(ScriptedDispatcher::default());
    let runtime = runtime(guest.clone());

    let call = ApcCall::User {
        func: 0x7000_2000,
        args: [7, 8, 9],
    };
    continued(runtime.dispatch().call_user_apc_dispatcher(call, context(0x4000, 0x9000)));
    continued(
        runtime
            .dispatch()
            .call_user_apc_dispatcher(ApcCall::None, context(0x4000, 0x9000)),
    );

    assert_eq!(guest.apcs.lock().as_slice(), &[(0x7000_2000, [7, 8, 9])]);
    assert_eq!(runtime.status().dispatch.apcs, 1);
}

#[test]
fn test_user_callback_returns_guest_result() {
    let runtime = runtime(Arc::new(ScriptedDispatcher::default()));
    let result = runtime.dispatch().call_user_callback(42, b"abc");
    assert_eq!(result.status, NtStatus(42));
    assert_eq!(&result.data[..], b"cba");
}

#[test]
fn test_suspend_without_session_resumes() {
    let runtime = runtime(Arc::new(ScriptedDispatcher::default()));
    let slot = runtime.space().alloc_teb().unwrap();
    let ctx = continued(
        runtime
            .dispatch()
            .handle_trap(HostTrap::new(TrapKind::Suspend, Some(slot)), context(0x4000, 0x9000)),
    );
    assert_eq!(ctx.native.stack_pointer(), 0x9000);
}
