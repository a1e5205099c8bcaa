/*!
 * Host Trap Tests
 * Real signals taken on a guest thread, dispatched from the trampoline
 */

use super::common::ScriptedDispatcher;
use personality_kernel::signals::CtrlEvent;
use personality_kernel::{NtStatus, Runtime, RuntimeConfig};
use pretty_assertions::assert_eq;
use std::sync::Arc;

// Handlers are process-wide, so this is the only test in the binary that installs them
#[test]
fn test_interrupt_on_guest_thread_resumes_after_dispatch() {
    let guest = Arc::new(ScriptedDispatcher {
        raise_in_start: Some(libc::SIGINT),
        ..ScriptedDispatcher::default()
    });
    let runtime = Runtime::builder(guest.clone())
        .with_config(RuntimeConfig::default().with_thread_capacity(2))
        .build()
        .unwrap();
    runtime.install_host_handlers().unwrap();

    let threads = runtime.threads();
    let slot = threads.allocate().unwrap();
    threads.start(slot, 0x1000, 7, false).unwrap();

    // The start routine only returns its argument if raise() came back intact
    assert_eq!(threads.join(slot).unwrap(), NtStatus(7));
    threads.free(slot).unwrap();
    assert_eq!(*guest.ctrl_events.lock(), vec![CtrlEvent::CtrlC]);
    assert_eq!(runtime.dispatch().stats().traps, 1);
}
