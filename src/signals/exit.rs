/*!
 * Exit Paths
 * Non-returning thread and process termination
 *
 * None of these release shared structures: once the latch leaves
 * `Running` the thread list is frozen and only the host exit path runs.
 */

use crate::core::latch::ProcessLatch;
use crate::core::status::NtStatus;
use crate::thread::post_current_exit;

/// Host exit code for a guest status; a nonzero status never truncates to zero
pub fn get_unix_exit_code(status: NtStatus) -> i32 {
    let raw = status.raw();
    if raw != 0 && raw & 0xff == 0 {
        return 1;
    }
    (raw & 0xff) as i32
}

/// Terminate the calling host thread
///
/// Joiners are released through the thread's exit pipe before the raw
/// `exit` syscall; the host thread's own stack is not reclaimed.
pub fn abort_thread(status: NtStatus) -> ! {
    post_current_exit(status);
    loop {
        // SAFETY: SYS_exit terminates only the calling thread and never returns
        unsafe {
            libc::syscall(libc::SYS_exit, get_unix_exit_code(status) as libc::c_long);
        }
    }
}

/// Terminate the process immediately, skipping exit handlers
pub fn abort_process(latch: &ProcessLatch, status: NtStatus) -> ! {
    latch.begin_exit();
    latch.terminate();
    // SAFETY: _exit is async-signal-safe and does not return
    unsafe { libc::_exit(get_unix_exit_code(status)) }
}

/// Orderly process exit; runs host exit handlers
pub fn exit_process(latch: &ProcessLatch, status: NtStatus) -> ! {
    latch.begin_exit();
    std::process::exit(get_unix_exit_code(status))
}
