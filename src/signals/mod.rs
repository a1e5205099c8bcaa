/*!
 * Signals Module
 * Host trap capture and dispatch into the guest
 */

pub mod dispatch;
pub mod dispatcher;
pub mod exit;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod host;
pub mod stats;
pub mod types;

pub use dispatch::{arithmetic_status, DispatchCore};
pub use dispatcher::GuestDispatcher;
pub use exit::{abort_process, abort_thread, exit_process, get_unix_exit_code};
pub use stats::{DispatchStats, DispatchStatsSnapshot};
pub use types::{
    CallbackReturn, CtrlEvent, DispatchError, DispatchResult, ExceptionDisposition,
    ExceptionRecord, HostTrap, Resumption, SyscallArgs, TrapKind, EXCEPTION_NONCONTINUABLE,
};

use crate::core::types::Address;

/// Per-thread host setup before the first guest instruction
///
/// A no-op until the host handlers are installed.
pub fn init_thread(teb: Address) -> DispatchResult<()> {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    if host::is_installed() {
        return host::init_thread(teb);
    }
    let _ = teb;
    Ok(())
}
