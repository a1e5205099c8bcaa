/*!
 * Guest Dispatcher Interface
 * Entry points the guest side registers for traps, APCs and callbacks
 */

use super::types::{CallbackReturn, CtrlEvent, ExceptionDisposition, ExceptionRecord, SyscallArgs};
use crate::context::TranslatedContext;
use crate::core::status::NtStatus;

/// Guest callback table
///
/// Each method runs on the thread that took the trap, after the host
/// context has been captured. Contexts passed by `&mut` are resumed with
/// whatever the guest leaves in them.
#[cfg_attr(test, mockall::automock)]
pub trait GuestDispatcher: Send + Sync {
    /// Exception dispatcher; called again with `first_chance == false` when
    /// the first pass finds no handler
    fn dispatch_exception(
        &self,
        record: &ExceptionRecord,
        ctx: &mut TranslatedContext,
        first_chance: bool,
    ) -> ExceptionDisposition;

    /// Exception raised explicitly by guest code
    fn raise_user_exception(&self, record: &ExceptionRecord, ctx: &mut TranslatedContext) -> ExceptionDisposition;

    /// User APC routine
    fn dispatch_apc(&self, func: u64, args: [u64; 3], ctx: &mut TranslatedContext);

    /// System call; the returned status is handed to the guest unchanged
    fn dispatch_syscall(&self, args: &SyscallArgs) -> NtStatus;

    /// Initial thunk of a new thread; returns the thread exit status
    fn start_thread(&self, entry: u64, arg: u64, ctx: &mut TranslatedContext) -> NtStatus;

    /// Nested call into guest code from host code
    fn user_callback(&self, id: u32, args: &[u8]) -> CallbackReturn;

    /// Console control routine; `SUCCESS` when a handler took the event
    fn ctrl_routine(&self, event: CtrlEvent) -> NtStatus;
}
