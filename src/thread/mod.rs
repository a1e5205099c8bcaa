/*!
 * Thread Module
 * Guest thread control blocks, lifecycle and pending async I/O
 */

pub mod async_io;
pub mod lifecycle;
mod table;
pub mod types;

pub use async_io::{AsyncCallback, AsyncIoId, AsyncIoOutcome, IoStatus};
pub use lifecycle::{
    current_recovery_point, current_teb, current_thread_data, post_current_exit, RecoveryGuard,
    ThreadControlBlock, ThreadLauncher, ThreadManager,
};
pub use types::{
    Lifecycle, RecoveryPoint, ThreadData, ThreadError, ThreadInfo, ThreadResult, ThreadStart,
    ThreadState,
};
