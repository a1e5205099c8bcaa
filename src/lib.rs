/*!
 * Personality Kernel Library
 * Host-side runtime core for running guest-OS binaries on a native host
 *
 * - Address-space layout, TEB slots and stacks
 * - Guest thread lifecycle and async I/O completions
 * - Trap and syscall dispatch into the guest
 * - Context translation and extended-state codec
 * - Coordinator session client
 * - Module load order
 */

pub mod context;
pub mod core;
pub mod ipc;
pub mod loader;
pub mod memory;
pub mod monitoring;
pub mod runtime;
pub mod signals;
pub mod thread;

// Re-exports
pub use crate::core::{
    ErrorCategory, NtStatus, ProcessLatch, RuntimeConfig, RuntimeError, RuntimeResult,
};
pub use context::{ContextFlags, NativeContext, TranslatedContext, WireContext};
pub use ipc::{FdChannel, SelectOp, SelectOutcome, SessionClient, Timeout};
pub use loader::{LoadOrder, LoadOrderRegistry};
pub use memory::{AddressSpace, MemoryStats};
pub use monitoring::init_tracing;
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStatus};
pub use signals::{DispatchCore, GuestDispatcher, Resumption};
pub use thread::{ThreadManager, ThreadStart};
