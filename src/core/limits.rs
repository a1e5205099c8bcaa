/*!
 * System Limits and Constants
 *
 * Centralized location for the address-space layout and wire sizes.
 * Organized by domain for maintainability and discoverability.
 *
 * ## Conventions
 * - Values are grouped by domain (layout, threads, IPC)
 * - Guest-ABI compatible values are marked with [GUEST-ABI]
 * - Coordinator wire values are marked with [WIRE]
 */

// =============================================================================
// ADDRESS-SPACE LAYOUT
// =============================================================================

/// Host page size assumed by the layout
pub const PAGE_SIZE: usize = 0x1000;

/// Page mask for rounding
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Size of the guest thread environment block (64-bit TEB + 32-bit TEB + debug info)
/// [GUEST-ABI]
pub const TEB_SIZE: usize = 0x3800;

/// Signal stack alignment mask; every TEB block starts on this boundary
pub const SIGNAL_STACK_MASK: usize = 0xffff;

/// Size of one TEB block (TEB followed by the thread's signal stack)
pub const TEB_BLOCK_SIZE: usize = SIGNAL_STACK_MASK + 1;

/// Signal stack size, the remainder of the TEB block
pub const SIGNAL_STACK_SIZE: usize = TEB_BLOCK_SIZE - TEB_SIZE;

/// Kernel stack used for thread startup and syscalls
pub const KERNEL_STACK_SIZE: usize = 0x20000;

/// Kernel stack that must stay free below a trap frame for its dispatch
pub const MIN_KERNEL_STACK: usize = 0x8000;

/// Offset of the 32-bit TEB inside the 64-bit one
/// [GUEST-ABI]
pub const WOW_TEB_OFFSET: usize = 0x2000;

/// Offset of the GDI batch area in the 64-bit TEB, which hosts the thread data
/// [GUEST-ABI]
pub const GDI_TEB_BATCH_OFFSET: usize = 0x2f0;

/// Size of the GDI batch area
/// [GUEST-ABI]
pub const GDI_TEB_BATCH_SIZE: usize = 0x4e8;

/// Highest user address reachable by a 32-bit guest without large-address mode
pub const LIMIT_2GB: usize = 0x7fff_ffff;

/// Highest user address reachable by a 32-bit guest with large-address mode
pub const LIMIT_4GB: usize = 0xffff_ffff;

/// Default number of TEB slots reserved at startup
pub const DEFAULT_THREAD_CAPACITY: usize = 256;

/// Default guest stack reservation
pub const DEFAULT_STACK_RESERVE: usize = 0x10_0000;

/// Default guest stack commit
pub const DEFAULT_STACK_COMMIT: usize = 0x1_0000;

// =============================================================================
// COORDINATOR PROTOCOL
// =============================================================================

/// Fixed size of every request header
/// [WIRE]
pub const REQUEST_HEADER_SIZE: usize = 64;

/// Fixed size of every reply header
/// [WIRE]
pub const REPLY_HEADER_SIZE: usize = 64;

/// Size of a wake-up record on the wait descriptor
/// [WIRE]
pub const WAKE_UP_REPLY_SIZE: usize = 16;

/// Maximum variable-length payload accepted in a reply
pub const MAX_REPLY_DATA: usize = 64 * 1024;

/// Completion records that can be staged while a call is in flight
pub const COMPLETION_STAGING_CAPACITY: usize = 64;

// =============================================================================
// ASYNC I/O
// =============================================================================

/// Preallocated async I/O request slots per process
pub const ASYNC_IO_CAPACITY: usize = 1024;

const _: () = assert!(TEB_SIZE + SIGNAL_STACK_SIZE == TEB_BLOCK_SIZE);
const _: () = assert!(KERNEL_STACK_SIZE % PAGE_SIZE == 0);
