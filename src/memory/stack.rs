/*!
 * Guest Thread Stacks
 */

use super::space::{round_up, AddressSpace};
use super::types::{MemoryError, MemoryResult, ProtFlags, Region, ViewKind};
use crate::core::limits::{DEFAULT_STACK_COMMIT, DEFAULT_STACK_RESERVE, PAGE_SIZE};
use crate::core::types::{Address, Size};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A guest stack reservation
///
/// The lowest page is never committed. The page right below the committed
/// area is a guard page; touching it commits it and moves the guard down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStack {
    pub region: Region,
    /// Highest address (initial stack pointer)
    pub base: Address,
    /// Lowest committed address
    pub limit: Address,
}

impl AddressSpace {
    /// Reserve a stack of `reserve` bytes with `commit` bytes committed at the top
    pub fn alloc_thread_stack(&self, reserve: Size, commit: Size) -> MemoryResult<ThreadStack> {
        let reserve = round_up(if reserve == 0 { DEFAULT_STACK_RESERVE } else { reserve });
        let commit = round_up(if commit == 0 { DEFAULT_STACK_COMMIT } else { commit });
        if commit + 2 * PAGE_SIZE > reserve {
            return Err(MemoryError::AlignmentError {
                address: reserve,
                alignment: commit + 2 * PAGE_SIZE,
            });
        }

        let region = self.reserve_uncommitted(reserve, ViewKind::ThreadStack)?;
        let limit = region.end() - commit;
        let guard = ProtFlags {
            guard: true,
            ..ProtFlags::READ_WRITE
        };
        let committed = self
            .commit(limit, commit, ProtFlags::READ_WRITE)
            .and_then(|_| self.commit(limit - PAGE_SIZE, PAGE_SIZE, guard));
        if let Err(err) = committed {
            let _ = self.release(region.base);
            return Err(err);
        }

        debug!(
            base = format_args!("{:#x}", region.end()),
            limit = format_args!("{:#x}", limit),
            reserve,
            "Thread stack allocated"
        );
        Ok(ThreadStack {
            region,
            base: region.end(),
            limit,
        })
    }
}
