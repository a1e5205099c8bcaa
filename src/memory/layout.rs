/*!
 * Environment Block Layout
 *
 * Per-thread memory is carved out of two arenas reserved at startup:
 *
 * ```text
 * TEB arena (64 KiB aligned blocks)      kernel-stack arena
 * +--------+-----------------+           +-------+------------------+
 * | TEB    | signal stack    |  slot 0   | guard | kernel stack     |  slot 0
 * | 0x3800 | 0x10000-0x3800  |           | page  |                  |
 * +--------+-----------------+           +-------+------------------+
 * | TEB    | signal stack    |  slot 1   | guard | kernel stack     |  slot 1
 * ```
 *
 * The signal stack of a thread is always `(teb & !0xffff) + 0x3800`, so it is
 * never stored. Blocks are disjoint by construction and a slot keeps its
 * addresses for its whole lifetime.
 */

use super::host::{HostMapper, Placement};
use super::types::{MemoryError, MemoryResult, ProtFlags, Region, ViewKind};
use crate::core::limits::{
    KERNEL_STACK_SIZE, PAGE_SIZE, SIGNAL_STACK_MASK, SIGNAL_STACK_SIZE, TEB_BLOCK_SIZE, TEB_SIZE,
    WOW_TEB_OFFSET,
};
use crate::core::types::{Address, SlotId};
use parking_lot::Mutex;

/// Signal stack base for a TEB address
#[inline(always)]
pub const fn signal_stack_for(teb: Address) -> Address {
    (teb & !SIGNAL_STACK_MASK) + TEB_SIZE
}

/// Preallocated TEB blocks and kernel stacks
pub struct TebArena {
    blocks: Region,
    kernel_stacks: Region,
    capacity: usize,
    free: Mutex<Vec<u32>>,
}

impl TebArena {
    /// Reserve both arenas through `mapper`
    pub fn reserve(mapper: &dyn HostMapper, capacity: usize) -> MemoryResult<Self> {
        if capacity == 0 {
            return Err(MemoryError::SlotsExhausted { capacity });
        }
        let size = capacity * TEB_BLOCK_SIZE;

        // Over-reserve one block so the arena can be aligned to the signal stack mask
        let raw = mapper.map(Placement::Anywhere, size + TEB_BLOCK_SIZE, ProtFlags::READ_WRITE)?;
        let base = (raw + SIGNAL_STACK_MASK) & !SIGNAL_STACK_MASK;
        if base > raw {
            mapper.unmap(raw, base - raw)?;
        }
        let tail = raw + size + TEB_BLOCK_SIZE - (base + size);
        if tail > 0 {
            mapper.unmap(base + size, tail)?;
        }

        let kernel_size = capacity * KERNEL_STACK_SIZE;
        let kernel_base = match mapper.map(Placement::Anywhere, kernel_size, ProtFlags::READ_WRITE) {
            Ok(addr) => addr,
            Err(err) => {
                let _ = mapper.unmap(base, size);
                return Err(err);
            }
        };
        for slot in 0..capacity {
            mapper.protect(
                kernel_base + slot * KERNEL_STACK_SIZE,
                PAGE_SIZE,
                ProtFlags::PROT_NONE,
            )?;
        }

        Ok(Self {
            blocks: Region::new(base, size),
            kernel_stacks: Region::new(kernel_base, kernel_size),
            capacity,
            free: Mutex::new((0..capacity as u32).rev().collect()),
        })
    }

    /// Arena views to record in the address space
    pub(crate) fn regions(&self) -> [(Region, ViewKind); 2] {
        [
            (self.blocks, ViewKind::TebArena),
            (self.kernel_stacks, ViewKind::KernelStacks),
        ]
    }

    /// Page indices (inside the kernel-stack view) of every guard page
    pub(crate) fn kernel_guard_pages(&self) -> impl Iterator<Item = usize> {
        (0..self.capacity).map(|slot| slot * KERNEL_STACK_SIZE / PAGE_SIZE)
    }

    /// Take a free slot; its TEB is zeroed
    pub fn alloc(&self) -> MemoryResult<SlotId> {
        let index = self.free.lock().pop().ok_or(MemoryError::SlotsExhausted {
            capacity: self.capacity,
        })?;
        let slot = SlotId(index);
        // SAFETY: the block belongs to this arena and the slot was free
        unsafe { std::ptr::write_bytes(self.teb_address(slot) as *mut u8, 0, TEB_SIZE) };
        Ok(slot)
    }

    /// Return a slot to the free list
    pub fn free(&self, slot: SlotId) -> MemoryResult<()> {
        if slot.index() >= self.capacity {
            return Err(MemoryError::InvalidAddress(slot.index()));
        }
        let mut free = self.free.lock();
        if free.contains(&slot.0) {
            return Err(MemoryError::InvalidAddress(self.teb_address(slot)));
        }
        free.push(slot.0);
        Ok(())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    #[inline]
    pub fn teb_region(&self) -> Region {
        self.blocks
    }

    #[inline]
    pub fn teb_address(&self, slot: SlotId) -> Address {
        self.blocks.base + slot.index() * TEB_BLOCK_SIZE
    }

    /// 32-bit TEB of a compatibility-mode thread
    #[inline]
    pub fn wow_teb_address(&self, slot: SlotId) -> Address {
        self.teb_address(slot) + WOW_TEB_OFFSET
    }

    pub fn signal_stack(&self, slot: SlotId) -> Region {
        Region::new(signal_stack_for(self.teb_address(slot)), SIGNAL_STACK_SIZE)
    }

    /// Usable kernel stack, excluding its guard page
    pub fn kernel_stack(&self, slot: SlotId) -> Region {
        let base = self.kernel_stacks.base + slot.index() * KERNEL_STACK_SIZE;
        Region::new(base + PAGE_SIZE, KERNEL_STACK_SIZE - PAGE_SIZE)
    }

    pub fn slot_of_teb(&self, teb: Address) -> Option<SlotId> {
        if !self.blocks.contains(teb) || (teb - self.blocks.base) % TEB_BLOCK_SIZE != 0 {
            return None;
        }
        Some(SlotId(((teb - self.blocks.base) / TEB_BLOCK_SIZE) as u32))
    }

    /// Slot whose signal stack contains `addr`
    pub fn signal_stack_owner(&self, addr: Address) -> Option<SlotId> {
        if !self.blocks.contains(addr) {
            return None;
        }
        let index = (addr - self.blocks.base) / TEB_BLOCK_SIZE;
        let slot = SlotId(index as u32);
        self.signal_stack(slot).contains(addr).then_some(slot)
    }

    /// Whether `addr` hits the guard page at the bottom of a kernel stack
    pub fn is_kernel_stack_guard(&self, addr: Address) -> bool {
        self.kernel_stacks.contains(addr)
            && (addr - self.kernel_stacks.base) % KERNEL_STACK_SIZE < PAGE_SIZE
    }
}
