/*!
 * Process Thread Table
 *
 * Control blocks indexed by TEB slot. The process thread list is intrusive:
 * its links live in the TEB-embedded [`ThreadData`] as slot indices, with
 * only the head and tail kept here.
 */

use super::types::{ThreadData, ThreadError, ThreadResult, NO_SLOT};
use super::ThreadControlBlock;
use crate::core::limits::GDI_TEB_BATCH_OFFSET;
use crate::core::types::{Address, SlotId};
use std::ptr::{addr_of, addr_of_mut};

/// Pointer to the [`ThreadData`] embedded in a TEB
///
/// The block is shared by the owning thread, its signal path and whoever
/// holds the table lock, so fields are read and written one at a time
/// through the raw pointer and no reference into it is ever handed out.
/// List links and descriptors are written under the table lock; the
/// recovery word only by the owning thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EmbeddedData(*mut ThreadData);

impl EmbeddedData {
    /// # Safety
    /// `teb` must be a live TEB block handed out by the arena, and stay live
    /// while the handle is used.
    #[inline]
    pub unsafe fn of(teb: Address) -> Self {
        Self((teb + GDI_TEB_BATCH_OFFSET) as *mut ThreadData)
    }

    pub fn init(self, kernel_stack: u64) {
        let mut data = ThreadData::new();
        data.kernel_stack = kernel_stack;
        // SAFETY: live TEB per `of`; the slot is not yet visible to anyone else
        unsafe { self.0.write(data) }
    }

    /// Copy of the whole block
    pub fn snapshot(self) -> ThreadData {
        // SAFETY: live TEB per `of`
        unsafe { self.0.read_volatile() }
    }

    pub fn links(self) -> (u32, u32) {
        // SAFETY: live TEB per `of`
        unsafe { (addr_of!((*self.0).prev).read(), addr_of!((*self.0).next).read()) }
    }

    pub fn set_prev(self, prev: u32) {
        // SAFETY: live TEB per `of`
        unsafe { addr_of_mut!((*self.0).prev).write(prev) }
    }

    pub fn set_next(self, next: u32) {
        // SAFETY: live TEB per `of`
        unsafe { addr_of_mut!((*self.0).next).write(next) }
    }

    pub fn set_start(self, start: u64, param: u64) {
        // SAFETY: live TEB per `of`
        unsafe {
            addr_of_mut!((*self.0).start).write(start);
            addr_of_mut!((*self.0).param).write(param);
        }
    }

    pub fn set_pthread_id(self, id: u64) {
        // SAFETY: live TEB per `of`
        unsafe { addr_of_mut!((*self.0).pthread_id).write(id) }
    }

    pub fn set_channel(self, request: i32, reply: i32, wait: [i32; 2]) {
        // SAFETY: live TEB per `of`
        unsafe {
            addr_of_mut!((*self.0).request_fd).write(request);
            addr_of_mut!((*self.0).reply_fd).write(reply);
            addr_of_mut!((*self.0).wait_fd).write(wait);
            addr_of_mut!((*self.0).apc_fd).write(wait[0]);
        }
    }

    /// Registered recovery point address; read from the signal path too
    pub fn recovery(self) -> u64 {
        // SAFETY: live TEB per `of`
        unsafe { addr_of!((*self.0).recovery).read_volatile() }
    }

    pub fn set_recovery(self, point: u64) {
        // SAFETY: live TEB per `of`
        unsafe { addr_of_mut!((*self.0).recovery).write_volatile(point) }
    }
}

pub(crate) struct ThreadTable {
    blocks: Vec<Option<ThreadControlBlock>>,
    head: u32,
    tail: u32,
    len: usize,
}

impl ThreadTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: (0..capacity).map(|_| None).collect(),
            head: NO_SLOT,
            tail: NO_SLOT,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, slot: SlotId) -> ThreadResult<&ThreadControlBlock> {
        self.blocks
            .get(slot.index())
            .and_then(Option::as_ref)
            .ok_or(ThreadError::InvalidSlot(slot))
    }

    pub fn get_mut(&mut self, slot: SlotId) -> ThreadResult<&mut ThreadControlBlock> {
        self.blocks
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .ok_or(ThreadError::InvalidSlot(slot))
    }

    fn data(&self, index: u32) -> Option<EmbeddedData> {
        let block = self.blocks.get(index as usize)?.as_ref()?;
        Some(block.data())
    }

    /// Insert a block and link it at the tail of the thread list
    pub fn push_back(&mut self, block: ThreadControlBlock) {
        let index = block.slot.0;
        let slot = block.slot.index();
        self.blocks[slot] = Some(block);
        if let Some(data) = self.data(index) {
            data.set_prev(self.tail);
            data.set_next(NO_SLOT);
        }
        match self.data(self.tail) {
            Some(tail) => tail.set_next(index),
            None => self.head = index,
        }
        self.tail = index;
        self.len += 1;
    }

    /// Unlink and remove a block
    pub fn remove(&mut self, slot: SlotId) -> ThreadResult<ThreadControlBlock> {
        let index = slot.0;
        let data = self.data(index).ok_or(ThreadError::InvalidSlot(slot))?;
        let (prev, next) = data.links();
        match self.data(prev) {
            Some(p) => p.set_next(next),
            None => self.head = next,
        }
        match self.data(next) {
            Some(n) => n.set_prev(prev),
            None => self.tail = prev,
        }
        data.set_prev(NO_SLOT);
        data.set_next(NO_SLOT);
        self.len -= 1;
        self.blocks[slot.index()]
            .take()
            .ok_or(ThreadError::InvalidSlot(slot))
    }

    /// Slots in list order
    pub fn slots(&self) -> Vec<SlotId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(data) = self.data(cursor) {
            out.push(SlotId(cursor));
            cursor = data.links().1;
        }
        out
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ThreadControlBlock> {
        self.blocks.iter().filter_map(Option::as_ref)
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut ThreadControlBlock> {
        self.blocks.iter_mut().filter_map(Option::as_mut)
    }
}
