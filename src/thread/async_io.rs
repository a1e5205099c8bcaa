/*!
 * Async I/O Requests
 *
 * In-flight asynchronous operations live in a process-wide arena and are
 * chained FIFO into the issuing thread's control block. A request leaves
 * the arena when its callback reports completion or its handle is closed.
 */

use super::lifecycle::{ThreadControlBlock, ThreadManager};
use super::types::{ThreadError, ThreadResult, NO_SLOT};
use crate::core::limits::ASYNC_IO_CAPACITY;
use crate::core::status::NtStatus;
use crate::core::types::{ObjHandle, SlotId};
use crate::ipc::{ApcCall, ApcResult, AsyncDescriptor, SystemApcHandler};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Arena index of an async request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AsyncIoId(pub u32);

impl fmt::Display for AsyncIoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

/// Status block handed to a completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatus {
    pub status: NtStatus,
    pub information: u64,
}

/// Completion callback; returns true once the operation is complete, false to restart
pub type AsyncCallback = Box<dyn FnMut(&mut IoStatus) -> bool + Send>;

/// Result of delivering a completion to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncIoOutcome {
    Completed(IoStatus),
    Restart,
}

struct AsyncIoRequest {
    callback: Option<AsyncCallback>,
    next: u32,
    handle: ObjHandle,
    user: u64,
    owner: SlotId,
}

pub(crate) struct IoArena {
    entries: Vec<Option<AsyncIoRequest>>,
    free: Vec<u32>,
}

impl IoArena {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, request: AsyncIoRequest) -> ThreadResult<u32> {
        if let Some(index) = self.free.pop() {
            self.entries[index as usize] = Some(request);
            return Ok(index);
        }
        if self.entries.len() >= ASYNC_IO_CAPACITY {
            return Err(ThreadError::AsyncIoExhausted {
                capacity: ASYNC_IO_CAPACITY,
            });
        }
        self.entries.push(Some(request));
        Ok((self.entries.len() - 1) as u32)
    }

    fn get(&self, index: u32) -> Option<&AsyncIoRequest> {
        self.entries.get(index as usize)?.as_ref()
    }

    fn get_mut(&mut self, index: u32) -> Option<&mut AsyncIoRequest> {
        self.entries.get_mut(index as usize)?.as_mut()
    }

    fn remove(&mut self, index: u32) -> Option<AsyncIoRequest> {
        let request = self.entries.get_mut(index as usize)?.take()?;
        self.free.push(index);
        Some(request)
    }

    /// Detach `index` from the FIFO of `block`
    fn unlink(&mut self, block: &mut ThreadControlBlock, index: u32) {
        let mut prev = NO_SLOT;
        let mut cursor = block.io_head;
        while cursor != NO_SLOT {
            let next = self.get(cursor).map_or(NO_SLOT, |r| r.next);
            if cursor == index {
                match self.get_mut(prev) {
                    Some(p) => p.next = next,
                    None => block.io_head = next,
                }
                if block.io_tail == index {
                    block.io_tail = prev;
                }
                return;
            }
            prev = cursor;
            cursor = next;
        }
    }

    fn chain(&self, head: u32) -> Vec<AsyncIoId> {
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(request) = self.get(cursor) {
            out.push(AsyncIoId(cursor));
            cursor = request.next;
        }
        out
    }
}

impl ThreadManager {
    /// Issue an async request on `handle`, appended to the FIFO of `slot`
    ///
    /// `user` is the completion value reported to the coordinator.
    pub fn alloc_fileio(
        &self,
        slot: SlotId,
        handle: ObjHandle,
        user: u64,
        callback: AsyncCallback,
    ) -> ThreadResult<AsyncIoId> {
        self.with_table(|table| {
            let block = table.get_mut(slot)?;
            let mut io = self.io.lock();
            let index = io.insert(AsyncIoRequest {
                callback: Some(callback),
                next: NO_SLOT,
                handle,
                user,
                owner: slot,
            })?;
            match io.get_mut(block.io_tail) {
                Some(tail) => tail.next = index,
                None => block.io_head = index,
            }
            block.io_tail = index;
            debug!(%slot, handle, id = index, "Async I/O queued");
            Ok(AsyncIoId(index))
        })
    }

    /// Run the callback of `id` with the host result
    ///
    /// On completion the request is unlinked and released, then one
    /// completion record is posted through the owner's session.
    pub fn complete(&self, id: AsyncIoId, status: NtStatus, information: u64) -> ThreadResult<AsyncIoOutcome> {
        let mut callback = self
            .io
            .lock()
            .get_mut(id.0)
            .and_then(|request| request.callback.take())
            .ok_or(ThreadError::UnknownRequest(id.0))?;

        let mut io_status = IoStatus { status, information };
        if !callback(&mut io_status) {
            if let Some(request) = self.io.lock().get_mut(id.0) {
                request.callback = Some(callback);
            }
            return Ok(AsyncIoOutcome::Restart);
        }

        let released = self.with_table(|table| {
            let mut io = self.io.lock();
            let owner = io.get(id.0)?.owner;
            let session = match table.get_mut(owner) {
                Ok(block) => {
                    io.unlink(block, id.0);
                    block.session().cloned()
                }
                Err(_) => None,
            };
            let request = io.remove(id.0)?;
            Some((owner, request.handle, request.user, session))
        });

        let Some((owner, handle, user, session)) = released else {
            debug!(%id, "Async I/O completed after its handle was closed");
            return Ok(AsyncIoOutcome::Completed(io_status));
        };
        let session = session.ok_or(ThreadError::NoChannel(owner))?;
        session
            .report_async_completion(handle, user, io_status.status, io_status.information)
            .map_err(|err| ThreadError::Completion(NtStatus::from(&err)))?;
        debug!(%id, handle, status = %io_status.status, "Async I/O completed");
        Ok(AsyncIoOutcome::Completed(io_status))
    }

    /// Drop a request without running its callback
    pub fn release_fileio(&self, id: AsyncIoId) -> ThreadResult<()> {
        self.with_table(|table| {
            let mut io = self.io.lock();
            let owner = io.get(id.0).ok_or(ThreadError::UnknownRequest(id.0))?.owner;
            if let Ok(block) = table.get_mut(owner) {
                io.unlink(block, id.0);
            }
            io.remove(id.0);
            Ok(())
        })
    }

    /// Drop every pending request on `handle`; returns how many were dropped
    pub fn close_handle(&self, handle: ObjHandle) -> usize {
        self.with_table(|table| {
            let mut io = self.io.lock();
            let doomed: Vec<(u32, SlotId)> = io
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| {
                    let request = entry.as_ref()?;
                    (request.handle == handle).then_some((index as u32, request.owner))
                })
                .collect();
            for &(index, owner) in &doomed {
                if let Ok(block) = table.get_mut(owner) {
                    io.unlink(block, index);
                }
                io.remove(index);
            }
            if !doomed.is_empty() {
                debug!(handle, dropped = doomed.len(), "Pending async I/O cancelled");
            }
            doomed.len()
        })
    }

    /// Pending requests of `slot` in delivery order
    pub fn pending(&self, slot: SlotId) -> ThreadResult<Vec<AsyncIoId>> {
        self.with_table(|table| Ok(self.pending_in(table.get(slot)?)))
    }

    /// Wire descriptor for a request
    pub fn async_descriptor(
        &self,
        id: AsyncIoId,
        event: ObjHandle,
        apc: u64,
        apc_context: u64,
        iosb: u64,
    ) -> ThreadResult<AsyncDescriptor> {
        let io = self.io.lock();
        let request = io.get(id.0).ok_or(ThreadError::UnknownRequest(id.0))?;
        Ok(AsyncDescriptor {
            handle: request.handle,
            user: id.0 as u64,
            iosb,
            event,
            apc,
            apc_context,
        })
    }

    pub(crate) fn pending_in(&self, block: &ThreadControlBlock) -> Vec<AsyncIoId> {
        self.io.lock().chain(block.io_head)
    }

    /// Release the whole FIFO of a thread being freed
    pub(crate) fn drop_thread_io(&self, block: &ThreadControlBlock) {
        let mut io = self.io.lock();
        let ids = io.chain(block.io_head);
        if !ids.is_empty() {
            warn!(slot = %block.slot, pending = ids.len(), "Freeing thread with pending async I/O");
        }
        for id in ids {
            io.remove(id.0);
        }
    }
}

impl SystemApcHandler for ThreadManager {
    fn invoke_system_apc(&self, call: &ApcCall) -> ApcResult {
        match *call {
            ApcCall::AsyncIo { user, status } => {
                match self.complete(AsyncIoId(user as u32), status, 0) {
                    Ok(AsyncIoOutcome::Completed(io)) => ApcResult::AsyncIo {
                        status: io.status,
                        total: io.information,
                    },
                    Ok(AsyncIoOutcome::Restart) => ApcResult::AsyncIo {
                        status: NtStatus::PENDING,
                        total: 0,
                    },
                    Err(err) => ApcResult::AsyncIo {
                        status: NtStatus::from(&err),
                        total: 0,
                    },
                }
            }
            _ => ApcResult::None,
        }
    }
}
