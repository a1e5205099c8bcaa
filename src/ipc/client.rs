/*!
 * Session Client
 * Synchronous request/reply calls to the coordinator for one guest thread
 *
 * Every call holds the channel for the whole exchange with the server
 * signal set blocked. Completion reports that arrive while the channel is
 * held (from a signal handler or another thread) are staged and flushed
 * after the current exchange.
 */

use super::channel::{ChannelFds, CoordinatorChannel, UninterruptedSection};
use super::protocol::{
    select_payload, ApcCall, ApcResult, CompletionRecord, Opcode, Reply, ReplyHeader, Request,
    SelectFields, SelectFlags, SelectOp, SystemApcHandler, WakeUpReply, APC_CALL_SIZE,
    APC_RESULT_SIZE,
};
use super::types::{IpcError, IpcResult, SelectOutcome, Timeout};
use crate::context::{from_wire, to_wire, TranslatedContext, WireContext, WIRE_CONTEXT_SIZE};
use crate::core::limits::{COMPLETION_STAGING_CAPACITY, MAX_REPLY_DATA, REPLY_HEADER_SIZE};
use crate::core::status::NtStatus;
use crate::core::types::ObjHandle;
use crate::monitoring::span_server_call;
use bytes::{Buf, BufMut, Bytes};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use tracing::{debug, trace, warn};

/// Coordinator session of one guest thread
pub struct SessionClient {
    channel: Box<dyn CoordinatorChannel>,
    call: Mutex<()>,
    staged: ArrayQueue<CompletionRecord>,
    next_cookie: AtomicU64,
    stolen: Mutex<Vec<WakeUpReply>>,
    system_apcs: RwLock<Option<Weak<dyn SystemApcHandler>>>,
}

impl SessionClient {
    pub fn new(channel: Box<dyn CoordinatorChannel>) -> Self {
        Self {
            channel,
            call: Mutex::new(()),
            staged: ArrayQueue::new(COMPLETION_STAGING_CAPACITY),
            next_cookie: AtomicU64::new(1),
            stolen: Mutex::new(Vec::new()),
            system_apcs: RwLock::new(None),
        }
    }

    pub fn fds(&self) -> ChannelFds {
        self.channel.fds()
    }

    /// Route system APCs delivered during selects to `handler`
    pub fn set_system_apc_handler(&self, handler: Weak<dyn SystemApcHandler>) {
        *self.system_apcs.write() = Some(handler);
    }

    /// Whether an exchange currently holds the channel
    pub fn is_in_call(&self) -> bool {
        self.call.is_locked()
    }

    /// Completion records waiting for the channel
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Issue one request and read its reply
    pub fn server_call(&self, request: &Request) -> IpcResult<Reply> {
        let span = span_server_call(request.opcode.as_str());
        let reply = {
            let _section = UninterruptedSection::enter()?;
            let _call = self.call.lock();
            self.exchange(request)
        };
        if let Ok(reply) = &reply {
            span.record_status(reply.status.raw());
        }
        self.flush_staged();
        reply
    }

    /// Like [`server_call`](Self::server_call), mapping error statuses to `Refused`
    pub fn server_call_checked(&self, request: &Request) -> IpcResult<Reply> {
        let reply = self.server_call(request)?;
        if reply.status.is_error() {
            return Err(IpcError::Refused(reply.status));
        }
        Ok(reply)
    }

    fn exchange(&self, request: &Request) -> IpcResult<Reply> {
        self.channel.send(&request.header().encode(), &request.data)?;

        let mut raw = [0u8; REPLY_HEADER_SIZE];
        self.channel.recv(&mut raw)?;
        let header = ReplyHeader::decode(&raw);
        let size = header.data_size as usize;
        if size > MAX_REPLY_DATA || size > request.reply_capacity as usize {
            self.discard(size)?;
            return Err(IpcError::Protocol(format!(
                "{} reply carries {} bytes, capacity {}",
                request.opcode, size, request.reply_capacity
            )));
        }
        let data = if size == 0 {
            Bytes::new()
        } else {
            let mut data = vec![0u8; size];
            self.channel.recv(&mut data)?;
            Bytes::from(data)
        };
        Ok(Reply {
            status: header.status,
            fields: header.fields,
            data,
        })
    }

    /// Read and drop `size` reply bytes so the next header stays aligned
    fn discard(&self, mut size: usize) -> IpcResult<()> {
        let mut scratch = [0u8; 256];
        while size > 0 {
            let chunk = size.min(scratch.len());
            self.channel.recv(&mut scratch[..chunk])?;
            size -= chunk;
        }
        Ok(())
    }

    /// Post one completion record
    ///
    /// Allocation free. If the channel is held the record is staged and
    /// sent once the holder's exchange finishes.
    pub fn report_async_completion(
        &self,
        handle: ObjHandle,
        value: u64,
        status: NtStatus,
        information: u64,
    ) -> IpcResult<()> {
        let record = CompletionRecord {
            handle,
            value,
            status,
            information,
        };
        let section = UninterruptedSection::enter()?;
        let Some(call) = self.call.try_lock() else {
            drop(section);
            return self.staged.push(record).map_err(|_| IpcError::StagingFull);
        };
        let reply = self.exchange(&record.to_request());
        drop(call);
        drop(section);
        self.flush_staged();

        let reply = reply?;
        if reply.status.is_error() {
            return Err(IpcError::Refused(reply.status));
        }
        Ok(())
    }

    fn flush_staged(&self) {
        while !self.staged.is_empty() {
            let Ok(_section) = UninterruptedSection::enter() else {
                return;
            };
            let Some(_call) = self.call.try_lock() else {
                return;
            };
            let Some(record) = self.staged.pop() else {
                return;
            };
            match self.exchange(&record.to_request()) {
                Ok(reply) if reply.status.is_error() => {
                    warn!(handle = record.handle, status = %reply.status, "Staged completion refused");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(handle = record.handle, error = %err, "Staged completion lost");
                    return;
                }
            }
        }
    }

    fn invoke_system_apc(&self, call: &ApcCall) -> ApcResult {
        let handler = self.system_apcs.read().as_ref().and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.invoke_system_apc(call),
            None => {
                if !call.is_none() {
                    warn!(?call, "System APC dropped; no handler registered");
                }
                ApcResult::None
            }
        }
    }

    /// Wait on objects with an optional context exchange
    ///
    /// System APCs are run locally and the select is re-issued; a
    /// signal-and-wait signals its object only on the first pass. A pending
    /// select woken for an APC is re-issued to fetch the call. When
    /// `context` is present it is sent with each pass and replaced by the
    /// context the coordinator returns.
    pub fn select(
        &self,
        op: &SelectOp,
        flags: SelectFlags,
        timeout: Timeout,
        mut context: Option<&mut WireContext>,
    ) -> IpcResult<SelectOutcome> {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let mut current = op.clone();
        let mut result = ApcResult::None;
        let mut prev_apc: ObjHandle = 0;

        loop {
            let mut raw_context = [0u8; WIRE_CONTEXT_SIZE];
            let sent_context = match context.as_deref() {
                Some(ctx) => {
                    ctx.encode_into(&mut raw_context);
                    Some(&raw_context[..])
                }
                None => None,
            };
            let fields = SelectFields {
                flags,
                prev_apc,
                cookie,
                timeout: timeout.to_wire(),
                op_size: current.encoded_len() as u32,
                context_size: sent_context.map_or(0, <[u8]>::len) as u32,
            };
            let request = Request::new(Opcode::Select)
                .with_fields(|f| fields.encode(f))
                .with_data(select_payload(&result, &current, sent_context))
                .with_reply_capacity(APC_CALL_SIZE + WIRE_CONTEXT_SIZE);
            let reply = self.server_call(&request)?;

            let mut reply_fields = reply.fields();
            prev_apc = reply_fields.get_u32_le();
            let mut data = &reply.data[..];
            let call = if data.len() >= APC_CALL_SIZE {
                ApcCall::decode(&mut data)?
            } else {
                ApcCall::None
            };
            if data.len() >= WIRE_CONTEXT_SIZE {
                if let Some(ctx) = context.as_deref_mut() {
                    *ctx = WireContext::decode(data)?;
                }
            }

            let mut status = reply.status;
            if status == NtStatus::PENDING {
                status = NtStatus(self.wait_for_wake(cookie)?.signaled as u32);
                if status == NtStatus::USER_APC || status == NtStatus::KERNEL_APC {
                    // the wake only announces the APC; the next pass fetches it
                    result = ApcResult::None;
                    current = current.reissued();
                    debug!(cookie, status = %status, "Pending select woken for APC");
                    continue;
                }
            }
            if status != NtStatus::KERNEL_APC {
                trace!(cookie, status = %status, "Select finished");
                return Ok(SelectOutcome::from_status(status, call));
            }

            result = self.invoke_system_apc(&call);
            current = current.reissued();
            debug!(cookie, ?call, "System APC run during select");
        }
    }

    /// Select without a context
    pub fn wait(&self, op: &SelectOp, flags: SelectFlags, timeout: Timeout) -> IpcResult<SelectOutcome> {
        self.select(op, flags, timeout, None)
    }

    /// Read wake-up records until the one for `cookie`
    ///
    /// Records for other cookies belong to an outer select on this thread
    /// and are kept for it. Cookie zero means the coordinator killed us.
    fn wait_for_wake(&self, cookie: u64) -> IpcResult<WakeUpReply> {
        loop {
            {
                let _section = UninterruptedSection::enter()?;
                let mut stolen = self.stolen.lock();
                if let Some(pos) = stolen.iter().position(|wake| wake.cookie == cookie) {
                    return Ok(stolen.swap_remove(pos));
                }
            }
            let wake = self.channel.recv_wake()?;
            if wake.cookie == 0 {
                return Err(IpcError::Killed(NtStatus(wake.signaled as u32)));
            }
            if wake.cookie == cookie {
                return Ok(wake);
            }
            let _section = UninterruptedSection::enter()?;
            self.stolen.lock().push(wake);
        }
    }

    /// Queue a system APC to `process` and wait for its result
    pub fn queue_process_apc(&self, process: ObjHandle, call: &ApcCall) -> IpcResult<ApcResult> {
        let mut data = Vec::with_capacity(APC_CALL_SIZE);
        call.encode(&mut data);
        let request = Request::new(Opcode::QueueApc)
            .with_fields(|f| f.put_u32_le(process))
            .with_data(Bytes::from(data));
        let reply = self.server_call_checked(&request)?;
        let mut fields = reply.fields();
        let handle = fields.get_u32_le();
        let is_self = fields.get_u32_le() != 0;

        let result = if is_self {
            self.invoke_system_apc(call)
        } else {
            let done = self.wait(
                &SelectOp::Wait { handles: vec![handle], all: false },
                SelectFlags::empty(),
                Timeout::Infinite,
            )?;
            if let SelectOutcome::Status(status) = done {
                return Err(IpcError::Refused(status));
            }
            let request = Request::new(Opcode::GetApcResult)
                .with_fields(|f| f.put_u32_le(handle))
                .with_reply_capacity(APC_RESULT_SIZE);
            let reply = self.server_call_checked(&request)?;
            ApcResult::decode(&mut &reply.data[..])?
        };

        if handle != 0 {
            let close = Request::new(Opcode::CloseHandle).with_fields(|f| f.put_u32_le(handle));
            self.server_call(&close)?;
        }
        Ok(result)
    }

    /// Park this thread in the coordinator until it is resumed
    ///
    /// The captured context is published first so another thread can read
    /// or replace it; the possibly modified context is returned.
    pub fn suspend(&self, ctx: &TranslatedContext) -> IpcResult<TranslatedContext> {
        let machine = ctx.machine();
        let wire = to_wire(ctx, machine)?;
        let request = Request::new(Opcode::SetSuspendContext).with_data(wire.encode());
        self.server_call_checked(&request)?;

        self.wait(&SelectOp::None, SelectFlags::INTERRUPTIBLE, Timeout::Infinite)?;

        let request = Request::new(Opcode::GetSuspendContext).with_reply_capacity(WIRE_CONTEXT_SIZE);
        let reply = self.server_call_checked(&request)?;
        let wire = WireContext::decode(&reply.data)?;
        Ok(from_wire(&wire, machine, ctx.compaction)?)
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("fds", &self.channel.fds())
            .field("staged", &self.staged.len())
            .finish()
    }
}
