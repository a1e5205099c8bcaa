/*!
 * Coordinator Wire Protocol
 *
 * Every request is a fixed 64-byte header followed by `data_size` bytes of
 * variable data; every reply is a fixed 64-byte header followed by its own
 * variable data. All integers are little-endian.
 *
 * ```text
 * request header  | opcode u32 | data_size u32 | reply_capacity u32 | fields[52] |
 * reply header    | status u32 | data_size u32 | fields[56]                      |
 * wake-up record  | cookie u64 | signaled i32  | pad u32                         |
 * ```
 */

use super::types::{IpcError, IpcResult};
use crate::core::limits::{REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE, WAKE_UP_REPLY_SIZE};
use crate::core::status::NtStatus;
use crate::core::types::ObjHandle;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const REQUEST_FIELDS_SIZE: usize = REQUEST_HEADER_SIZE - 12;
pub const REPLY_FIELDS_SIZE: usize = REPLY_HEADER_SIZE - 8;
pub const APC_CALL_SIZE: usize = 40;
pub const APC_RESULT_SIZE: usize = 24;
pub const ASYNC_DESCRIPTOR_SIZE: usize = 40;

/// Request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Opcode {
    Select = 1,
    QueueApc = 2,
    GetApcResult = 3,
    AddCompletion = 4,
    SetSuspendContext = 5,
    GetSuspendContext = 6,
    CloseHandle = 7,
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Opcode::Select,
            2 => Opcode::QueueApc,
            3 => Opcode::GetApcResult,
            4 => Opcode::AddCompletion,
            5 => Opcode::SetSuspendContext,
            6 => Opcode::GetSuspendContext,
            7 => Opcode::CloseHandle,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Select => "select",
            Opcode::QueueApc => "queue_apc",
            Opcode::GetApcResult => "get_apc_result",
            Opcode::AddCompletion => "add_completion",
            Opcode::SetSuspendContext => "set_suspend_context",
            Opcode::GetSuspendContext => "get_suspend_context",
            Opcode::CloseHandle => "close_handle",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed part of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub data_size: u32,
    pub reply_capacity: u32,
    pub fields: [u8; REQUEST_FIELDS_SIZE],
}

impl RequestHeader {
    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut out = [0u8; REQUEST_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.opcode as u32);
        buf.put_u32_le(self.data_size);
        buf.put_u32_le(self.reply_capacity);
        buf.put_slice(&self.fields);
        out
    }

    pub fn decode(raw: &[u8; REQUEST_HEADER_SIZE]) -> IpcResult<Self> {
        let mut buf = &raw[..];
        let code = buf.get_u32_le();
        let opcode = Opcode::from_raw(code)
            .ok_or_else(|| IpcError::Protocol(format!("unknown opcode {code}")))?;
        let data_size = buf.get_u32_le();
        let reply_capacity = buf.get_u32_le();
        let mut fields = [0u8; REQUEST_FIELDS_SIZE];
        buf.copy_to_slice(&mut fields);
        Ok(Self {
            opcode,
            data_size,
            reply_capacity,
            fields,
        })
    }
}

/// Outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub fields: [u8; REQUEST_FIELDS_SIZE],
    pub data: Bytes,
    pub reply_capacity: u32,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            fields: [0; REQUEST_FIELDS_SIZE],
            data: Bytes::new(),
            reply_capacity: 0,
        }
    }

    /// Fill the fixed fields in order
    #[must_use]
    pub fn with_fields(mut self, fill: impl FnOnce(&mut &mut [u8])) -> Self {
        let mut cursor = &mut self.fields[..];
        fill(&mut cursor);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_reply_capacity(mut self, capacity: usize) -> Self {
        self.reply_capacity = capacity as u32;
        self
    }

    pub fn header(&self) -> RequestHeader {
        RequestHeader {
            opcode: self.opcode,
            data_size: self.data.len() as u32,
            reply_capacity: self.reply_capacity,
            fields: self.fields,
        }
    }
}

/// Fixed part of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub status: NtStatus,
    pub data_size: u32,
    pub fields: [u8; REPLY_FIELDS_SIZE],
}

impl ReplyHeader {
    pub fn new(status: NtStatus) -> Self {
        Self {
            status,
            data_size: 0,
            fields: [0; REPLY_FIELDS_SIZE],
        }
    }

    pub fn encode(&self) -> [u8; REPLY_HEADER_SIZE] {
        let mut out = [0u8; REPLY_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.status.raw());
        buf.put_u32_le(self.data_size);
        buf.put_slice(&self.fields);
        out
    }

    pub fn decode(raw: &[u8; REPLY_HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];
        let status = NtStatus(buf.get_u32_le());
        let data_size = buf.get_u32_le();
        let mut fields = [0u8; REPLY_FIELDS_SIZE];
        buf.copy_to_slice(&mut fields);
        Self {
            status,
            data_size,
            fields,
        }
    }
}

/// Received reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: NtStatus,
    pub fields: [u8; REPLY_FIELDS_SIZE],
    pub data: Bytes,
}

impl Reply {
    /// Reader over the fixed fields
    #[inline]
    pub fn fields(&self) -> &[u8] {
        &self.fields
    }
}

/// Record written to the wait descriptor when a pending select finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeUpReply {
    pub cookie: u64,
    pub signaled: i32,
}

impl WakeUpReply {
    pub fn encode(&self) -> [u8; WAKE_UP_REPLY_SIZE] {
        let mut out = [0u8; WAKE_UP_REPLY_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.cookie);
        buf.put_i32_le(self.signaled);
        out
    }

    pub fn decode(raw: &[u8; WAKE_UP_REPLY_SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            cookie: buf.get_u64_le(),
            signaled: buf.get_i32_le(),
        }
    }
}

bitflags! {
    /// Select behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SelectFlags: u32 {
        const ALERTABLE = 0x1;
        const INTERRUPTIBLE = 0x2;
    }
}

/// Object operation of a select
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOp {
    /// No objects; waits for the timeout or an APC
    None,
    Wait { handles: Vec<ObjHandle>, all: bool },
    SignalAndWait { signal: ObjHandle, wait: ObjHandle },
}

impl SelectOp {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            SelectOp::None => buf.put_u32_le(0),
            SelectOp::Wait { handles, all } => {
                buf.put_u32_le(if *all { 2 } else { 1 });
                for handle in handles {
                    buf.put_u32_le(*handle);
                }
            }
            SelectOp::SignalAndWait { signal, wait } => {
                buf.put_u32_le(3);
                buf.put_u32_le(*wait);
                buf.put_u32_le(*signal);
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            SelectOp::None => 4,
            SelectOp::Wait { handles, .. } => 4 + handles.len() * 4,
            SelectOp::SignalAndWait { .. } => 12,
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> IpcResult<Self> {
        if buf.remaining() < 4 {
            return Err(IpcError::Protocol("empty select op".into()));
        }
        match buf.get_u32_le() {
            0 => Ok(SelectOp::None),
            op @ (1 | 2) => {
                let mut handles = Vec::with_capacity(buf.remaining() / 4);
                while buf.remaining() >= 4 {
                    handles.push(buf.get_u32_le());
                }
                Ok(SelectOp::Wait { handles, all: op == 2 })
            }
            3 if buf.remaining() >= 8 => {
                let wait = buf.get_u32_le();
                let signal = buf.get_u32_le();
                Ok(SelectOp::SignalAndWait { signal, wait })
            }
            other => Err(IpcError::Protocol(format!("bad select op {other}"))),
        }
    }

    /// Form used when a select is re-issued, so objects are signaled only once
    pub(crate) fn reissued(&self) -> SelectOp {
        match self {
            SelectOp::SignalAndWait { wait, .. } => SelectOp::Wait {
                handles: vec![*wait],
                all: false,
            },
            other => other.clone(),
        }
    }
}

/// APC delivered by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApcCall {
    #[default]
    None,
    /// Guest APC routine with its three arguments
    User { func: u64, args: [u64; 3] },
    /// Async I/O completion to run locally
    AsyncIo { user: u64, status: NtStatus },
}

impl ApcCall {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match *self {
            ApcCall::None => buf.put_bytes(0, APC_CALL_SIZE),
            ApcCall::User { func, args } => {
                buf.put_u32_le(1);
                buf.put_u32_le(0);
                buf.put_u64_le(func);
                for arg in args {
                    buf.put_u64_le(arg);
                }
            }
            ApcCall::AsyncIo { user, status } => {
                buf.put_u32_le(2);
                buf.put_u32_le(status.raw());
                buf.put_u64_le(user);
                buf.put_bytes(0, 24);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> IpcResult<Self> {
        if buf.remaining() < APC_CALL_SIZE {
            return Err(IpcError::Protocol("short apc call".into()));
        }
        let kind = buf.get_u32_le();
        let status = buf.get_u32_le();
        let mut words = [0u64; 4];
        for word in &mut words {
            *word = buf.get_u64_le();
        }
        match kind {
            0 => Ok(ApcCall::None),
            1 => Ok(ApcCall::User {
                func: words[0],
                args: [words[1], words[2], words[3]],
            }),
            2 => Ok(ApcCall::AsyncIo {
                user: words[0],
                status: NtStatus(status),
            }),
            other => Err(IpcError::Protocol(format!("unknown apc type {other}"))),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ApcCall::None)
    }
}

/// Result of a system APC, returned to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApcResult {
    #[default]
    None,
    AsyncIo { status: NtStatus, total: u64 },
}

impl ApcResult {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match *self {
            ApcResult::None => buf.put_bytes(0, APC_RESULT_SIZE),
            ApcResult::AsyncIo { status, total } => {
                buf.put_u32_le(2);
                buf.put_u32_le(status.raw());
                buf.put_u64_le(total);
                buf.put_u64_le(0);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> IpcResult<Self> {
        if buf.remaining() < APC_RESULT_SIZE {
            return Err(IpcError::Protocol("short apc result".into()));
        }
        let kind = buf.get_u32_le();
        let status = NtStatus(buf.get_u32_le());
        let total = buf.get_u64_le();
        buf.advance(8);
        match kind {
            0 => Ok(ApcResult::None),
            2 => Ok(ApcResult::AsyncIo { status, total }),
            other => Err(IpcError::Protocol(format!("unknown apc result {other}"))),
        }
    }
}

/// Runs system APCs delivered to this process
pub trait SystemApcHandler: Send + Sync {
    fn invoke_system_apc(&self, call: &ApcCall) -> ApcResult;
}

/// Wire async descriptor attached to asynchronous requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AsyncDescriptor {
    pub handle: ObjHandle,
    /// Completion value identifying the request
    pub user: u64,
    /// Guest status block location
    pub iosb: u64,
    pub event: ObjHandle,
    pub apc: u64,
    pub apc_context: u64,
}

impl AsyncDescriptor {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.handle);
        buf.put_u32_le(self.event);
        buf.put_u64_le(self.user);
        buf.put_u64_le(self.iosb);
        buf.put_u64_le(self.apc);
        buf.put_u64_le(self.apc_context);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> IpcResult<Self> {
        if buf.remaining() < ASYNC_DESCRIPTOR_SIZE {
            return Err(IpcError::Protocol("short async descriptor".into()));
        }
        let handle = buf.get_u32_le();
        let event = buf.get_u32_le();
        Ok(Self {
            handle,
            event,
            user: buf.get_u64_le(),
            iosb: buf.get_u64_le(),
            apc: buf.get_u64_le(),
            apc_context: buf.get_u64_le(),
        })
    }
}

/// Completion posted for a finished async operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub handle: ObjHandle,
    pub value: u64,
    pub status: NtStatus,
    pub information: u64,
}

impl CompletionRecord {
    /// Request carrying the record; encoded without heap allocation
    pub fn to_request(&self) -> Request {
        Request::new(Opcode::AddCompletion).with_fields(|f| {
            f.put_u32_le(self.handle);
            f.put_u32_le(self.status.raw());
            f.put_u64_le(self.value);
            f.put_u64_le(self.information);
        })
    }

    pub fn from_fields(mut fields: &[u8]) -> Self {
        let handle = fields.get_u32_le();
        let status = NtStatus(fields.get_u32_le());
        Self {
            handle,
            status,
            value: fields.get_u64_le(),
            information: fields.get_u64_le(),
        }
    }
}

/// Fixed fields of a select request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectFields {
    pub flags: SelectFlags,
    pub prev_apc: ObjHandle,
    pub cookie: u64,
    pub timeout: i64,
    pub op_size: u32,
    pub context_size: u32,
}

impl SelectFields {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.prev_apc);
        buf.put_u64_le(self.cookie);
        buf.put_i64_le(self.timeout);
        buf.put_u32_le(self.op_size);
        buf.put_u32_le(self.context_size);
    }

    pub fn decode(mut fields: &[u8]) -> Self {
        Self {
            flags: SelectFlags::from_bits_truncate(fields.get_u32_le()),
            prev_apc: fields.get_u32_le(),
            cookie: fields.get_u64_le(),
            timeout: fields.get_i64_le(),
            op_size: fields.get_u32_le(),
            context_size: fields.get_u32_le(),
        }
    }
}

/// Variable part of a select request: result, op, optional context
pub(crate) fn select_payload(result: &ApcResult, op: &SelectOp, context: Option<&[u8]>) -> Bytes {
    let mut data = BytesMut::with_capacity(
        APC_RESULT_SIZE + op.encoded_len() + context.map_or(0, <[u8]>::len),
    );
    result.encode(&mut data);
    op.encode(&mut data);
    if let Some(context) = context {
        data.put_slice(context);
    }
    data.freeze()
}
