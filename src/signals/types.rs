/*!
 * Dispatch Types
 * Host traps, guest exception records and dispatch outcomes
 */

use crate::context::{ContextError, NativeContext, TranslatedContext};
use crate::core::status::{errno_to_status, NtStatus};
use crate::core::types::{Address, SlotId};
use crate::ipc::IpcError;
use crate::memory::AccessKind;
use crate::thread::{RecoveryPoint, ThreadError};
use bytes::Bytes;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dispatch operation result
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Dispatch core errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Trap has no guest exception policy: signal {signal}, code {code}")]
    Unresolved { signal: i32, code: i32 },

    #[error("Trap raised on a thread without a guest TEB")]
    NoGuestThread,

    #[error("Host trap handlers already installed")]
    AlreadyInstalled,

    #[error("Host trap handler setup failed: {0}")]
    Install(Errno),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Thread(#[from] ThreadError),
}

impl From<&DispatchError> for NtStatus {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::Unresolved { .. } => NtStatus::UNHANDLED_EXCEPTION,
            DispatchError::NoGuestThread => NtStatus::INVALID_PARAMETER,
            DispatchError::AlreadyInstalled => NtStatus::UNSUCCESSFUL,
            DispatchError::Install(errno) => errno_to_status(*errno),
            DispatchError::Context(err) => NtStatus::from(err),
            DispatchError::Ipc(err) => NtStatus::from(err),
            DispatchError::Thread(err) => NtStatus::from(err),
        }
    }
}

/// Host trap classified from the signal number and `si_code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    /// Explicit system call trap; `insn_len` bytes are skipped on resume
    Syscall { insn_len: u8 },
    MemoryFault { address: Address, access: AccessKind },
    /// Arithmetic fault with the host `si_code`
    Arithmetic { code: i32 },
    Breakpoint,
    SingleStep,
    IllegalInstruction,
    PrivilegedInstruction,
    /// Console interrupt
    Interrupt,
    /// Quit request for the current thread
    Quit,
    /// Coordinator suspend request
    Suspend,
    Unknown { signal: i32, code: i32 },
}

/// One trap taken by a guest thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTrap {
    pub kind: TrapKind,
    pub slot: Option<SlotId>,
}

impl HostTrap {
    pub fn new(kind: TrapKind, slot: Option<SlotId>) -> Self {
        Self { kind, slot }
    }
}

pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// Exception flag: the guest must not continue after this exception
pub const EXCEPTION_NONCONTINUABLE: u32 = 0x1;

/// Breakpoint parameter for a plain `int3`
pub const BREAKPOINT_BREAK: u64 = 0;

/// Guest exception record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub code: NtStatus,
    pub flags: u32,
    pub address: u64,
    pub params: [u64; EXCEPTION_MAXIMUM_PARAMETERS],
    pub param_count: u32,
}

impl ExceptionRecord {
    pub fn new(code: NtStatus, address: u64) -> Self {
        Self {
            code,
            flags: 0,
            address,
            params: [0; EXCEPTION_MAXIMUM_PARAMETERS],
            param_count: 0,
        }
    }

    /// Access violation with the `[access, address]` parameter pair
    pub fn memory_fault(code: NtStatus, ip: u64, access: AccessKind, address: Address) -> Self {
        Self::new(code, ip).with_params(&[access as u64, address as u64])
    }

    #[must_use]
    pub fn with_params(mut self, params: &[u64]) -> Self {
        let count = params.len().min(EXCEPTION_MAXIMUM_PARAMETERS);
        self.params[..count].copy_from_slice(&params[..count]);
        self.param_count = count as u32;
        self
    }

    #[must_use]
    pub fn noncontinuable(mut self) -> Self {
        self.flags |= EXCEPTION_NONCONTINUABLE;
        self
    }

    pub fn is_noncontinuable(&self) -> bool {
        self.flags & EXCEPTION_NONCONTINUABLE != 0
    }

    pub fn params(&self) -> &[u64] {
        &self.params[..self.param_count as usize]
    }
}

/// Answer of the guest exception dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionDisposition {
    /// Resume with the (possibly modified) context
    ContinueExecution,
    /// No handler accepted the exception
    ContinueSearch,
}

/// How the interrupted code resumes after a dispatch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resumption {
    /// Restore this context into the interrupted thread
    Continue(TranslatedContext),
    /// Terminate the current thread only
    AbortThread(NtStatus),
    /// Terminate the process without running exit handlers
    AbortProcess(NtStatus),
    /// Orderly process exit
    ExitProcess(NtStatus),
    /// Unwind host code to its registered recovery point
    RecoverHost(RecoveryPoint),
}

impl Resumption {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Resumption::Continue(_) | Resumption::RecoverHost(_))
    }
}

/// System call number and arguments marshalled from the trapping context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallArgs {
    pub number: u32,
    /// Register arguments; unused on 32-bit guests
    pub args: [u64; 4],
    /// Guest address of the remaining stack arguments
    pub stack: u64,
}

impl SyscallArgs {
    pub fn from_context(native: &NativeContext) -> Self {
        match native {
            NativeContext::Amd64(ctx) => Self {
                number: ctx.rax as u32,
                args: [ctx.r10, ctx.rdx, ctx.r8, ctx.r9],
                // return address plus home space
                stack: ctx.rsp + 0x28,
            },
            NativeContext::I386(ctx) => Self {
                number: ctx.eax,
                args: [0; 4],
                stack: ctx.edx as u64,
            },
        }
    }
}

/// Result of a nested user-mode callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackReturn {
    pub status: NtStatus,
    pub data: Bytes,
}

/// Console control events delivered to the guest ctrl routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum CtrlEvent {
    CtrlC = 0,
    CtrlBreak = 1,
}
