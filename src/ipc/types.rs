/*!
 * IPC Types
 * Errors, timeouts and wait outcomes of the coordinator session
 */

use super::protocol::ApcCall;
use crate::context::ContextError;
use crate::core::status::NtStatus;
use crate::core::types::{duration_to_ticks, Ticks};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// IPC operation result
pub type IpcResult<T> = Result<T, IpcError>;

/// Coordinator session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("Coordinator closed the connection")]
    Disconnected,

    #[error("Coordinator I/O failed: {0}")]
    Io(Errno),

    #[error("Malformed coordinator message: {0}")]
    Protocol(String),

    #[error("Coordinator refused request: {0}")]
    Refused(NtStatus),

    #[error("Thread terminated by coordinator with status {0}")]
    Killed(NtStatus),

    #[error("Completion staging queue full")]
    StagingFull,

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl IpcError {
    /// Whether the session can no longer reach the coordinator
    pub fn is_unreachable(&self) -> bool {
        matches!(self, IpcError::Disconnected | IpcError::Io(_) | IpcError::Killed(_))
    }
}

impl From<&IpcError> for NtStatus {
    fn from(err: &IpcError) -> Self {
        match err {
            IpcError::Disconnected | IpcError::Io(_) => NtStatus::PIPE_DISCONNECTED,
            IpcError::Protocol(_) => NtStatus::INVALID_PARAMETER,
            IpcError::Refused(status) | IpcError::Killed(status) => *status,
            IpcError::StagingFull => NtStatus::NO_MEMORY,
            IpcError::Context(err) => NtStatus::from(err),
        }
    }
}

/// Wait deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    Infinite,
    /// Absolute time in 100ns ticks since 1601
    Absolute(Ticks),
    Relative(Duration),
}

impl Timeout {
    /// Wire sentinel for an infinite wait
    pub const INFINITE: i64 = i64::MAX;

    /// Zero-length relative wait
    pub const POLL: Timeout = Timeout::Relative(Duration::ZERO);

    /// Tick encoding: absolute values positive, relative values negative
    pub fn to_wire(self) -> i64 {
        match self {
            Timeout::Infinite => Self::INFINITE,
            Timeout::Absolute(ticks) => ticks,
            Timeout::Relative(duration) => -duration_to_ticks(duration),
        }
    }

    pub fn from_wire(raw: i64) -> Self {
        match raw {
            Self::INFINITE => Timeout::Infinite,
            0 => Timeout::POLL,
            ticks if ticks > 0 => Timeout::Absolute(ticks),
            ticks => Timeout::Relative(Duration::from_nanos(ticks.unsigned_abs().saturating_mul(100))),
        }
    }
}

/// How a select or wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Object at this index was signaled
    Satisfied(u32),
    /// Object at this index was an abandoned mutex
    Abandoned(u32),
    Timeout,
    Alerted,
    /// A user APC preempted the wait; the wait may be re-issued
    UserApc(ApcCall),
    /// Explicit wake request with nothing to run
    Woken,
    /// Any other completion status
    Status(NtStatus),
}

/// Highest wait index the coordinator reports
pub const MAXIMUM_WAIT_OBJECTS: u32 = 64;

impl SelectOutcome {
    pub(crate) fn from_status(status: NtStatus, call: ApcCall) -> Self {
        let raw = status.raw();
        if raw < MAXIMUM_WAIT_OBJECTS {
            return SelectOutcome::Satisfied(raw);
        }
        let abandoned = NtStatus::ABANDONED_WAIT_0.raw();
        if (abandoned..abandoned + MAXIMUM_WAIT_OBJECTS).contains(&raw) {
            return SelectOutcome::Abandoned(raw - abandoned);
        }
        match status {
            NtStatus::TIMEOUT => SelectOutcome::Timeout,
            NtStatus::ALERTED => SelectOutcome::Alerted,
            NtStatus::USER_APC => match call {
                ApcCall::User { .. } => SelectOutcome::UserApc(call),
                _ => SelectOutcome::Woken,
            },
            other => SelectOutcome::Status(other),
        }
    }

    /// Guest status equivalent of the outcome
    pub fn status(&self) -> NtStatus {
        match *self {
            SelectOutcome::Satisfied(index) => NtStatus(index),
            SelectOutcome::Abandoned(index) => NtStatus(NtStatus::ABANDONED_WAIT_0.raw() + index),
            SelectOutcome::Timeout => NtStatus::TIMEOUT,
            SelectOutcome::Alerted => NtStatus::ALERTED,
            SelectOutcome::UserApc(_) | SelectOutcome::Woken => NtStatus::USER_APC,
            SelectOutcome::Status(status) => status,
        }
    }
}
