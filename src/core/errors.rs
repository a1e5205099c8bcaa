/*!
 * Error Types
 * Unified runtime error with miette diagnostics over the subsystem errors
 */

use crate::context::ContextError;
use crate::core::config::ConfigError;
use crate::core::status::NtStatus;
use crate::ipc::IpcError;
use crate::loader::LoadOrderError;
use crate::memory::MemoryError;
use crate::signals::DispatchError;
use crate::thread::ThreadError;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure taxonomy shared by every subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// No TEB slot, address range or staging capacity left
    ResourceExhausted,
    /// Host refused a mapping or the range is unusable
    MappingDenied,
    /// Context could not be translated between layouts
    TranslationFault,
    /// Trap or request with no handling policy
    DispatchUnresolved,
    /// Coordinator session is gone
    CoordinatorUnreachable,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::ResourceExhausted => "resource_exhausted",
            ErrorCategory::MappingDenied => "mapping_denied",
            ErrorCategory::TranslationFault => "translation_fault",
            ErrorCategory::DispatchUnresolved => "dispatch_unresolved",
            ErrorCategory::CoordinatorUnreachable => "coordinator_unreachable",
        };
        f.write_str(name)
    }
}

/// Runtime-level error
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    #[error(transparent)]
    #[diagnostic(
        code(runtime::memory),
        help("Check the address-space layout and the thread capacity setting.")
    )]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    #[diagnostic(code(runtime::thread), help("The thread may not have exited or was never allocated."))]
    Thread(#[from] ThreadError),

    #[error(transparent)]
    #[diagnostic(code(runtime::context), help("Size extended-context buffers with the reported layout."))]
    Context(#[from] ContextError),

    #[error(transparent)]
    #[diagnostic(code(runtime::ipc), help("The coordinator may have exited or killed this thread."))]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    #[diagnostic(code(runtime::dispatch), help("The trap has no guest exception policy."))]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    #[diagnostic(code(runtime::load_order), help("Load order is fixed once the first module resolves."))]
    LoadOrder(#[from] LoadOrderError),

    #[error(transparent)]
    #[diagnostic(
        code(runtime::config),
        help("Check the PERSONALITY_* environment variables or the JSON configuration file.")
    )]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// Taxonomy bucket, if the error belongs to one
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            RuntimeError::Memory(err) => Some(memory_category(err)),
            RuntimeError::Thread(err) => match err {
                ThreadError::ResourceExhausted { .. } | ThreadError::AsyncIoExhausted { .. } => {
                    Some(ErrorCategory::ResourceExhausted)
                }
                ThreadError::Memory(err) => Some(memory_category(err)),
                ThreadError::NoChannel(_) | ThreadError::Completion(_) => {
                    Some(ErrorCategory::CoordinatorUnreachable)
                }
                _ => None,
            },
            RuntimeError::Context(_) => Some(ErrorCategory::TranslationFault),
            RuntimeError::Ipc(IpcError::StagingFull) => Some(ErrorCategory::ResourceExhausted),
            RuntimeError::Ipc(IpcError::Context(_)) => Some(ErrorCategory::TranslationFault),
            RuntimeError::Ipc(err) if err.is_unreachable() => Some(ErrorCategory::CoordinatorUnreachable),
            RuntimeError::Ipc(_) => None,
            RuntimeError::Dispatch(err) => match err {
                DispatchError::Unresolved { .. } | DispatchError::NoGuestThread => {
                    Some(ErrorCategory::DispatchUnresolved)
                }
                DispatchError::Context(_) => Some(ErrorCategory::TranslationFault),
                DispatchError::Ipc(_) => Some(ErrorCategory::CoordinatorUnreachable),
                _ => None,
            },
            RuntimeError::LoadOrder(_) | RuntimeError::Config(_) => None,
        }
    }

    /// Guest-visible status for this error
    pub fn status(&self) -> NtStatus {
        match self {
            RuntimeError::Memory(err) => NtStatus::from(err),
            RuntimeError::Thread(err) => NtStatus::from(err),
            RuntimeError::Context(err) => NtStatus::from(err),
            RuntimeError::Ipc(err) => NtStatus::from(err),
            RuntimeError::Dispatch(err) => NtStatus::from(err),
            RuntimeError::LoadOrder(err) => NtStatus::from(err),
            RuntimeError::Config(_) => NtStatus::INVALID_PARAMETER,
        }
    }
}

fn memory_category(err: &MemoryError) -> ErrorCategory {
    match err {
        MemoryError::OutOfAddressSpace { .. } | MemoryError::SlotsExhausted { .. } => {
            ErrorCategory::ResourceExhausted
        }
        _ => ErrorCategory::MappingDenied,
    }
}

/// Runtime result
pub type RuntimeResult<T> = Result<T, RuntimeError>;
