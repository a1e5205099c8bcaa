/*!
 * Core Module
 * Fundamental runtime types, limits, status codes and error handling
 */

pub mod config;
pub mod errors;
pub mod inline_string;
pub mod latch;
pub mod limits;
pub mod status;
pub mod types;

// Re-export for convenience
pub use config::{ConfigError, RuntimeConfig};
pub use errors::{ErrorCategory, RuntimeError, RuntimeResult};
pub use inline_string::InlineString;
pub use latch::{LatchedGuard, LatchedMutex, ProcessLatch, ProcessPhase};
pub use status::{errno_to_status, NtStatus};
pub use types::*;
