/*!
 * Loader Types
 */

use crate::core::inline_string::InlineString;
use crate::core::status::NtStatus;
use thiserror::Error;

pub type LoadOrderResult<T> = Result<T, LoadOrderError>;

/// Load order configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadOrderError {
    #[error("Load order for application {app} is already locked")]
    AlreadyLocked { app: InlineString },

    #[error("Load order for module {module} was already resolved")]
    AlreadyResolved { module: InlineString },

    #[error("Invalid load order entry: {entry}")]
    InvalidOrder { entry: InlineString },
}

impl From<&LoadOrderError> for NtStatus {
    fn from(err: &LoadOrderError) -> Self {
        match err {
            LoadOrderError::AlreadyLocked { .. } | LoadOrderError::AlreadyResolved { .. } => {
                NtStatus::ACCESS_DENIED
            }
            LoadOrderError::InvalidOrder { .. } => NtStatus::INVALID_PARAMETER,
        }
    }
}
