/*!
 * Module Mapping Collaborator
 * Interface to the component that understands the image format
 */

use crate::core::inline_string::InlineString;
use crate::core::status::NtStatus;
use crate::core::types::{Address, Machine, ObjHandle, Size};
use serde::{Deserialize, Serialize};

/// Image properties the runtime needs without parsing the image itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: InlineString,
    pub machine: Machine,
    pub entry_point: Address,
    pub stack_reserve: Size,
    pub stack_commit: Size,
    pub large_address_aware: bool,
}

/// A builtin module mapped by the collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinMapping {
    pub module: Address,
    pub size: Size,
    pub image_info: ImageInfo,
}

/// Module loading operations supplied by the image-format collaborator
#[cfg_attr(test, mockall::automock)]
pub trait BuiltinLoader: Send + Sync {
    /// Load a builtin image matching `image_info`; returns `(module, size)`
    fn load_builtin(&self, image_info: &ImageInfo) -> Result<(Address, Size), NtStatus>;

    /// Map the builtin behind a coordinator mapping handle
    fn map_builtin_module(&self, mapping: ObjHandle) -> Result<BuiltinMapping, NtStatus>;

    /// Apply base relocations after an image landed `delta` bytes away from its preferred base
    fn apply_fixups(&self, module: Address, size: Size, delta: isize) -> Result<(), NtStatus>;
}
