/*!
 * Memory Module
 * Guest address-space management
 */

pub mod host;
pub mod layout;
pub mod module;
pub mod space;
pub mod stack;
pub mod types;

// Re-export for convenience
pub use host::{HostMapper, NixMapper, Placement};
pub use layout::{signal_stack_for, TebArena};
pub use module::{ImageDescriptor, ImageSection, ModuleHandle};
pub use space::AddressSpace;
pub use stack::ThreadStack;
pub use types::*;
