/*!
 * Loader Module
 * Load order policy and the module mapping collaborator interface
 */

pub mod builtin;
pub mod order;
pub mod types;

pub use builtin::{BuiltinLoader, BuiltinMapping, ImageInfo};
pub use order::{module_key, LoadOrder, LoadOrderRegistry};
pub use types::{LoadOrderError, LoadOrderResult};
