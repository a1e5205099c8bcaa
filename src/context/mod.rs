/*!
 * Context Module
 * Native register contexts, their wire projection and cross-width translation
 */

pub mod translate;
pub mod types;
pub mod wire;
pub mod xstate;

pub use translate::{
    fpu_to_fpux, fpux_to_fpu, from_wire, from_wire_with, narrow, to_wire, to_wire_with, widen,
    SelectorMap, TranslatedContext,
};
pub use types::{
    context_size, Amd64Context, ContextError, ContextFlags, ContextResult, I386Context,
    I386FloatSave, NativeContext, XsaveFormat, AMD64_CONTEXT_SIZE, I386_CONTEXT_SIZE, M128,
};
pub use wire::{WireContext, WireFlags, WireRegs, WIRE_CONTEXT_SIZE};
pub use xstate::{xstate_from_wire, xstate_to_wire, ContextEx, XState, XSTATE_MASK_AVX};
