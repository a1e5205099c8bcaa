/*!
 * Extended-State Codec
 *
 * The extended context follows the base context in memory:
 *
 * ```text
 * +-------------+------------+---pad---+------------------+
 * | CONTEXT     | CONTEXT_EX |         | XSTATE (64-byte  |
 * |             |            |         | aligned)         |
 * +-------------+------------+---------+------------------+
 * ^ All.Offset / Legacy.Offset (negative, relative to CONTEXT_EX)
 * ```
 *
 * Only the YMM component (feature bit 2) is carried over the wire.
 */

use super::types::{context_size, ContextError, ContextResult, M128};
use super::wire::{WireContext, WireFlags};
use crate::core::types::Machine;
use bytes::{Buf, BufMut};

/// YMM feature bit in the extended-state mask
pub const XSTATE_MASK_AVX: u64 = 1 << 2;

/// Compaction mask reported when the host uses compacted XSAVE
pub const XSTATE_COMPACTION_MASK: u64 = 0x8000_0000_0000_0004;

pub const XSTATE_SIZE: usize = 320;
pub const CONTEXT_EX_SIZE: usize = 24;
const XSTATE_ALIGN: usize = 64;

/// Extended state block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(64))]
pub struct XState {
    pub mask: u64,
    pub compaction_mask: u64,
    pub reserved: [u64; 6],
    /// Upper halves of ymm0..ymm15
    pub ymm: [M128; 16],
}

impl XState {
    /// True if any YMM upper half is non-zero
    pub fn has_ymm_data(&self) -> bool {
        self.ymm.iter().any(|reg| !reg.is_zero())
    }
}

const _: () = assert!(std::mem::size_of::<XState>() == XSTATE_SIZE);

/// One sub-block descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ContextChunk {
    pub offset: i32,
    pub length: u32,
}

/// Extended context descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ContextEx {
    pub all: ContextChunk,
    pub legacy: ContextChunk,
    pub xstate: ContextChunk,
}

const _: () = assert!(std::mem::size_of::<ContextEx>() == CONTEXT_EX_SIZE);

impl ContextEx {
    /// Descriptor for a context of `context_size` bytes followed by an aligned XSTATE
    pub fn new(context_size: usize) -> Self {
        let xstate_start = (context_size + CONTEXT_EX_SIZE + XSTATE_ALIGN - 1) & !(XSTATE_ALIGN - 1);
        let xstate_offset = (xstate_start - context_size) as i32;
        Self {
            all: ContextChunk {
                offset: -(context_size as i32),
                length: (context_size + xstate_offset as usize + XSTATE_SIZE) as u32,
            },
            legacy: ContextChunk {
                offset: -(context_size as i32),
                length: context_size as u32,
            },
            xstate: ContextChunk {
                offset: xstate_offset,
                length: XSTATE_SIZE as u32,
            },
        }
    }

    /// Descriptor for `machine`
    pub fn for_machine(machine: Machine) -> ContextResult<Self> {
        Ok(Self::new(context_size(machine)?))
    }

    /// Check the length invariant: `all == context + xstate.offset + xstate.length`
    pub fn validate(&self, context_size: usize) -> ContextResult<()> {
        let expect = |field, expected: i64, actual: i64| {
            if expected == actual {
                Ok(())
            } else {
                Err(ContextError::LayoutMismatch {
                    field,
                    expected,
                    actual,
                })
            }
        };
        let ctx = context_size as i64;
        expect("legacy.offset", -ctx, self.legacy.offset as i64)?;
        expect("legacy.length", ctx, self.legacy.length as i64)?;
        expect("all.offset", -ctx, self.all.offset as i64)?;
        if self.xstate.offset < CONTEXT_EX_SIZE as i32 {
            return Err(ContextError::LayoutMismatch {
                field: "xstate.offset",
                expected: CONTEXT_EX_SIZE as i64,
                actual: self.xstate.offset as i64,
            });
        }
        if (self.xstate.length as usize) < XSTATE_SIZE {
            return Err(ContextError::LayoutMismatch {
                field: "xstate.length",
                expected: XSTATE_SIZE as i64,
                actual: self.xstate.length as i64,
            });
        }
        expect(
            "all.length",
            ctx + self.xstate.offset as i64 + self.xstate.length as i64,
            self.all.length as i64,
        )
    }

    /// Total buffer size needed for context, descriptor and XSTATE
    #[inline]
    pub fn total_length(&self) -> usize {
        self.all.length as usize
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        for chunk in [self.all, self.legacy, self.xstate] {
            buf.put_i32_le(chunk.offset);
            buf.put_u32_le(chunk.length);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> ContextResult<Self> {
        if buf.remaining() < CONTEXT_EX_SIZE {
            return Err(ContextError::Truncated {
                needed: CONTEXT_EX_SIZE,
                available: buf.remaining(),
            });
        }
        let mut chunk = || ContextChunk {
            offset: buf.get_i32_le(),
            length: buf.get_u32_le(),
        };
        Ok(Self {
            all: chunk(),
            legacy: chunk(),
            xstate: chunk(),
        })
    }
}

/// Copy the YMM component into the wire context
///
/// The wire payload is always written: zeros when the mask has no YMM data.
/// A compacted block that does not carry the YMM component is skipped.
pub fn xstate_to_wire(xstate: &XState, wire: &mut WireContext) {
    if xstate.compaction_mask != 0 && xstate.compaction_mask & XSTATE_MASK_AVX == 0 {
        return;
    }
    wire.flags |= WireFlags::YMM_REGISTERS;
    if xstate.mask & XSTATE_MASK_AVX != 0 {
        wire.ymm = xstate.ymm;
    } else {
        wire.ymm = [M128::ZERO; 16];
    }
}

/// Rebuild the XSTATE block from the wire YMM payload
///
/// `compaction` is the host compaction setting snapshotted at capture; the
/// wire data never decides it. Registers are restored only when the wire
/// carries the YMM group with non-zero data.
pub fn xstate_from_wire(wire: &WireContext, compaction: bool) -> XState {
    let mut xstate = XState {
        compaction_mask: if compaction { XSTATE_COMPACTION_MASK } else { 0 },
        ..XState::default()
    };
    if wire.flags.contains(WireFlags::YMM_REGISTERS) && wire.ymm.iter().any(|r| !r.is_zero()) {
        xstate.ymm = wire.ymm;
        xstate.mask |= XSTATE_MASK_AVX;
    }
    xstate
}
