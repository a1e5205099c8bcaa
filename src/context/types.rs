/*!
 * Native Context Layouts
 *
 * Guest-visible register contexts for the x86 machines. The structs are
 * `#[repr(C)]` and keep the guest ABI layout exactly; field names follow the
 * guest headers in snake case.
 */

use crate::core::status::NtStatus;
use crate::core::types::Machine;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Context translation result
pub type ContextResult<T> = Result<T, ContextError>;

/// Context translation errors; all of them are contract violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Unsupported machine for context translation: {0}")]
    UnsupportedMachine(Machine),

    #[error("Unknown machine code 0x{0:04x} in wire context")]
    UnknownMachine(u32),

    #[error("Extended context layout mismatch: {field} is {actual}, expected {expected}")]
    LayoutMismatch {
        field: &'static str,
        expected: i64,
        actual: i64,
    },

    #[error("Context buffer too small: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

impl From<&ContextError> for NtStatus {
    fn from(err: &ContextError) -> Self {
        match err {
            ContextError::UnsupportedMachine(_) | ContextError::UnknownMachine(_) => {
                NtStatus::NOT_SUPPORTED
            }
            ContextError::LayoutMismatch { .. } => NtStatus::INVALID_PARAMETER,
            ContextError::Truncated { .. } => NtStatus::BUFFER_OVERFLOW,
        }
    }
}

/// Architecture bit of an AMD64 context
pub const CONTEXT_AMD64: u32 = 0x0010_0000;
/// Architecture bit of an i386 context
pub const CONTEXT_I386: u32 = 0x0001_0000;

bitflags! {
    /// Register groups present in a context (architecture bit excluded)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        const CONTROL = 0x01;
        const INTEGER = 0x02;
        const SEGMENTS = 0x04;
        const FLOATING_POINT = 0x08;
        const DEBUG_REGISTERS = 0x10;
        /// i386 only: FXSAVE image in `extended_registers`
        const EXTENDED_REGISTERS = 0x20;
        const XSTATE = 0x40;

        const FULL = Self::CONTROL.bits() | Self::INTEGER.bits() | Self::FLOATING_POINT.bits();
        const ALL = Self::FULL.bits() | Self::SEGMENTS.bits() | Self::DEBUG_REGISTERS.bits();
    }
}

/// 128-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(C, align(16))]
pub struct M128 {
    pub low: u64,
    pub high: u64,
}

impl M128 {
    pub const ZERO: Self = Self { low: 0, high: 0 };

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.low == 0 && self.high == 0
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.low);
        buf.put_u64_le(self.high);
    }

    pub(crate) fn decode<B: Buf>(buf: &mut B) -> Self {
        Self {
            low: buf.get_u64_le(),
            high: buf.get_u64_le(),
        }
    }
}

/// FXSAVE image (legacy float, MMX and SSE state)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct XsaveFormat {
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u8,
    pub reserved1: u8,
    pub error_opcode: u16,
    pub error_offset: u32,
    pub error_selector: u16,
    pub reserved2: u16,
    pub data_offset: u32,
    pub data_selector: u16,
    pub reserved3: u16,
    pub mx_csr: u32,
    pub mx_csr_mask: u32,
    pub float_registers: [M128; 8],
    pub xmm_registers: [M128; 16],
    pub reserved4: [u8; 96],
}

pub const XSAVE_FORMAT_SIZE: usize = 512;

impl Default for XsaveFormat {
    fn default() -> Self {
        Self {
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            reserved1: 0,
            error_opcode: 0,
            error_offset: 0,
            error_selector: 0,
            reserved2: 0,
            data_offset: 0,
            data_selector: 0,
            reserved3: 0,
            mx_csr: 0,
            mx_csr_mask: 0,
            float_registers: [M128::ZERO; 8],
            xmm_registers: [M128::ZERO; 16],
            reserved4: [0; 96],
        }
    }
}

impl XsaveFormat {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.control_word);
        buf.put_u16_le(self.status_word);
        buf.put_u8(self.tag_word);
        buf.put_u8(self.reserved1);
        buf.put_u16_le(self.error_opcode);
        buf.put_u32_le(self.error_offset);
        buf.put_u16_le(self.error_selector);
        buf.put_u16_le(self.reserved2);
        buf.put_u32_le(self.data_offset);
        buf.put_u16_le(self.data_selector);
        buf.put_u16_le(self.reserved3);
        buf.put_u32_le(self.mx_csr);
        buf.put_u32_le(self.mx_csr_mask);
        for reg in self.float_registers.iter().chain(self.xmm_registers.iter()) {
            reg.encode(buf);
        }
        buf.put_slice(&self.reserved4);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Self {
        let mut fx = Self {
            control_word: buf.get_u16_le(),
            status_word: buf.get_u16_le(),
            tag_word: buf.get_u8(),
            reserved1: buf.get_u8(),
            error_opcode: buf.get_u16_le(),
            error_offset: buf.get_u32_le(),
            error_selector: buf.get_u16_le(),
            reserved2: buf.get_u16_le(),
            data_offset: buf.get_u32_le(),
            data_selector: buf.get_u16_le(),
            reserved3: buf.get_u16_le(),
            mx_csr: buf.get_u32_le(),
            mx_csr_mask: buf.get_u32_le(),
            ..Self::default()
        };
        for reg in fx.float_registers.iter_mut().chain(fx.xmm_registers.iter_mut()) {
            *reg = M128::decode(buf);
        }
        buf.copy_to_slice(&mut fx.reserved4);
        fx
    }

    /// Raw 512-byte image, as stored in an i386 context's extended registers
    pub fn to_bytes(&self) -> [u8; XSAVE_FORMAT_SIZE] {
        let mut out = [0u8; XSAVE_FORMAT_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }

    pub fn from_bytes(bytes: &[u8; XSAVE_FORMAT_SIZE]) -> Self {
        Self::decode(&mut &bytes[..])
    }
}

/// Legacy x87 save area of an i386 context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct I386FloatSave {
    pub control_word: u32,
    pub status_word: u32,
    pub tag_word: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    pub register_area: [u8; 80],
    pub cr0_npx_state: u32,
}

impl Default for I386FloatSave {
    fn default() -> Self {
        Self {
            control_word: 0,
            status_word: 0,
            tag_word: 0,
            error_offset: 0,
            error_selector: 0,
            data_offset: 0,
            data_selector: 0,
            register_area: [0; 80],
            cr0_npx_state: 0,
        }
    }
}

/// i386 guest context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct I386Context {
    pub context_flags: u32,
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
    pub float_save: I386FloatSave,
    pub seg_gs: u32,
    pub seg_fs: u32,
    pub seg_es: u32,
    pub seg_ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ebp: u32,
    pub eip: u32,
    pub seg_cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub seg_ss: u32,
    pub extended_registers: [u8; XSAVE_FORMAT_SIZE],
}

impl Default for I386Context {
    fn default() -> Self {
        Self {
            context_flags: CONTEXT_I386,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            float_save: I386FloatSave::default(),
            seg_gs: 0,
            seg_fs: 0,
            seg_es: 0,
            seg_ds: 0,
            edi: 0,
            esi: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            ebp: 0,
            eip: 0,
            seg_cs: 0,
            eflags: 0,
            esp: 0,
            seg_ss: 0,
            extended_registers: [0; XSAVE_FORMAT_SIZE],
        }
    }
}

impl I386Context {
    #[inline]
    pub fn groups(&self) -> ContextFlags {
        ContextFlags::from_bits_truncate(self.context_flags)
    }

    #[inline]
    pub fn set_groups(&mut self, groups: ContextFlags) {
        self.context_flags = CONTEXT_I386 | groups.bits();
    }
}

/// AMD64 guest context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Amd64Context {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub flt_save: XsaveFormat,
    pub vector_register: [M128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

impl Default for Amd64Context {
    fn default() -> Self {
        Self {
            p1_home: 0,
            p2_home: 0,
            p3_home: 0,
            p4_home: 0,
            p5_home: 0,
            p6_home: 0,
            context_flags: CONTEXT_AMD64,
            mx_csr: 0,
            seg_cs: 0,
            seg_ds: 0,
            seg_es: 0,
            seg_fs: 0,
            seg_gs: 0,
            seg_ss: 0,
            eflags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            flt_save: XsaveFormat::default(),
            vector_register: [M128::ZERO; 26],
            vector_control: 0,
            debug_control: 0,
            last_branch_to_rip: 0,
            last_branch_from_rip: 0,
            last_exception_to_rip: 0,
            last_exception_from_rip: 0,
        }
    }
}

impl Amd64Context {
    #[inline]
    pub fn groups(&self) -> ContextFlags {
        ContextFlags::from_bits_truncate(self.context_flags)
    }

    #[inline]
    pub fn set_groups(&mut self, groups: ContextFlags) {
        self.context_flags = CONTEXT_AMD64 | groups.bits();
    }

    /// Integer registers in wire order (rax, rbx, rcx, rdx, rsi, rdi, r8..r15)
    pub fn integer_regs(&self) -> [u64; 14] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.r8, self.r9,
            self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ]
    }

    pub fn set_integer_regs(&mut self, regs: [u64; 14]) {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.r8, self.r9,
            self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ] = regs;
    }
}

pub const AMD64_CONTEXT_SIZE: usize = 0x4d0;
pub const I386_CONTEXT_SIZE: usize = 0x2cc;

const _: () = assert!(std::mem::size_of::<M128>() == 16);
const _: () = assert!(std::mem::size_of::<XsaveFormat>() == XSAVE_FORMAT_SIZE);
const _: () = assert!(std::mem::size_of::<I386FloatSave>() == 112);
const _: () = assert!(std::mem::size_of::<I386Context>() == I386_CONTEXT_SIZE);
const _: () = assert!(std::mem::size_of::<Amd64Context>() == AMD64_CONTEXT_SIZE);

/// Native context of one machine
///
/// Kept inline; it is built on the signal path where nothing may allocate.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeContext {
    I386(I386Context),
    Amd64(Amd64Context),
}

impl NativeContext {
    pub fn machine(&self) -> Machine {
        match self {
            NativeContext::I386(_) => Machine::I386,
            NativeContext::Amd64(_) => Machine::Amd64,
        }
    }

    pub fn groups(&self) -> ContextFlags {
        match self {
            NativeContext::I386(ctx) => ctx.groups(),
            NativeContext::Amd64(ctx) => ctx.groups(),
        }
    }

    /// Size of the guest-visible context structure
    pub fn size(&self) -> usize {
        context_size(self.machine()).unwrap_or(0)
    }

    pub fn instruction_pointer(&self) -> u64 {
        match self {
            NativeContext::I386(ctx) => ctx.eip as u64,
            NativeContext::Amd64(ctx) => ctx.rip,
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        match self {
            NativeContext::I386(ctx) => ctx.esp as u64,
            NativeContext::Amd64(ctx) => ctx.rsp,
        }
    }

    pub fn set_instruction_pointer(&mut self, ip: u64) {
        match self {
            NativeContext::I386(ctx) => ctx.eip = ip as u32,
            NativeContext::Amd64(ctx) => ctx.rip = ip,
        }
    }

    pub fn set_stack_pointer(&mut self, sp: u64) {
        match self {
            NativeContext::I386(ctx) => ctx.esp = sp as u32,
            NativeContext::Amd64(ctx) => ctx.rsp = sp,
        }
    }

    /// Accumulator, where call results and syscall numbers live
    pub fn accumulator(&self) -> u64 {
        match self {
            NativeContext::I386(ctx) => ctx.eax as u64,
            NativeContext::Amd64(ctx) => ctx.rax,
        }
    }

    pub fn set_accumulator(&mut self, value: u64) {
        match self {
            NativeContext::I386(ctx) => ctx.eax = value as u32,
            NativeContext::Amd64(ctx) => ctx.rax = value,
        }
    }
}

/// Size of the guest context structure for `machine`
pub fn context_size(machine: Machine) -> ContextResult<usize> {
    match machine {
        Machine::I386 => Ok(I386_CONTEXT_SIZE),
        Machine::Amd64 => Ok(AMD64_CONTEXT_SIZE),
        other => Err(ContextError::UnsupportedMachine(other)),
    }
}
