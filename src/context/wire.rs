/*!
 * Wire Context
 *
 * Coordinator projection of a register context. The byte layout is fixed
 * regardless of which groups are present:
 *
 * ```text
 * offset  size  group
 *      0     8  machine (u32), flags (u32)
 *      8    40  control
 *     48   248  integer
 *    296    16  segments
 *    312   520  floating point
 *    832   120  debug registers
 *    952   512  extended registers
 *   1464   256  ymm upper halves
 *   1720
 * ```
 *
 * Each group area is sized for the largest supported architecture and the
 * unused tail is zero. Groups whose flag is clear are still written (zeros).
 */

use super::types::{ContextError, ContextResult, I386FloatSave, XsaveFormat, M128, XSAVE_FORMAT_SIZE};
use crate::core::types::Machine;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

pub const WIRE_CONTEXT_SIZE: usize = 1720;

const CTL_OFFSET: usize = 8;
const CTL_SIZE: usize = 40;
const INTEGER_OFFSET: usize = CTL_OFFSET + CTL_SIZE;
const INTEGER_SIZE: usize = 248;
const SEG_OFFSET: usize = INTEGER_OFFSET + INTEGER_SIZE;
const SEG_SIZE: usize = 16;
const FP_OFFSET: usize = SEG_OFFSET + SEG_SIZE;
const FP_SIZE: usize = 520;
const DEBUG_OFFSET: usize = FP_OFFSET + FP_SIZE;
const DEBUG_SIZE: usize = 120;
const EXT_OFFSET: usize = DEBUG_OFFSET + DEBUG_SIZE;
const EXT_SIZE: usize = 512;
const YMM_OFFSET: usize = EXT_OFFSET + EXT_SIZE;
const YMM_SIZE: usize = 256;

const _: () = assert!(YMM_OFFSET + YMM_SIZE == WIRE_CONTEXT_SIZE);

bitflags! {
    /// Register groups carried by a wire context
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WireFlags: u32 {
        const CONTROL = 0x01;
        const INTEGER = 0x02;
        const SEGMENTS = 0x04;
        const FLOATING_POINT = 0x08;
        const DEBUG_REGISTERS = 0x10;
        const EXTENDED_REGISTERS = 0x20;
        const YMM_REGISTERS = 0x40;
    }
}

/// i386 register groups as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I386WireRegs {
    pub eip: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ss: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub fp: I386FloatSave,
    pub dr: [u32; 6],
    pub ext: [u8; XSAVE_FORMAT_SIZE],
}

impl Default for I386WireRegs {
    fn default() -> Self {
        Self {
            eip: 0,
            ebp: 0,
            esp: 0,
            eflags: 0,
            cs: 0,
            ss: 0,
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            fp: I386FloatSave::default(),
            dr: [0; 6],
            ext: [0; XSAVE_FORMAT_SIZE],
        }
    }
}

/// x86-64 register groups as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Amd64WireRegs {
    pub rip: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub cs: u32,
    pub ss: u32,
    pub flags: u32,
    /// rax, rbx, rcx, rdx, rsi, rdi, r8..r15
    pub integer: [u64; 14],
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub fp: XsaveFormat,
    /// dr0, dr1, dr2, dr3, dr6, dr7
    pub dr: [u64; 6],
}

/// Per-machine register payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireRegs {
    I386(I386WireRegs),
    Amd64(Amd64WireRegs),
}

/// Coordinator register context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireContext {
    pub machine: Machine,
    pub flags: WireFlags,
    pub regs: WireRegs,
    pub ymm: [M128; 16],
}

impl WireContext {
    /// Empty context for `machine`; every group zero, no flags
    pub fn new(machine: Machine) -> Self {
        let regs = match machine {
            Machine::I386 => WireRegs::I386(I386WireRegs::default()),
            _ => WireRegs::Amd64(Amd64WireRegs::default()),
        };
        Self {
            machine,
            flags: WireFlags::empty(),
            regs,
            ymm: [M128::ZERO; 16],
        }
    }

    /// Serialize into a caller buffer without allocating
    pub fn encode_into(&self, out: &mut [u8; WIRE_CONTEXT_SIZE]) {
        out.fill(0);
        {
            let mut head = &mut out[..CTL_OFFSET];
            head.put_u32_le(self.machine.code() as u32);
            head.put_u32_le(self.flags.bits());
        }
        match &self.regs {
            WireRegs::I386(regs) => {
                let mut ctl = &mut out[CTL_OFFSET..CTL_OFFSET + CTL_SIZE];
                for value in [regs.eip, regs.ebp, regs.esp, regs.eflags, regs.cs, regs.ss] {
                    ctl.put_u32_le(value);
                }
                let mut integer = &mut out[INTEGER_OFFSET..INTEGER_OFFSET + INTEGER_SIZE];
                for value in [regs.eax, regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi] {
                    integer.put_u32_le(value);
                }
                let mut seg = &mut out[SEG_OFFSET..SEG_OFFSET + SEG_SIZE];
                for value in [regs.ds, regs.es, regs.fs, regs.gs] {
                    seg.put_u32_le(value);
                }
                let mut fp = &mut out[FP_OFFSET..FP_OFFSET + FP_SIZE];
                let f = &regs.fp;
                for value in [
                    f.control_word,
                    f.status_word,
                    f.tag_word,
                    f.error_offset,
                    f.error_selector,
                    f.data_offset,
                    f.data_selector,
                    f.cr0_npx_state,
                ] {
                    fp.put_u32_le(value);
                }
                fp.put_slice(&f.register_area);
                let mut debug = &mut out[DEBUG_OFFSET..DEBUG_OFFSET + DEBUG_SIZE];
                for value in regs.dr {
                    debug.put_u32_le(value);
                }
                out[EXT_OFFSET..EXT_OFFSET + EXT_SIZE].copy_from_slice(&regs.ext);
            }
            WireRegs::Amd64(regs) => {
                let mut ctl = &mut out[CTL_OFFSET..CTL_OFFSET + CTL_SIZE];
                ctl.put_u64_le(regs.rip);
                ctl.put_u64_le(regs.rbp);
                ctl.put_u64_le(regs.rsp);
                ctl.put_u32_le(regs.cs);
                ctl.put_u32_le(regs.ss);
                ctl.put_u32_le(regs.flags);
                let mut integer = &mut out[INTEGER_OFFSET..INTEGER_OFFSET + INTEGER_SIZE];
                for value in regs.integer {
                    integer.put_u64_le(value);
                }
                let mut seg = &mut out[SEG_OFFSET..SEG_OFFSET + SEG_SIZE];
                for value in [regs.ds, regs.es, regs.fs, regs.gs] {
                    seg.put_u32_le(value);
                }
                regs.fp.encode(&mut &mut out[FP_OFFSET..FP_OFFSET + FP_SIZE]);
                let mut debug = &mut out[DEBUG_OFFSET..DEBUG_OFFSET + DEBUG_SIZE];
                for value in regs.dr {
                    debug.put_u64_le(value);
                }
            }
        }
        let mut ymm = &mut out[YMM_OFFSET..YMM_OFFSET + YMM_SIZE];
        for reg in &self.ymm {
            reg.encode(&mut ymm);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = [0u8; WIRE_CONTEXT_SIZE];
        self.encode_into(&mut out);
        Bytes::copy_from_slice(&out)
    }

    pub fn decode(buf: &[u8]) -> ContextResult<Self> {
        if buf.len() < WIRE_CONTEXT_SIZE {
            return Err(ContextError::Truncated {
                needed: WIRE_CONTEXT_SIZE,
                available: buf.len(),
            });
        }
        let mut head = &buf[..CTL_OFFSET];
        let code = head.get_u32_le();
        let machine = u16::try_from(code)
            .ok()
            .and_then(Machine::from_code)
            .ok_or(ContextError::UnknownMachine(code))?;
        let flags = WireFlags::from_bits_truncate(head.get_u32_le());

        let regs = match machine {
            Machine::I386 => {
                let mut regs = I386WireRegs::default();
                let mut ctl = &buf[CTL_OFFSET..];
                [regs.eip, regs.ebp, regs.esp, regs.eflags, regs.cs, regs.ss] =
                    std::array::from_fn(|_| ctl.get_u32_le());
                let mut integer = &buf[INTEGER_OFFSET..];
                [regs.eax, regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi] =
                    std::array::from_fn(|_| integer.get_u32_le());
                let mut seg = &buf[SEG_OFFSET..];
                [regs.ds, regs.es, regs.fs, regs.gs] = std::array::from_fn(|_| seg.get_u32_le());
                let mut fp = &buf[FP_OFFSET..];
                let f = &mut regs.fp;
                [
                    f.control_word,
                    f.status_word,
                    f.tag_word,
                    f.error_offset,
                    f.error_selector,
                    f.data_offset,
                    f.data_selector,
                    f.cr0_npx_state,
                ] = std::array::from_fn(|_| fp.get_u32_le());
                fp.copy_to_slice(&mut f.register_area);
                let mut debug = &buf[DEBUG_OFFSET..];
                regs.dr = std::array::from_fn(|_| debug.get_u32_le());
                regs.ext.copy_from_slice(&buf[EXT_OFFSET..EXT_OFFSET + EXT_SIZE]);
                WireRegs::I386(regs)
            }
            Machine::Amd64 => {
                let mut regs = Amd64WireRegs::default();
                let mut ctl = &buf[CTL_OFFSET..];
                regs.rip = ctl.get_u64_le();
                regs.rbp = ctl.get_u64_le();
                regs.rsp = ctl.get_u64_le();
                regs.cs = ctl.get_u32_le();
                regs.ss = ctl.get_u32_le();
                regs.flags = ctl.get_u32_le();
                let mut integer = &buf[INTEGER_OFFSET..];
                regs.integer = std::array::from_fn(|_| integer.get_u64_le());
                let mut seg = &buf[SEG_OFFSET..];
                [regs.ds, regs.es, regs.fs, regs.gs] = std::array::from_fn(|_| seg.get_u32_le());
                regs.fp = XsaveFormat::decode(&mut &buf[FP_OFFSET..]);
                let mut debug = &buf[DEBUG_OFFSET..];
                regs.dr = std::array::from_fn(|_| debug.get_u64_le());
                WireRegs::Amd64(regs)
            }
            other => return Err(ContextError::UnsupportedMachine(other)),
        };

        let mut ymm_buf = &buf[YMM_OFFSET..];
        let ymm = std::array::from_fn(|_| M128::decode(&mut ymm_buf));
        Ok(Self {
            machine,
            flags,
            regs,
            ymm,
        })
    }
}
