/*!
 * Context Translator
 *
 * Converts between native guest contexts and the wire projection. Only the
 * groups flagged present are projected; everything else is zero on arrival.
 * Contexts crossing between the 64-bit host runtime and 32-bit
 * compatibility-mode threads are narrowed or widened on the way, with code
 * selectors remapped through a [`SelectorMap`].
 */

use super::types::{
    context_size, Amd64Context, ContextError, ContextFlags, ContextResult, I386Context,
    I386FloatSave, NativeContext, XsaveFormat, M128,
};
use super::wire::{Amd64WireRegs, I386WireRegs, WireContext, WireFlags, WireRegs};
use super::xstate::{xstate_from_wire, xstate_to_wire, ContextEx, XState};
use crate::core::types::Machine;
use serde::{Deserialize, Serialize};

/// Code/data selectors used when moving a context between widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorMap {
    pub cs32: u16,
    pub cs64: u16,
    pub ds: u16,
}

impl Default for SelectorMap {
    /// Linux x86-64 user selectors
    fn default() -> Self {
        Self {
            cs32: 0x23,
            cs64: 0x33,
            ds: 0x2b,
        }
    }
}

impl SelectorMap {
    #[inline]
    fn narrow_cs(&self, cs: u16) -> u16 {
        if cs == self.cs64 {
            self.cs32
        } else {
            cs
        }
    }

    #[inline]
    fn widen_cs(&self, cs: u16) -> u16 {
        if cs == self.cs32 {
            self.cs64
        } else {
            cs
        }
    }
}

/// Native context plus its optional extended state
///
/// `compaction` is the host XSAVE compaction setting captured together with
/// the registers; decoding the extended state uses this snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatedContext {
    pub native: NativeContext,
    pub ex: Option<ContextEx>,
    xstate: Option<XState>,
    pub compaction: bool,
}

impl TranslatedContext {
    pub fn new(native: NativeContext, compaction: bool) -> Self {
        Self {
            native,
            ex: None,
            xstate: None,
            compaction,
        }
    }

    /// Attach an extended-state block and mark the context as carrying it
    pub fn with_xstate(mut self, xstate: XState) -> Self {
        let groups = self.native.groups() | ContextFlags::XSTATE;
        self.set_groups(groups);
        self.ex = context_size(self.native.machine()).ok().map(ContextEx::new);
        self.xstate = Some(xstate);
        self
    }

    /// Extended state; unavailable unless the XSTATE group is present
    pub fn xstate(&self) -> Option<&XState> {
        if self.native.groups().contains(ContextFlags::XSTATE) {
            self.xstate.as_ref()
        } else {
            None
        }
    }

    pub fn xstate_mut(&mut self) -> Option<&mut XState> {
        if self.native.groups().contains(ContextFlags::XSTATE) {
            self.xstate.as_mut()
        } else {
            None
        }
    }

    pub fn machine(&self) -> Machine {
        self.native.machine()
    }

    pub fn groups(&self) -> ContextFlags {
        self.native.groups()
    }

    fn set_groups(&mut self, groups: ContextFlags) {
        match &mut self.native {
            NativeContext::I386(ctx) => ctx.set_groups(groups),
            NativeContext::Amd64(ctx) => ctx.set_groups(groups),
        }
    }

    /// Buffer size a caller must provide for a full extended context of `machine`
    pub fn required_size(machine: Machine) -> ContextResult<usize> {
        Ok(ContextEx::for_machine(machine)?.total_length())
    }
}

/// Project `ctx` onto the wire for `to_machine`
pub fn to_wire(ctx: &TranslatedContext, to_machine: Machine) -> ContextResult<WireContext> {
    to_wire_with(ctx, to_machine, &SelectorMap::default())
}

/// Rebuild a native context of `machine` from the wire
pub fn from_wire(wire: &WireContext, machine: Machine, compaction: bool) -> ContextResult<TranslatedContext> {
    from_wire_with(wire, machine, compaction, &SelectorMap::default())
}

pub fn to_wire_with(
    ctx: &TranslatedContext,
    to_machine: Machine,
    selectors: &SelectorMap,
) -> ContextResult<WireContext> {
    if let Some(ex) = &ctx.ex {
        ex.validate(ctx.native.size())?;
    }
    let mut wire = match (&ctx.native, to_machine) {
        (NativeContext::Amd64(native), Machine::Amd64) => amd64_to_wire(native),
        (NativeContext::I386(native), Machine::I386) => i386_to_wire(native),
        (NativeContext::Amd64(native), Machine::I386) => i386_to_wire(&narrow(native, selectors)),
        (NativeContext::I386(native), Machine::Amd64) => amd64_to_wire(&widen(native, selectors)),
        (_, other) => return Err(ContextError::UnsupportedMachine(other)),
    };
    if let Some(xstate) = ctx.xstate() {
        xstate_to_wire(xstate, &mut wire);
    }
    Ok(wire)
}

pub fn from_wire_with(
    wire: &WireContext,
    machine: Machine,
    compaction: bool,
    selectors: &SelectorMap,
) -> ContextResult<TranslatedContext> {
    let native = match (&wire.regs, machine) {
        (WireRegs::Amd64(regs), Machine::Amd64) => NativeContext::Amd64(amd64_from_wire(regs, wire.flags)),
        (WireRegs::I386(regs), Machine::I386) => NativeContext::I386(i386_from_wire(regs, wire.flags)),
        (WireRegs::Amd64(regs), Machine::I386) => {
            NativeContext::I386(narrow(&amd64_from_wire(regs, wire.flags), selectors))
        }
        (WireRegs::I386(regs), Machine::Amd64) => {
            NativeContext::Amd64(widen(&i386_from_wire(regs, wire.flags), selectors))
        }
        (_, other) => return Err(ContextError::UnsupportedMachine(other)),
    };
    let ctx = TranslatedContext::new(native, compaction);
    if wire.flags.contains(WireFlags::YMM_REGISTERS) {
        Ok(ctx.with_xstate(xstate_from_wire(wire, compaction)))
    } else {
        Ok(ctx)
    }
}

fn amd64_to_wire(ctx: &Amd64Context) -> WireContext {
    let groups = ctx.groups();
    let mut wire = WireContext::new(Machine::Amd64);
    let mut regs = Amd64WireRegs::default();
    if groups.contains(ContextFlags::CONTROL) {
        wire.flags |= WireFlags::CONTROL;
        regs.rip = ctx.rip;
        regs.rbp = ctx.rbp;
        regs.rsp = ctx.rsp;
        regs.cs = ctx.seg_cs as u32;
        regs.ss = ctx.seg_ss as u32;
        regs.flags = ctx.eflags;
    }
    if groups.contains(ContextFlags::INTEGER) {
        wire.flags |= WireFlags::INTEGER;
        regs.integer = ctx.integer_regs();
    }
    if groups.contains(ContextFlags::SEGMENTS) {
        wire.flags |= WireFlags::SEGMENTS;
        regs.ds = ctx.seg_ds as u32;
        regs.es = ctx.seg_es as u32;
        regs.fs = ctx.seg_fs as u32;
        regs.gs = ctx.seg_gs as u32;
    }
    if groups.contains(ContextFlags::FLOATING_POINT) {
        wire.flags |= WireFlags::FLOATING_POINT;
        regs.fp = ctx.flt_save;
    }
    if groups.contains(ContextFlags::DEBUG_REGISTERS) {
        wire.flags |= WireFlags::DEBUG_REGISTERS;
        regs.dr = [ctx.dr0, ctx.dr1, ctx.dr2, ctx.dr3, ctx.dr6, ctx.dr7];
    }
    wire.regs = WireRegs::Amd64(regs);
    wire
}

fn amd64_from_wire(regs: &Amd64WireRegs, flags: WireFlags) -> Amd64Context {
    let mut ctx = Amd64Context::default();
    let mut groups = ContextFlags::empty();
    if flags.contains(WireFlags::CONTROL) {
        groups |= ContextFlags::CONTROL;
        ctx.rip = regs.rip;
        ctx.rbp = regs.rbp;
        ctx.rsp = regs.rsp;
        ctx.seg_cs = regs.cs as u16;
        ctx.seg_ss = regs.ss as u16;
        ctx.eflags = regs.flags;
    }
    if flags.contains(WireFlags::INTEGER) {
        groups |= ContextFlags::INTEGER;
        ctx.set_integer_regs(regs.integer);
    }
    if flags.contains(WireFlags::SEGMENTS) {
        groups |= ContextFlags::SEGMENTS;
        ctx.seg_ds = regs.ds as u16;
        ctx.seg_es = regs.es as u16;
        ctx.seg_fs = regs.fs as u16;
        ctx.seg_gs = regs.gs as u16;
    }
    if flags.contains(WireFlags::FLOATING_POINT) {
        groups |= ContextFlags::FLOATING_POINT;
        ctx.flt_save = regs.fp;
        ctx.mx_csr = regs.fp.mx_csr;
    }
    if flags.contains(WireFlags::DEBUG_REGISTERS) {
        groups |= ContextFlags::DEBUG_REGISTERS;
        [ctx.dr0, ctx.dr1, ctx.dr2, ctx.dr3, ctx.dr6, ctx.dr7] = regs.dr;
    }
    ctx.set_groups(groups);
    ctx
}

fn i386_to_wire(ctx: &I386Context) -> WireContext {
    let groups = ctx.groups();
    let mut wire = WireContext::new(Machine::I386);
    let mut regs = I386WireRegs::default();
    if groups.contains(ContextFlags::CONTROL) {
        wire.flags |= WireFlags::CONTROL;
        regs.eip = ctx.eip;
        regs.ebp = ctx.ebp;
        regs.esp = ctx.esp;
        regs.eflags = ctx.eflags;
        regs.cs = ctx.seg_cs;
        regs.ss = ctx.seg_ss;
    }
    if groups.contains(ContextFlags::INTEGER) {
        wire.flags |= WireFlags::INTEGER;
        regs.eax = ctx.eax;
        regs.ebx = ctx.ebx;
        regs.ecx = ctx.ecx;
        regs.edx = ctx.edx;
        regs.esi = ctx.esi;
        regs.edi = ctx.edi;
    }
    if groups.contains(ContextFlags::SEGMENTS) {
        wire.flags |= WireFlags::SEGMENTS;
        regs.ds = ctx.seg_ds;
        regs.es = ctx.seg_es;
        regs.fs = ctx.seg_fs;
        regs.gs = ctx.seg_gs;
    }
    if groups.contains(ContextFlags::FLOATING_POINT) {
        wire.flags |= WireFlags::FLOATING_POINT;
        regs.fp = ctx.float_save;
    }
    if groups.contains(ContextFlags::DEBUG_REGISTERS) {
        wire.flags |= WireFlags::DEBUG_REGISTERS;
        regs.dr = [ctx.dr0, ctx.dr1, ctx.dr2, ctx.dr3, ctx.dr6, ctx.dr7];
    }
    if groups.contains(ContextFlags::EXTENDED_REGISTERS) {
        wire.flags |= WireFlags::EXTENDED_REGISTERS;
        regs.ext = ctx.extended_registers;
    }
    wire.regs = WireRegs::I386(regs);
    wire
}

fn i386_from_wire(regs: &I386WireRegs, flags: WireFlags) -> I386Context {
    let mut ctx = I386Context::default();
    let mut groups = ContextFlags::empty();
    if flags.contains(WireFlags::CONTROL) {
        groups |= ContextFlags::CONTROL;
        ctx.eip = regs.eip;
        ctx.ebp = regs.ebp;
        ctx.esp = regs.esp;
        ctx.eflags = regs.eflags;
        ctx.seg_cs = regs.cs;
        ctx.seg_ss = regs.ss;
    }
    if flags.contains(WireFlags::INTEGER) {
        groups |= ContextFlags::INTEGER;
        ctx.eax = regs.eax;
        ctx.ebx = regs.ebx;
        ctx.ecx = regs.ecx;
        ctx.edx = regs.edx;
        ctx.esi = regs.esi;
        ctx.edi = regs.edi;
    }
    if flags.contains(WireFlags::SEGMENTS) {
        groups |= ContextFlags::SEGMENTS;
        ctx.seg_ds = regs.ds;
        ctx.seg_es = regs.es;
        ctx.seg_fs = regs.fs;
        ctx.seg_gs = regs.gs;
    }
    if flags.contains(WireFlags::FLOATING_POINT) {
        groups |= ContextFlags::FLOATING_POINT;
        ctx.float_save = regs.fp;
    }
    if flags.contains(WireFlags::DEBUG_REGISTERS) {
        groups |= ContextFlags::DEBUG_REGISTERS;
        [ctx.dr0, ctx.dr1, ctx.dr2, ctx.dr3, ctx.dr6, ctx.dr7] = regs.dr;
    }
    if flags.contains(WireFlags::EXTENDED_REGISTERS) {
        groups |= ContextFlags::EXTENDED_REGISTERS;
        ctx.extended_registers = regs.ext;
    }
    ctx.set_groups(groups);
    ctx
}

/// 64-bit context as seen by a 32-bit compatibility-mode thread
pub fn narrow(ctx: &Amd64Context, selectors: &SelectorMap) -> I386Context {
    let src = ctx.groups();
    let mut out = I386Context::default();
    let mut groups = ContextFlags::empty();
    if src.contains(ContextFlags::CONTROL) {
        groups |= ContextFlags::CONTROL;
        out.eip = ctx.rip as u32;
        out.ebp = ctx.rbp as u32;
        out.esp = ctx.rsp as u32;
        out.eflags = ctx.eflags;
        out.seg_cs = selectors.narrow_cs(ctx.seg_cs) as u32;
        out.seg_ss = ctx.seg_ss as u32;
    }
    if src.contains(ContextFlags::INTEGER) {
        groups |= ContextFlags::INTEGER;
        out.eax = ctx.rax as u32;
        out.ebx = ctx.rbx as u32;
        out.ecx = ctx.rcx as u32;
        out.edx = ctx.rdx as u32;
        out.esi = ctx.rsi as u32;
        out.edi = ctx.rdi as u32;
    }
    if src.contains(ContextFlags::SEGMENTS) {
        groups |= ContextFlags::SEGMENTS;
        out.seg_ds = ctx.seg_ds as u32;
        out.seg_es = ctx.seg_es as u32;
        out.seg_fs = ctx.seg_fs as u32;
        out.seg_gs = ctx.seg_gs as u32;
    }
    if src.contains(ContextFlags::FLOATING_POINT) {
        groups |= ContextFlags::FLOATING_POINT | ContextFlags::EXTENDED_REGISTERS;
        out.float_save = fpux_to_fpu(&ctx.flt_save);
        out.extended_registers = ctx.flt_save.to_bytes();
    }
    if src.contains(ContextFlags::DEBUG_REGISTERS) {
        groups |= ContextFlags::DEBUG_REGISTERS;
        out.dr0 = ctx.dr0 as u32;
        out.dr1 = ctx.dr1 as u32;
        out.dr2 = ctx.dr2 as u32;
        out.dr3 = ctx.dr3 as u32;
        out.dr6 = ctx.dr6 as u32;
        out.dr7 = ctx.dr7 as u32;
    }
    out.set_groups(groups);
    out
}

/// 32-bit compatibility-mode context widened for the 64-bit runtime
pub fn widen(ctx: &I386Context, selectors: &SelectorMap) -> Amd64Context {
    let src = ctx.groups();
    let mut out = Amd64Context::default();
    let mut groups = ContextFlags::empty();
    if src.contains(ContextFlags::CONTROL) {
        groups |= ContextFlags::CONTROL;
        out.rip = ctx.eip as u64;
        out.rbp = ctx.ebp as u64;
        out.rsp = ctx.esp as u64;
        out.eflags = ctx.eflags;
        out.seg_cs = selectors.widen_cs(ctx.seg_cs as u16);
        out.seg_ss = ctx.seg_ss as u16;
    }
    if src.contains(ContextFlags::INTEGER) {
        groups |= ContextFlags::INTEGER;
        out.rax = ctx.eax as u64;
        out.rbx = ctx.ebx as u64;
        out.rcx = ctx.ecx as u64;
        out.rdx = ctx.edx as u64;
        out.rsi = ctx.esi as u64;
        out.rdi = ctx.edi as u64;
    }
    if src.contains(ContextFlags::SEGMENTS) {
        groups |= ContextFlags::SEGMENTS;
        out.seg_ds = ctx.seg_ds as u16;
        out.seg_es = ctx.seg_es as u16;
        out.seg_fs = ctx.seg_fs as u16;
        out.seg_gs = ctx.seg_gs as u16;
    }
    if src.contains(ContextFlags::EXTENDED_REGISTERS) {
        groups |= ContextFlags::FLOATING_POINT;
        out.flt_save = XsaveFormat::from_bytes(&ctx.extended_registers);
        out.mx_csr = out.flt_save.mx_csr;
    } else if src.contains(ContextFlags::FLOATING_POINT) {
        groups |= ContextFlags::FLOATING_POINT;
        out.flt_save = fpu_to_fpux(&ctx.float_save);
        out.mx_csr = out.flt_save.mx_csr;
    }
    if src.contains(ContextFlags::DEBUG_REGISTERS) {
        groups |= ContextFlags::DEBUG_REGISTERS;
        out.dr0 = ctx.dr0 as u64;
        out.dr1 = ctx.dr1 as u64;
        out.dr2 = ctx.dr2 as u64;
        out.dr3 = ctx.dr3 as u64;
        out.dr6 = ctx.dr6 as u64;
        out.dr7 = ctx.dr7 as u64;
    }
    out.set_groups(groups);
    out
}

/// Tag value of one x87 register from its 80-bit contents
fn x87_tag(reg: &M128) -> u32 {
    let mantissa = reg.low;
    let exponent = (reg.high & 0x7fff) as u16;
    if exponent == 0x7fff {
        2 // special
    } else if exponent == 0 {
        if mantissa != 0 {
            2
        } else {
            1 // zero
        }
    } else if mantissa >> 63 != 0 {
        0 // valid
    } else {
        2
    }
}

/// FXSAVE image to the legacy x87 save area
pub fn fpux_to_fpu(fpux: &XsaveFormat) -> I386FloatSave {
    let mut fpu = I386FloatSave {
        control_word: fpux.control_word as u32,
        status_word: fpux.status_word as u32,
        tag_word: 0xffff_0000,
        error_offset: fpux.error_offset,
        error_selector: fpux.error_selector as u32 | ((fpux.error_opcode as u32) << 16),
        data_offset: fpux.data_offset,
        data_selector: fpux.data_selector as u32,
        register_area: [0; 80],
        cr0_npx_state: fpux.status_word as u32 | 0xffff_0000,
    };
    let stack_top = ((fpux.status_word >> 11) & 7) as usize;
    for i in 0..8 {
        let reg = &fpux.float_registers[i];
        fpu.register_area[10 * i..10 * i + 8].copy_from_slice(&reg.low.to_le_bytes());
        fpu.register_area[10 * i + 8..10 * i + 10]
            .copy_from_slice(&(reg.high as u16).to_le_bytes());
        let tag = if fpux.tag_word & (1 << i) == 0 {
            3 // empty
        } else {
            x87_tag(&fpux.float_registers[i.wrapping_sub(stack_top) & 7])
        };
        fpu.tag_word |= tag << (2 * i);
    }
    fpu
}

/// Power-on MXCSR: all exceptions masked, round to nearest
pub const MXCSR_DEFAULT: u32 = 0x1f80;

/// Legacy x87 save area to an FXSAVE image
///
/// The legacy area carries no SSE state, so MXCSR starts at its reset value.
pub fn fpu_to_fpux(fpu: &I386FloatSave) -> XsaveFormat {
    let mut fpux = XsaveFormat {
        control_word: fpu.control_word as u16,
        status_word: fpu.status_word as u16,
        error_offset: fpu.error_offset,
        error_selector: fpu.error_selector as u16,
        error_opcode: (fpu.error_selector >> 16) as u16,
        data_offset: fpu.data_offset,
        data_selector: fpu.data_selector as u16,
        mx_csr: MXCSR_DEFAULT,
        mx_csr_mask: 0xffff,
        ..XsaveFormat::default()
    };
    for i in 0..8 {
        if (fpu.tag_word >> (i * 2)) & 3 != 3 {
            fpux.tag_word |= 1 << i;
        }
        let area = &fpu.register_area[10 * i..10 * i + 10];
        let mut low = [0u8; 8];
        low.copy_from_slice(&area[..8]);
        fpux.float_registers[i] = M128 {
            low: u64::from_le_bytes(low),
            high: u16::from_le_bytes([area[8], area[9]]) as u64,
        };
    }
    fpux
}
