/*!
 * Context Round-Trip Tests
 * Native -> wire -> native is the identity for every flagged group
 */

use personality_kernel::context::{
    from_wire, to_wire, Amd64Context, ContextFlags, I386Context, NativeContext, TranslatedContext,
    WireContext, XsaveFormat, M128, WIRE_CONTEXT_SIZE,
};
use personality_kernel::core::Machine;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const GROUPS: [ContextFlags; 5] = [
    ContextFlags::CONTROL,
    ContextFlags::INTEGER,
    ContextFlags::SEGMENTS,
    ContextFlags::FLOATING_POINT,
    ContextFlags::DEBUG_REGISTERS,
];

fn groups_strategy(extra: &'static [ContextFlags]) -> impl Strategy<Value = ContextFlags> {
    let all: Vec<ContextFlags> = GROUPS.iter().chain(extra).copied().collect();
    prop::collection::vec(any::<bool>(), all.len()).prop_map(move |picks| {
        all.iter()
            .zip(picks)
            .filter(|(_, on)| *on)
            .fold(ContextFlags::empty(), |acc, (group, _)| acc | *group)
    })
}

fn m128() -> impl Strategy<Value = M128> {
    (any::<u64>(), any::<u64>()).prop_map(|(low, high)| M128 { low, high })
}

fn fxsave() -> impl Strategy<Value = XsaveFormat> {
    (
        any::<u16>(),
        any::<u16>(),
        any::<u8>(),
        any::<u32>(),
        prop::collection::vec(m128(), 16),
    )
        .prop_map(|(control_word, status_word, tag_word, mx_csr, xmm)| {
            let mut fx = XsaveFormat {
                control_word,
                status_word,
                tag_word,
                mx_csr,
                ..XsaveFormat::default()
            };
            fx.xmm_registers.copy_from_slice(&xmm);
            fx
        })
}

prop_compose! {
    fn amd64_context()(
        groups in groups_strategy(&[]),
        control in (any::<u64>(), any::<u64>(), any::<u64>(), any::<u16>(), any::<u16>(), any::<u32>()),
        integer in any::<[u64; 14]>(),
        segments in any::<[u16; 4]>(),
        fp in fxsave(),
        debug in any::<[u64; 6]>(),
    ) -> Amd64Context {
        let mut ctx = Amd64Context::default();
        if groups.contains(ContextFlags::CONTROL) {
            (ctx.rip, ctx.rbp, ctx.rsp, ctx.seg_cs, ctx.seg_ss, ctx.eflags) = control;
        }
        if groups.contains(ContextFlags::INTEGER) {
            ctx.set_integer_regs(integer);
        }
        if groups.contains(ContextFlags::SEGMENTS) {
            [ctx.seg_ds, ctx.seg_es, ctx.seg_fs, ctx.seg_gs] = segments;
        }
        if groups.contains(ContextFlags::FLOATING_POINT) {
            ctx.flt_save = fp;
            ctx.mx_csr = fp.mx_csr;
        }
        if groups.contains(ContextFlags::DEBUG_REGISTERS) {
            [ctx.dr0, ctx.dr1, ctx.dr2, ctx.dr3, ctx.dr6, ctx.dr7] = debug;
        }
        ctx.set_groups(groups);
        ctx
    }
}

prop_compose! {
    fn i386_context()(
        groups in groups_strategy(&[ContextFlags::EXTENDED_REGISTERS]),
        control in any::<[u32; 6]>(),
        integer in any::<[u32; 6]>(),
        segments in any::<[u32; 4]>(),
        fp_words in any::<[u32; 8]>(),
        fp_area in prop::collection::vec(any::<u8>(), 80),
        debug in any::<[u32; 6]>(),
        ext in prop::collection::vec(any::<u8>(), 512),
    ) -> I386Context {
        let mut ctx = I386Context::default();
        if groups.contains(ContextFlags::CONTROL) {
            [ctx.eip, ctx.ebp, ctx.esp, ctx.eflags, ctx.seg_cs, ctx.seg_ss] = control;
        }
        if groups.contains(ContextFlags::INTEGER) {
            [ctx.eax, ctx.ebx, ctx.ecx, ctx.edx, ctx.esi, ctx.edi] = integer;
        }
        if groups.contains(ContextFlags::SEGMENTS) {
            [ctx.seg_ds, ctx.seg_es, ctx.seg_fs, ctx.seg_gs] = segments;
        }
        if groups.contains(ContextFlags::FLOATING_POINT) {
            let f = &mut ctx.float_save;
            [
                f.control_word,
                f.status_word,
                f.tag_word,
                f.error_offset,
                f.error_selector,
                f.data_offset,
                f.data_selector,
                f.cr0_npx_state,
            ] = fp_words;
            f.register_area.copy_from_slice(&fp_area);
        }
        if groups.contains(ContextFlags::DEBUG_REGISTERS) {
            [ctx.dr0, ctx.dr1, ctx.dr2, ctx.dr3, ctx.dr6, ctx.dr7] = debug;
        }
        if groups.contains(ContextFlags::EXTENDED_REGISTERS) {
            ctx.extended_registers.copy_from_slice(&ext);
        }
        ctx.set_groups(groups);
        ctx
    }
}

fn through_bytes(ctx: &TranslatedContext) -> TranslatedContext {
    let machine = ctx.machine();
    let wire = to_wire(ctx, machine).unwrap();
    let bytes = wire.encode();
    assert_eq!(bytes.len(), WIRE_CONTEXT_SIZE);
    let decoded = WireContext::decode(&bytes).unwrap();
    assert_eq!(decoded, wire);
    from_wire(&decoded, machine, ctx.compaction).unwrap()
}

proptest! {
    #[test]
    fn amd64_roundtrip_is_identity(native in amd64_context(), compaction in any::<bool>()) {
        let ctx = TranslatedContext::new(NativeContext::Amd64(native), compaction);
        prop_assert_eq!(through_bytes(&ctx), ctx);
    }

    #[test]
    fn i386_roundtrip_is_identity(native in i386_context()) {
        let ctx = TranslatedContext::new(NativeContext::I386(native), false);
        prop_assert_eq!(through_bytes(&ctx), ctx);
    }

    #[test]
    fn absent_groups_arrive_zeroed(native in amd64_context()) {
        let ctx = TranslatedContext::new(NativeContext::Amd64(native), false);
        let back = through_bytes(&ctx);
        let NativeContext::Amd64(back) = back.native else {
            panic!("machine changed");
        };
        if !native.groups().contains(ContextFlags::INTEGER) {
            prop_assert_eq!(back.integer_regs(), [0u64; 14]);
        }
        if !native.groups().contains(ContextFlags::FLOATING_POINT) {
            prop_assert_eq!(back.flt_save, XsaveFormat::default());
            prop_assert_eq!(back.mx_csr, 0);
        }
    }
}

#[test]
fn test_machine_code_survives_encoding() {
    let ctx = TranslatedContext::new(NativeContext::I386(I386Context::default()), false);
    let wire = to_wire(&ctx, Machine::I386).unwrap();
    let decoded = WireContext::decode(&wire.encode()).unwrap();
    assert_eq!(decoded.machine, Machine::I386);
}

#[test]
fn test_truncated_wire_rejected() {
    let wire = WireContext::new(Machine::Amd64).encode();
    assert!(WireContext::decode(&wire[..WIRE_CONTEXT_SIZE - 1]).is_err());
}
