/*!
 * Extended State Tests
 * YMM payload framing and the compaction snapshot
 */

use personality_kernel::context::{
    from_wire, to_wire, Amd64Context, ContextFlags, NativeContext, TranslatedContext, WireContext,
    WireFlags, XState, M128, WIRE_CONTEXT_SIZE, XSTATE_MASK_AVX,
};
use personality_kernel::core::Machine;
use pretty_assertions::assert_eq;

fn full_amd64(compaction: bool) -> TranslatedContext {
    let mut native = Amd64Context {
        rip: 0x1_4000_2000,
        rsp: 0x7ff0_0000,
        ..Default::default()
    };
    native.set_groups(ContextFlags::FULL);
    TranslatedContext::new(NativeContext::Amd64(native), compaction)
}

#[test]
fn test_zero_xstate_payload_keeps_fixed_size() {
    let ctx = full_amd64(false).with_xstate(XState::default());
    let wire = to_wire(&ctx, Machine::Amd64).unwrap();

    assert!(wire.flags.contains(WireFlags::YMM_REGISTERS));
    assert_eq!(wire.ymm, [M128::ZERO; 16]);
    assert_eq!(wire.encode().len(), WIRE_CONTEXT_SIZE);

    let without = to_wire(&full_amd64(false), Machine::Amd64).unwrap();
    assert!(!without.flags.contains(WireFlags::YMM_REGISTERS));
    assert_eq!(without.encode().len(), WIRE_CONTEXT_SIZE);
}

#[test]
fn test_zero_payload_restores_no_registers() {
    let ctx = full_amd64(false).with_xstate(XState::default());
    let wire = WireContext::decode(&to_wire(&ctx, Machine::Amd64).unwrap().encode()).unwrap();
    let back = from_wire(&wire, Machine::Amd64, false).unwrap();
    let xstate = back.xstate().expect("xstate group kept");
    assert_eq!(xstate.mask & XSTATE_MASK_AVX, 0);
    assert!(!xstate.has_ymm_data());
}

#[test]
fn test_ymm_upper_halves_roundtrip() {
    let mut xstate = XState {
        mask: XSTATE_MASK_AVX,
        ..XState::default()
    };
    for (i, reg) in xstate.ymm.iter_mut().enumerate() {
        *reg = M128 {
            low: i as u64,
            high: !(i as u64),
        };
    }
    let ctx = full_amd64(false).with_xstate(xstate);
    let wire = WireContext::decode(&to_wire(&ctx, Machine::Amd64).unwrap().encode()).unwrap();
    let back = from_wire(&wire, Machine::Amd64, false).unwrap();
    assert_eq!(back.xstate().unwrap().ymm, xstate.ymm);
    assert_eq!(back.groups(), ContextFlags::FULL | ContextFlags::XSTATE);
}

#[test]
fn test_compaction_comes_from_capture_snapshot() {
    let ctx = full_amd64(false).with_xstate(XState::default());
    let wire = to_wire(&ctx, Machine::Amd64).unwrap();

    let compacted = from_wire(&wire, Machine::Amd64, true).unwrap();
    assert_ne!(compacted.xstate().unwrap().compaction_mask, 0);
    assert!(compacted.compaction);

    let standard = from_wire(&wire, Machine::Amd64, false).unwrap();
    assert_eq!(standard.xstate().unwrap().compaction_mask, 0);
}

#[test]
fn test_required_size_covers_xstate() {
    let amd64 = TranslatedContext::required_size(Machine::Amd64).unwrap();
    let i386 = TranslatedContext::required_size(Machine::I386).unwrap();
    assert!(amd64 > personality_kernel::context::AMD64_CONTEXT_SIZE);
    assert!(i386 > personality_kernel::context::I386_CONTEXT_SIZE);
    assert!(TranslatedContext::required_size(Machine::Arm64).is_err());
}
