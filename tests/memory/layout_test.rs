/*!
 * TEB Layout Tests
 * Slot addresses, signal stacks and kernel stacks never overlap
 */

use personality_kernel::core::limits::{PAGE_SIZE, SIGNAL_STACK_SIZE, TEB_SIZE};
use personality_kernel::core::SlotId;
use personality_kernel::memory::{signal_stack_for, AddressSpace, MemoryError, Region};
use pretty_assertions::assert_eq;

const CAPACITY: usize = 8;

fn all_slots(space: &AddressSpace) -> Vec<SlotId> {
    (0..CAPACITY).map(|_| space.alloc_teb().unwrap()).collect()
}

#[test]
fn test_signal_stacks_never_overlap() {
    let space = AddressSpace::new(CAPACITY).unwrap();
    let slots = all_slots(&space);
    let tebs = space.tebs();

    let mut regions: Vec<Region> = Vec::new();
    for &slot in &slots {
        let teb = tebs.teb_address(slot);
        let signal = tebs.signal_stack(slot);
        assert_eq!(signal.base, signal_stack_for(teb));
        assert_eq!(signal.size, SIGNAL_STACK_SIZE);
        regions.push(Region::new(teb, TEB_SIZE));
        regions.push(signal);
        regions.push(tebs.kernel_stack(slot));
    }
    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn test_signal_stack_owner_lookup() {
    let space = AddressSpace::new(CAPACITY).unwrap();
    let slots = all_slots(&space);
    let tebs = space.tebs();
    for &slot in &slots {
        let signal = tebs.signal_stack(slot);
        assert_eq!(tebs.signal_stack_owner(signal.base), Some(slot));
        assert_eq!(tebs.signal_stack_owner(signal.end() - 1), Some(slot));
        assert_eq!(tebs.signal_stack_owner(tebs.teb_address(slot)), None);
        assert_eq!(tebs.slot_of_teb(tebs.teb_address(slot)), Some(slot));
    }
}

#[test]
fn test_kernel_stack_guard_detected() {
    let space = AddressSpace::new(2).unwrap();
    let slot = space.alloc_teb().unwrap();
    let stack = space.tebs().kernel_stack(slot);
    assert!(space.tebs().is_kernel_stack_guard(stack.base - PAGE_SIZE));
    assert!(!space.tebs().is_kernel_stack_guard(stack.base));
    assert!(!space.tebs().is_kernel_stack_guard(stack.end() - 8));
}

#[test]
fn test_slot_exhaustion_and_reuse() {
    let space = AddressSpace::new(2).unwrap();
    let a = space.alloc_teb().unwrap();
    let b = space.alloc_teb().unwrap();
    assert!(matches!(
        space.alloc_teb(),
        Err(MemoryError::SlotsExhausted { capacity: 2 })
    ));

    let teb_b = space.tebs().teb_address(b);
    space.free_teb(b).unwrap();
    let again = space.alloc_teb().unwrap();
    assert_eq!(space.tebs().teb_address(again), teb_b);
    assert_ne!(again, a);
}

#[test]
fn test_zero_capacity_rejected() {
    assert!(matches!(
        AddressSpace::new(0),
        Err(MemoryError::SlotsExhausted { capacity: 0 })
    ));
}
