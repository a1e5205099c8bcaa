/*!
 * Address Space Tests
 * Views, protection, large-address mode and image placement
 */

use personality_kernel::core::limits::{LIMIT_2GB, LIMIT_4GB, PAGE_SIZE};
use personality_kernel::core::{InlineString, Machine, NtStatus};
use personality_kernel::loader::{BuiltinLoader, BuiltinMapping, ImageInfo};
use personality_kernel::memory::{
    AccessKind, AddressSpace, ImageDescriptor, ImageSection, MemoryError, ProtFlags, ViewKind,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

#[derive(Default)]
struct FixupRecorder {
    fixups: Mutex<Vec<isize>>,
    refuse: bool,
}

impl BuiltinLoader for FixupRecorder {
    fn load_builtin(&self, _image_info: &ImageInfo) -> Result<(usize, usize), NtStatus> {
        Err(NtStatus::NOT_IMPLEMENTED)
    }

    fn map_builtin_module(&self, _mapping: u32) -> Result<BuiltinMapping, NtStatus> {
        Err(NtStatus::NOT_IMPLEMENTED)
    }

    fn apply_fixups(&self, _module: usize, _size: usize, delta: isize) -> Result<(), NtStatus> {
        if self.refuse {
            return Err(NtStatus::INVALID_IMAGE_FORMAT);
        }
        self.fixups.lock().push(delta);
        Ok(())
    }
}

fn image(preferred_base: usize, relocatable: bool) -> ImageDescriptor {
    ImageDescriptor {
        name: InlineString::from("sample.dll"),
        machine: Machine::Amd64,
        preferred_base,
        image_size: 3 * PAGE_SIZE,
        headers: b"MZ".to_vec(),
        sections: vec![
            ImageSection {
                rva: PAGE_SIZE,
                virtual_size: PAGE_SIZE,
                data: vec![0x90; 16],
                prot: ProtFlags::READ_EXEC,
            },
            ImageSection {
                rva: 2 * PAGE_SIZE,
                virtual_size: PAGE_SIZE,
                data: vec![7; 8],
                prot: ProtFlags::READ_WRITE,
            },
        ],
        relocatable,
    }
}

#[test]
fn test_large_address_switch_is_one_way() {
    let space = AddressSpace::new(1).unwrap();
    assert!(!space.is_large_address_aware());
    assert_eq!(space.address_limit(Machine::I386), LIMIT_2GB);

    space.set_large_address_space();
    space.set_large_address_space();
    assert!(space.is_large_address_aware());
    assert_eq!(space.address_limit(Machine::I386), LIMIT_4GB);
    assert!(space.address_limit(Machine::Amd64) > LIMIT_4GB);
    assert!(space.stats().large_address_aware);
}

#[test]
fn test_fixed_reservation_never_replaces() {
    let space = AddressSpace::new(1).unwrap();
    let region = space.reserve(2 * PAGE_SIZE, ProtFlags::READ_WRITE).unwrap();
    let err = space
        .reserve_fixed(region.base + PAGE_SIZE, PAGE_SIZE, ProtFlags::READ_WRITE)
        .unwrap_err();
    assert!(matches!(err, MemoryError::AddressUnavailable { .. }));
    assert_eq!(NtStatus::from(&err), NtStatus::CONFLICTING_ADDRESSES);

    let unaligned = space.reserve_fixed(region.base + 1, PAGE_SIZE, ProtFlags::READ_WRITE);
    assert!(matches!(unaligned, Err(MemoryError::AlignmentError { .. })));
    space.release(region.base).unwrap();
}

#[test]
fn test_protect_reports_previous_protection() {
    let space = AddressSpace::new(1).unwrap();
    let region = space.reserve(2 * PAGE_SIZE, ProtFlags::READ_WRITE).unwrap();
    let (range, old) = space
        .protect_region(region.base + 10, 20, ProtFlags::PROT_READ)
        .unwrap();
    assert_eq!(range.base, region.base);
    assert_eq!(range.size, PAGE_SIZE);
    assert_eq!(old, ProtFlags::READ_WRITE);

    assert!(!space.check_access(region.base, 8, AccessKind::Write));
    assert!(space.check_access(region.base + PAGE_SIZE, 8, AccessKind::Write));
    assert_eq!(
        space.query(region.base),
        Some((ViewKind::Private, ProtFlags::PROT_READ, true))
    );
}

#[test]
fn test_uncommitted_view_rejects_protect() {
    let space = AddressSpace::new(1).unwrap();
    let region = space.reserve_uncommitted(4 * PAGE_SIZE, ViewKind::Private).unwrap();
    assert!(space.protect_region(region.base, PAGE_SIZE, ProtFlags::PROT_READ).is_err());
    space.commit(region.base, PAGE_SIZE, ProtFlags::READ_WRITE).unwrap();
    assert!(space.check_access(region.base, PAGE_SIZE, AccessKind::Read));
    assert!(!space.check_access(region.base + PAGE_SIZE, 1, AccessKind::Read));
}

#[test]
fn test_relocated_image_gets_fixups() {
    let space = AddressSpace::new(1).unwrap();
    let occupied = space.reserve(4 * PAGE_SIZE, ProtFlags::READ_WRITE).unwrap();
    let loader = FixupRecorder::default();

    let module = space.map_module(&image(occupied.base, true), &loader).unwrap();
    assert_ne!(module.base, occupied.base);
    let fixups = loader.fixups.lock().clone();
    assert_eq!(fixups, vec![module.base.wrapping_sub(occupied.base) as isize]);

    // SAFETY: the image is mapped readable for its whole size
    let code = unsafe { *((module.base + PAGE_SIZE) as *const u8) };
    assert_eq!(code, 0x90);
    assert_eq!(
        space.query(module.base + PAGE_SIZE).map(|(kind, prot, _)| (kind, prot)),
        Some((ViewKind::Image, ProtFlags::READ_EXEC))
    );
}

#[test]
fn test_failed_mapping_leaves_no_trace() {
    let space = AddressSpace::new(1).unwrap();
    let occupied = space.reserve(4 * PAGE_SIZE, ProtFlags::READ_WRITE).unwrap();
    let views = space.stats().views;

    let fixed = space.map_module(&image(occupied.base, false), &FixupRecorder::default());
    assert!(matches!(fixed, Err(MemoryError::AddressUnavailable { .. })));

    let refusing = FixupRecorder {
        refuse: true,
        ..Default::default()
    };
    let refused = space.map_module(&image(occupied.base, true), &refusing);
    assert!(matches!(
        refused,
        Err(MemoryError::Collaborator(NtStatus::INVALID_IMAGE_FORMAT))
    ));
    assert_eq!(space.stats().views, views);
}

#[test]
fn test_section_outside_image_rejected() {
    let space = AddressSpace::new(1).unwrap();
    let mut bad = image(0, true);
    bad.sections[1].rva = 3 * PAGE_SIZE;
    assert!(matches!(
        space.map_module(&bad, &FixupRecorder::default()),
        Err(MemoryError::InvalidImage { index: 1 })
    ));
}
