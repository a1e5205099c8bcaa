/*!
 * Image Mapping
 * All-or-nothing placement of module images in the address space
 */

use super::host::Placement;
use super::space::{round_up, AddressSpace};
use super::types::{MemoryError, MemoryResult, ProtFlags, Region, ViewKind};
use crate::core::inline_string::InlineString;
use crate::core::limits::PAGE_SIZE;
use crate::core::types::{Address, Machine, ObjHandle, Size};
use crate::loader::{BuiltinLoader, ImageInfo};
use tracing::{debug, info, warn};

/// One section of an image to map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSection {
    pub rva: usize,
    pub virtual_size: Size,
    pub data: Vec<u8>,
    pub prot: ProtFlags,
}

/// Image contents already split into sections by the collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub name: InlineString,
    pub machine: Machine,
    pub preferred_base: Address,
    pub image_size: Size,
    pub headers: Vec<u8>,
    pub sections: Vec<ImageSection>,
    /// Image carries relocations and must be fixed up when moved
    pub relocatable: bool,
}

/// A mapped module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    pub base: Address,
    pub size: Size,
    pub name: InlineString,
    pub image_info: Option<ImageInfo>,
}

impl ModuleHandle {
    pub fn region(&self) -> Region {
        Region::new(self.base, self.size)
    }
}

impl AddressSpace {
    /// Map an image, preferring its preferred base
    ///
    /// On any failure the whole image is unmapped and nothing is recorded.
    pub fn map_module(
        &self,
        image: &ImageDescriptor,
        loader: &dyn BuiltinLoader,
    ) -> MemoryResult<ModuleHandle> {
        let size = round_up(image.image_size);
        let limit = self.address_limit(image.machine);
        for (index, section) in image.sections.iter().enumerate() {
            let extent = section.virtual_size.max(section.data.len());
            if section.rva.checked_add(extent).map_or(true, |end| end > size) {
                return Err(MemoryError::InvalidImage { index });
            }
        }
        if image.headers.len() > size {
            return Err(MemoryError::InvalidImage { index: usize::MAX });
        }

        let base = self.place_image(image, size, limit)?;
        if let Err(err) = self.fill_image(image, base, size, loader) {
            warn!(module = %image.name, base = format_args!("{:#x}", base), error = %err, "Image mapping failed");
            let _ = self.mapper().unmap(base, size);
            return Err(err);
        }

        self.record_view(Region::new(base, size), ViewKind::Image, ProtFlags::PROT_READ);
        {
            let mut views = self.views.lock();
            if let Some(view) = views.get_mut(&base) {
                for section in &image.sections {
                    let first = section.rva / PAGE_SIZE;
                    let count = round_up(section.virtual_size.max(section.data.len())) / PAGE_SIZE;
                    for page in &mut view.pages[first..first + count] {
                        page.prot = section.prot;
                    }
                }
            }
        }
        info!(
            module = %image.name,
            base = format_args!("{:#x}", base),
            size,
            relocated = base != image.preferred_base,
            "Module mapped"
        );
        Ok(ModuleHandle {
            base,
            size,
            name: image.name.clone(),
            image_info: None,
        })
    }

    fn place_image(&self, image: &ImageDescriptor, size: Size, limit: Address) -> MemoryResult<Address> {
        let preferred_fits = image.preferred_base != 0
            && image.preferred_base % PAGE_SIZE == 0
            && image
                .preferred_base
                .checked_add(size - 1)
                .is_some_and(|last| last <= limit);
        if preferred_fits && self.find_overlap(Region::new(image.preferred_base, size)).is_none() {
            match self.mapper().map(Placement::Fixed(image.preferred_base), size, ProtFlags::READ_WRITE) {
                Ok(base) => return Ok(base),
                Err(MemoryError::AddressUnavailable { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        if !image.relocatable {
            return Err(MemoryError::AddressUnavailable {
                address: image.preferred_base,
                size,
            });
        }
        let placement = if image.machine.is_64bit() {
            Placement::Anywhere
        } else {
            Placement::Below(limit)
        };
        self.mapper().map(placement, size, ProtFlags::READ_WRITE)
    }

    fn fill_image(
        &self,
        image: &ImageDescriptor,
        base: Address,
        size: Size,
        loader: &dyn BuiltinLoader,
    ) -> MemoryResult<()> {
        // SAFETY: [base, base+size) was just mapped read-write and is owned by us;
        // section bounds were validated against size
        unsafe {
            std::ptr::copy_nonoverlapping(image.headers.as_ptr(), base as *mut u8, image.headers.len());
            for section in &image.sections {
                std::ptr::copy_nonoverlapping(
                    section.data.as_ptr(),
                    (base + section.rva) as *mut u8,
                    section.data.len(),
                );
            }
        }

        if base != image.preferred_base {
            let delta = base.wrapping_sub(image.preferred_base) as isize;
            debug!(module = %image.name, delta, "Applying fixups");
            loader
                .apply_fixups(base, size, delta)
                .map_err(MemoryError::Collaborator)?;
        }

        self.mapper().protect(base, size, ProtFlags::PROT_READ)?;
        for section in &image.sections {
            let extent = round_up(section.virtual_size.max(section.data.len()));
            if extent > 0 {
                self.mapper().protect(base + section.rva, extent, section.prot)?;
            }
        }
        Ok(())
    }

    /// Map a builtin module through the collaborator and record its view
    pub fn map_builtin(
        &self,
        mapping: ObjHandle,
        loader: &dyn BuiltinLoader,
    ) -> MemoryResult<ModuleHandle> {
        let mapped = loader
            .map_builtin_module(mapping)
            .map_err(MemoryError::Collaborator)?;
        let size = round_up(mapped.size);
        let limit = self.address_limit(mapped.image_info.machine);
        if mapped.module.checked_add(size - 1).map_or(true, |last| last > limit) {
            warn!(module = %mapped.image_info.name, "Builtin mapped above the address limit");
            return Err(MemoryError::OutOfAddressSpace {
                requested: size,
                limit,
            });
        }
        self.record_view(Region::new(mapped.module, size), ViewKind::Builtin, ProtFlags::READ_EXEC);
        info!(
            module = %mapped.image_info.name,
            base = format_args!("{:#x}", mapped.module),
            "Builtin module mapped"
        );
        Ok(ModuleHandle {
            base: mapped.module,
            size,
            name: mapped.image_info.name.clone(),
            image_info: Some(mapped.image_info),
        })
    }
}
