/*!
 * Host Mapping Primitives
 * Thin seam over mmap/munmap/mprotect
 */

use super::types::{MemoryError, MemoryResult, ProtFlags};
use crate::core::types::{Address, Size};
use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags as HostProt};
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Where a new mapping may be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Anywhere the host chooses
    Anywhere,
    /// Exactly at this address, never replacing an existing mapping
    Fixed(Address),
    /// Anywhere as long as the whole range ends at or below this address
    Below(Address),
}

/// Host mapping operations used by the address-space manager
#[cfg_attr(test, mockall::automock)]
pub trait HostMapper: Send + Sync {
    fn map(&self, placement: Placement, size: Size, prot: ProtFlags) -> MemoryResult<Address>;

    fn unmap(&self, address: Address, size: Size) -> MemoryResult<()>;

    fn protect(&self, address: Address, size: Size, prot: ProtFlags) -> MemoryResult<()>;
}

/// Anonymous private mappings through nix
#[derive(Debug, Default, Clone, Copy)]
pub struct NixMapper;

impl HostMapper for NixMapper {
    fn map(&self, placement: Placement, size: Size, prot: ProtFlags) -> MemoryResult<Address> {
        let length = NonZeroUsize::new(size).ok_or(MemoryError::AlignmentError {
            address: 0,
            alignment: crate::core::limits::PAGE_SIZE,
        })?;

        let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE;
        let hint = match placement {
            Placement::Anywhere => None,
            Placement::Fixed(address) => {
                flags |= MapFlags::MAP_FIXED_NOREPLACE;
                Some(NonZeroUsize::new(address).ok_or(MemoryError::InvalidAddress(address))?)
            }
            Placement::Below(limit) => {
                flags |= low_memory_flags(limit);
                None
            }
        };

        // SAFETY: anonymous mapping, never MAP_FIXED over existing memory
        let ptr = unsafe { mman::mmap_anonymous(hint, length, host_prot(prot), flags) }
            .map_err(|errno| map_errno(errno, hint.map_or(0, NonZeroUsize::get), size, prot))?;
        let address = ptr.as_ptr() as Address;

        match placement {
            // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint
            Placement::Fixed(want) if address != want => {
                self.unmap(address, size)?;
                Err(MemoryError::AddressUnavailable {
                    address: want,
                    size,
                })
            }
            Placement::Below(limit) if address + (size - 1) > limit => {
                self.unmap(address, size)?;
                Err(MemoryError::OutOfAddressSpace {
                    requested: size,
                    limit,
                })
            }
            _ => Ok(address),
        }
    }

    fn unmap(&self, address: Address, size: Size) -> MemoryResult<()> {
        let ptr = NonNull::new(address as *mut libc::c_void).ok_or(MemoryError::InvalidAddress(address))?;
        // SAFETY: caller owns the range through the view table
        unsafe { mman::munmap(ptr, size) }
            .map_err(|errno| map_errno(errno, address, size, ProtFlags::PROT_NONE))
    }

    fn protect(&self, address: Address, size: Size, prot: ProtFlags) -> MemoryResult<()> {
        let ptr = NonNull::new(address as *mut libc::c_void).ok_or(MemoryError::InvalidAddress(address))?;
        // SAFETY: caller owns the range through the view table
        unsafe { mman::mprotect(ptr, size, host_prot(prot)) }
            .map_err(|errno| map_errno(errno, address, size, prot))
    }
}

/// Host protection for a guest protection; guard pages are inaccessible
pub fn host_prot(prot: ProtFlags) -> HostProt {
    let effective = prot.host_effective();
    let mut flags = HostProt::PROT_NONE;
    if effective.read {
        flags |= HostProt::PROT_READ;
    }
    if effective.write {
        flags |= HostProt::PROT_WRITE;
    }
    if effective.exec {
        flags |= HostProt::PROT_EXEC;
    }
    flags
}

/// Translate a host mapping failure into the memory error taxonomy
pub fn map_errno(errno: Errno, address: Address, size: Size, prot: ProtFlags) -> MemoryError {
    match errno {
        Errno::EEXIST => MemoryError::AddressUnavailable { address, size },
        Errno::ENOMEM => MemoryError::OutOfAddressSpace {
            requested: size,
            limit: usize::MAX,
        },
        _ => MemoryError::MappingDenied {
            address,
            prot,
            errno,
        },
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn low_memory_flags(limit: Address) -> MapFlags {
    if limit <= crate::core::limits::LIMIT_2GB {
        MapFlags::MAP_32BIT
    } else {
        MapFlags::empty()
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn low_memory_flags(_limit: Address) -> MapFlags {
    MapFlags::empty()
}
