/*!
 * Memory Types
 * Common types for address-space management
 */

use crate::core::status::NtStatus;
use crate::core::types::{Address, Size};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out of address space: requested {requested} bytes below 0x{limit:x}")]
    OutOfAddressSpace { requested: usize, limit: usize },

    #[error("Address range 0x{address:x}+0x{size:x} is already in use")]
    AddressUnavailable { address: usize, size: usize },

    #[error("Host denied mapping at 0x{address:x} with {prot}: {errno}")]
    MappingDenied {
        address: usize,
        prot: ProtFlags,
        errno: nix::errno::Errno,
    },

    #[error("Invalid memory address: 0x{0:x}")]
    InvalidAddress(usize),

    #[error("Alignment error: address 0x{address:x}, required alignment {alignment}")]
    AlignmentError { address: usize, alignment: usize },

    #[error("No free environment block: all {capacity} slots in use")]
    SlotsExhausted { capacity: usize },

    #[error("Image section {index} does not fit in the mapped image")]
    InvalidImage { index: usize },

    #[error("Module mapping collaborator failed: {0}")]
    Collaborator(NtStatus),
}

impl From<&MemoryError> for NtStatus {
    fn from(err: &MemoryError) -> Self {
        match err {
            MemoryError::OutOfAddressSpace { .. } | MemoryError::SlotsExhausted { .. } => {
                NtStatus::NO_MEMORY
            }
            MemoryError::AddressUnavailable { .. } => NtStatus::CONFLICTING_ADDRESSES,
            MemoryError::MappingDenied { .. } => NtStatus::ACCESS_DENIED,
            MemoryError::InvalidAddress(_) | MemoryError::AlignmentError { .. } => {
                NtStatus::INVALID_PARAMETER
            }
            MemoryError::InvalidImage { .. } => NtStatus::INVALID_IMAGE_FORMAT,
            MemoryError::Collaborator(status) => *status,
        }
    }
}

/// Guest page-protection codes
pub mod page {
    pub const NOACCESS: u32 = 0x01;
    pub const READONLY: u32 = 0x02;
    pub const READWRITE: u32 = 0x04;
    pub const WRITECOPY: u32 = 0x08;
    pub const EXECUTE: u32 = 0x10;
    pub const EXECUTE_READ: u32 = 0x20;
    pub const EXECUTE_READWRITE: u32 = 0x40;
    pub const EXECUTE_WRITECOPY: u32 = 0x80;
    pub const GUARD: u32 = 0x100;
    pub const NOCACHE: u32 = 0x200;
    pub const WRITECOMBINE: u32 = 0x400;
}

/// Page protection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProtFlags {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// One-shot guard: the first access faults and clears the flag
    pub guard: bool,
}

impl ProtFlags {
    pub const PROT_NONE: Self = Self {
        read: false,
        write: false,
        exec: false,
        guard: false,
    };

    pub const PROT_READ: Self = Self {
        read: true,
        write: false,
        exec: false,
        guard: false,
    };

    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        exec: false,
        guard: false,
    };

    pub const READ_EXEC: Self = Self {
        read: true,
        write: false,
        exec: true,
        guard: false,
    };

    pub const ALL: Self = Self {
        read: true,
        write: true,
        exec: true,
        guard: false,
    };

    /// Decode a guest `PAGE_*` protection value
    pub fn from_page_protection(protect: u32) -> Option<Self> {
        let base = match protect & 0xff {
            page::NOACCESS => Self::PROT_NONE,
            page::READONLY => Self::PROT_READ,
            page::READWRITE | page::WRITECOPY => Self::READ_WRITE,
            page::EXECUTE | page::EXECUTE_READ => Self::READ_EXEC,
            page::EXECUTE_READWRITE | page::EXECUTE_WRITECOPY => Self::ALL,
            _ => return None,
        };
        Some(Self {
            guard: protect & page::GUARD != 0,
            ..base
        })
    }

    /// Encode back to the closest guest `PAGE_*` value
    pub fn to_page_protection(self) -> u32 {
        let base = match (self.read, self.write, self.exec) {
            (_, _, true) if self.write => page::EXECUTE_READWRITE,
            (true, _, true) => page::EXECUTE_READ,
            (false, _, true) => page::EXECUTE,
            (_, true, false) => page::READWRITE,
            (true, false, false) => page::READONLY,
            (false, false, false) => page::NOACCESS,
        };
        if self.guard {
            base | page::GUARD
        } else {
            base
        }
    }

    /// Protection the host actually applies; guard pages are inaccessible
    pub fn host_effective(self) -> Self {
        if self.guard {
            Self::PROT_NONE
        } else {
            self
        }
    }

    #[inline]
    pub fn allows(self, access: AccessKind) -> bool {
        if self.guard {
            return false;
        }
        match access {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
            AccessKind::Execute => self.exec,
        }
    }
}

impl fmt::Display for ProtFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.exec { 'x' } else { '-' },
            if self.guard { 'g' } else { '-' },
        )
    }
}

/// Kind of access that triggered a fault, as reported in exception parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccessKind {
    Read = 0,
    Write = 1,
    Execute = 8,
}

/// What a view is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewKind {
    Private,
    Image,
    Builtin,
    ThreadStack,
    TebArena,
    KernelStacks,
}

/// A reserved range of address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub base: Address,
    pub size: Size,
}

impl Region {
    pub const fn new(base: Address, size: Size) -> Self {
        Self { base, size }
    }

    #[inline]
    pub const fn end(&self) -> Address {
        self.base + self.size
    }

    #[inline]
    pub const fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    #[inline]
    pub const fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Outcome of a guest page fault presented to the address-space manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// Fault resolved, retry the instruction
    Handled,
    /// Escalate to the guest exception dispatcher with this status
    Unhandled(NtStatus),
}

/// Address-space statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub views: usize,
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    pub large_address_aware: bool,
}
