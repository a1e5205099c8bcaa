/*!
 * Address-Space Manager
 * View table over host mappings with guest page protection semantics
 *
 * Every mapping the runtime hands out is recorded as a view keyed by its base
 * address. Each view tracks per-page guest protection so guard pages and
 * stack growth can be resolved from the fault path. Mapping operations are
 * atomic (a failed request leaves no partial view behind) but not reentrant.
 */

use super::host::{HostMapper, NixMapper, Placement};
use super::layout::TebArena;
use super::types::{
    AccessKind, FaultResolution, MemoryError, MemoryResult, MemoryStats, ProtFlags, Region,
    ViewKind,
};
use crate::core::limits::{LIMIT_2GB, LIMIT_4GB, PAGE_MASK, PAGE_SIZE};
use crate::core::status::NtStatus;
use crate::core::types::{Address, Machine, Size, SlotId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Highest user address for 64-bit guests
pub const USER_SPACE_LIMIT_64: Address = 0x7fff_ffff_ffff;

#[inline]
pub(crate) fn round_down(addr: Address) -> Address {
    addr & !PAGE_MASK
}

#[inline]
pub(crate) fn round_up(size: Size) -> Size {
    (size + PAGE_MASK) & !PAGE_MASK
}

/// Per-page guest state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageState {
    pub prot: ProtFlags,
    pub committed: bool,
}

/// One recorded mapping
#[derive(Debug, Clone)]
pub(crate) struct View {
    pub region: Region,
    pub kind: ViewKind,
    pub pages: Vec<PageState>,
}

impl View {
    fn new(region: Region, kind: ViewKind, prot: ProtFlags, committed: bool) -> Self {
        Self {
            region,
            kind,
            pages: vec![PageState { prot, committed }; region.size / PAGE_SIZE],
        }
    }

    #[inline]
    pub fn page_index(&self, addr: Address) -> usize {
        (addr - self.region.base) / PAGE_SIZE
    }
}

/// Process address space
pub struct AddressSpace {
    mapper: Arc<dyn HostMapper>,
    pub(crate) views: Mutex<BTreeMap<Address, View>>,
    large_address_aware: AtomicBool,
    tebs: TebArena,
}

impl AddressSpace {
    /// Create the address space and reserve the TEB arena for `thread_capacity` threads
    pub fn new(thread_capacity: usize) -> MemoryResult<Self> {
        Self::with_mapper(Arc::new(NixMapper), thread_capacity)
    }

    pub fn with_mapper(mapper: Arc<dyn HostMapper>, thread_capacity: usize) -> MemoryResult<Self> {
        let tebs = TebArena::reserve(mapper.as_ref(), thread_capacity)?;
        let space = Self {
            mapper,
            views: Mutex::new(BTreeMap::new()),
            large_address_aware: AtomicBool::new(false),
            tebs,
        };
        {
            let mut views = space.views.lock();
            for (region, kind) in space.tebs.regions() {
                let mut view = View::new(region, kind, ProtFlags::READ_WRITE, true);
                if kind == ViewKind::KernelStacks {
                    for index in space.tebs.kernel_guard_pages() {
                        view.pages[index].prot = ProtFlags::PROT_NONE;
                    }
                }
                views.insert(region.base, view);
            }
        }
        info!(
            capacity = thread_capacity,
            teb_base = format_args!("{:#x}", space.tebs.teb_region().base),
            "Address space initialized"
        );
        Ok(space)
    }

    /// TEB and kernel-stack arena
    #[inline]
    pub fn tebs(&self) -> &TebArena {
        &self.tebs
    }

    /// Take a TEB slot; the block comes back zeroed
    pub fn alloc_teb(&self) -> MemoryResult<SlotId> {
        let slot = self.tebs.alloc()?;
        debug!(%slot, teb = format_args!("{:#x}", self.tebs.teb_address(slot)), "TEB allocated");
        Ok(slot)
    }

    pub fn free_teb(&self, slot: SlotId) -> MemoryResult<()> {
        self.tebs.free(slot)?;
        debug!(%slot, "TEB released");
        Ok(())
    }

    pub(crate) fn mapper(&self) -> &dyn HostMapper {
        self.mapper.as_ref()
    }

    /// Reserve and commit `size` bytes anywhere
    pub fn reserve(&self, size: Size, prot: ProtFlags) -> MemoryResult<Region> {
        self.map_view(Placement::Anywhere, size, prot, ViewKind::Private, true)
    }

    /// Reserve and commit `size` bytes at exactly `addr`, never replacing existing mappings
    pub fn reserve_fixed(&self, addr: Address, size: Size, prot: ProtFlags) -> MemoryResult<Region> {
        if addr & PAGE_MASK != 0 {
            return Err(MemoryError::AlignmentError {
                address: addr,
                alignment: PAGE_SIZE,
            });
        }
        if self.find_overlap(Region::new(addr, round_up(size))).is_some() {
            return Err(MemoryError::AddressUnavailable {
                address: addr,
                size,
            });
        }
        self.map_view(Placement::Fixed(addr), size, prot, ViewKind::Private, true)
    }

    /// Reserve `size` bytes of inaccessible address space for later commits
    pub fn reserve_uncommitted(&self, size: Size, kind: ViewKind) -> MemoryResult<Region> {
        self.map_view(Placement::Anywhere, size, ProtFlags::PROT_NONE, kind, false)
    }

    pub(crate) fn map_view(
        &self,
        placement: Placement,
        size: Size,
        prot: ProtFlags,
        kind: ViewKind,
        committed: bool,
    ) -> MemoryResult<Region> {
        let size = round_up(size);
        let host = if committed { prot } else { ProtFlags::PROT_NONE };
        let base = self.mapper.map(placement, size, host)?;
        let region = Region::new(base, size);
        self.views
            .lock()
            .insert(base, View::new(region, kind, prot, committed));
        debug!(base = format_args!("{:#x}", base), size, ?kind, %prot, "View mapped");
        Ok(region)
    }

    /// Record a view mapped by someone else (module collaborator)
    pub(crate) fn record_view(&self, region: Region, kind: ViewKind, prot: ProtFlags) {
        self.views
            .lock()
            .insert(region.base, View::new(region, kind, prot, true));
    }

    /// Commit pages inside an existing view
    pub fn commit(&self, addr: Address, size: Size, prot: ProtFlags) -> MemoryResult<Region> {
        let start = round_down(addr);
        let end = round_up(addr + size.max(1));
        let mut views = self.views.lock();
        let view = Self::view_covering(&mut views, start, end)?;
        self.mapper.protect(start, end - start, prot)?;
        let first = view.page_index(start);
        for page in &mut view.pages[first..first + (end - start) / PAGE_SIZE] {
            *page = PageState {
                prot,
                committed: true,
            };
        }
        Ok(Region::new(start, end - start))
    }

    /// Release a whole view starting at `addr`
    pub fn release(&self, addr: Address) -> MemoryResult<()> {
        let mut views = self.views.lock();
        let view = views.get(&addr).ok_or(MemoryError::InvalidAddress(addr))?;
        if matches!(view.kind, ViewKind::TebArena | ViewKind::KernelStacks) {
            return Err(MemoryError::InvalidAddress(addr));
        }
        self.mapper.unmap(view.region.base, view.region.size)?;
        let view = views.remove(&addr);
        debug!(base = format_args!("{:#x}", addr), kind = ?view.map(|v| v.kind), "View released");
        Ok(())
    }

    /// Change protection of committed pages
    ///
    /// The range is widened to page granularity; the rounded range is returned
    /// together with the previous protection of its first page.
    pub fn protect_region(
        &self,
        addr: Address,
        size: Size,
        prot: ProtFlags,
    ) -> MemoryResult<(Region, ProtFlags)> {
        let start = round_down(addr);
        let end = round_up(addr + size.max(1));
        let mut views = self.views.lock();
        let view = Self::view_covering(&mut views, start, end)?;
        let first = view.page_index(start);
        let count = (end - start) / PAGE_SIZE;
        if view.pages[first..first + count].iter().any(|p| !p.committed) {
            return Err(MemoryError::InvalidAddress(start));
        }
        let old = view.pages[first].prot;
        self.mapper.protect(start, end - start, prot)?;
        for page in &mut view.pages[first..first + count] {
            page.prot = prot;
        }
        Ok((Region::new(start, end - start), old))
    }

    /// Guest protection of the page containing `addr`
    pub fn query(&self, addr: Address) -> Option<(ViewKind, ProtFlags, bool)> {
        let views = self.views.lock();
        let view = Self::view_containing(&views, addr)?;
        let page = view.pages[view.page_index(addr)];
        Some((view.kind, page.prot, page.committed))
    }

    /// Check that `[addr, addr+size)` is committed and allows `access`
    pub fn check_access(&self, addr: Address, size: Size, access: AccessKind) -> bool {
        if size == 0 {
            return true;
        }
        let Some(last) = addr.checked_add(size - 1) else {
            return false;
        };
        let views = self.views.lock();
        let mut page_addr = round_down(addr);
        while page_addr <= last {
            let Some(view) = Self::view_containing(&views, page_addr) else {
                return false;
            };
            let page = view.pages[view.page_index(page_addr)];
            if !page.committed || !page.prot.allows(access) {
                return false;
            }
            page_addr += PAGE_SIZE;
        }
        true
    }

    /// Switch 32-bit guests to the 4 GiB address limit; one-way
    pub fn set_large_address_space(&self) {
        if !self.large_address_aware.swap(true, Ordering::AcqRel) {
            info!("Large address space enabled");
        }
    }

    #[inline]
    pub fn is_large_address_aware(&self) -> bool {
        self.large_address_aware.load(Ordering::Acquire)
    }

    /// Highest usable address for images of `machine`
    pub fn address_limit(&self, machine: Machine) -> Address {
        if machine.is_64bit() {
            USER_SPACE_LIMIT_64
        } else if self.is_large_address_aware() {
            LIMIT_4GB
        } else {
            LIMIT_2GB
        }
    }

    /// Resolve a guest fault at `addr`
    ///
    /// Runs on the signal path: the view lock is only tried, never waited on.
    pub fn handle_fault(&self, addr: Address, access: AccessKind) -> FaultResolution {
        let Some(mut views) = self.views.try_lock() else {
            return FaultResolution::Unhandled(NtStatus::ACCESS_VIOLATION);
        };
        let page_addr = round_down(addr);
        let Some(view) = Self::view_containing_mut(&mut views, page_addr) else {
            return FaultResolution::Unhandled(NtStatus::ACCESS_VIOLATION);
        };
        let index = view.page_index(page_addr);
        let page = view.pages[index];

        if page.committed && page.prot.guard {
            let cleared = ProtFlags {
                guard: false,
                ..page.prot
            };
            if self.mapper.protect(page_addr, PAGE_SIZE, cleared).is_err() {
                return FaultResolution::Unhandled(NtStatus::ACCESS_VIOLATION);
            }
            view.pages[index].prot = cleared;

            if view.kind != ViewKind::ThreadStack {
                return FaultResolution::Unhandled(NtStatus::GUARD_PAGE_VIOLATION);
            }
            // Page 0 of a stack is never committed; reaching page 1 means no room left
            if index <= 1 {
                return FaultResolution::Unhandled(NtStatus::STACK_OVERFLOW);
            }
            let below = page_addr - PAGE_SIZE;
            let guard = ProtFlags {
                guard: true,
                ..cleared
            };
            if self.mapper.protect(below, PAGE_SIZE, guard).is_err() {
                return FaultResolution::Unhandled(NtStatus::STACK_OVERFLOW);
            }
            view.pages[index - 1] = PageState {
                prot: guard,
                committed: true,
            };
            return FaultResolution::Handled;
        }

        if page.committed && page.prot.allows(access) {
            // Protection already changed by another thread
            return FaultResolution::Handled;
        }
        FaultResolution::Unhandled(NtStatus::ACCESS_VIOLATION)
    }

    pub fn stats(&self) -> MemoryStats {
        let views = self.views.lock();
        let mut stats = MemoryStats {
            views: views.len(),
            large_address_aware: self.is_large_address_aware(),
            ..Default::default()
        };
        for view in views.values() {
            stats.reserved_bytes += view.region.size;
            stats.committed_bytes +=
                view.pages.iter().filter(|p| p.committed).count() * PAGE_SIZE;
        }
        stats
    }

    pub(crate) fn find_overlap(&self, region: Region) -> Option<Region> {
        let views = self.views.lock();
        views
            .range(..region.end())
            .next_back()
            .map(|(_, v)| v.region)
            .filter(|r| r.overlaps(&region))
    }

    fn view_containing(views: &BTreeMap<Address, View>, addr: Address) -> Option<&View> {
        views
            .range(..=addr)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.region.contains(addr))
    }

    fn view_containing_mut(
        views: &mut BTreeMap<Address, View>,
        addr: Address,
    ) -> Option<&mut View> {
        views
            .range_mut(..=addr)
            .next_back()
            .map(|(_, v)| v)
            .filter(|v| v.region.contains(addr))
    }

    fn view_covering(
        views: &mut BTreeMap<Address, View>,
        start: Address,
        end: Address,
    ) -> MemoryResult<&mut View> {
        let view = Self::view_containing_mut(views, start).ok_or(MemoryError::InvalidAddress(start))?;
        if end > view.region.end() {
            warn!(
                start = format_args!("{:#x}", start),
                end = format_args!("{:#x}", end),
                "Range crosses view boundary"
            );
            return Err(MemoryError::InvalidAddress(end));
        }
        Ok(view)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let views = std::mem::take(self.views.get_mut());
        for view in views.values() {
            if view.kind != ViewKind::Builtin {
                let _ = self.mapper.unmap(view.region.base, view.region.size);
            }
        }
    }
}
