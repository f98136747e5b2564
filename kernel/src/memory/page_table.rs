use core::fmt;

use bitflags::bitflags;
use dataview::Pod;

use super::{
    PAGE_SHIFT, PAGE_SIZE, PageRound as _, PhysAddr, PhysPageNum, VirtAddr, addr::AddressChunks,
    page::PageBox,
};
use crate::error::KernelError;

#[repr(transparent)]
#[derive(Pod)]
pub struct PageTable([PtEntry; 512]);

impl PageTable {
    /// Allocates a new empty page table.
    pub(super) fn try_allocate() -> Result<PageBox<Self>, KernelError> {
        // SAFETY: a page table is plain old data; the zeroed page is the
        // empty table.
        let pt = unsafe { PageBox::try_new_zeroed() };
        pt.ok_or(KernelError::NoFreePage)
    }

    /// Returns the page table index that corresponds to virtual address `va`
    ///
    /// The RISC-V Sv39 schema has three levels of page-table
    /// pages. A page-table page contains 512 64-bit PTEs.
    /// A 64-bit virtual address is split into five fields:
    /// ```text
    ///     39..=63 -- must be zero.
    ///     30..=38 -- 9 bits of level-2 index.
    ///     21..=29 -- 9 bits of level-1 index.
    ///     12..=20 -- 9 bits of level-0 index.
    ///      0..=11 -- 12 bits byte offset with the page.
    /// ```
    fn entry_index(level: usize, va: VirtAddr) -> usize {
        assert!(level <= 2);
        let shift = PAGE_SHIFT + (9 * level);
        (va.addr() >> shift) & 0x1ff
    }

    /// Returns the physical address containing this page table
    pub(super) fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(core::ptr::from_ref(self).addr())
    }

    /// Returns the physical page number of the physical page containing this
    /// page table
    pub(super) fn phys_page_num(&self) -> PhysPageNum {
        self.phys_addr().phys_page_num()
    }

    /// Creates a PTE for virtual address `va` that refers to
    /// physical address `pa`.
    ///
    /// `va` MUST be page-aligned.
    ///
    /// Returns `Ok(())` on success, `Err()` if a needed page-table page
    /// could not be allocated.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        assert!(perm.intersects(PtEntryFlags::RWX), "perm={perm:?}");

        self.update_level0_entry(va, true, |pte| {
            assert!(
                !pte.is_valid(),
                "remap on the already mapped address: va={va:#x}"
            );
            pte.set_phys_addr(pa, perm | PtEntryFlags::V);
        })
    }

    /// Creates PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`.
    ///
    /// `va` and `size` need not be page-aligned; the mapped range covers
    /// every page the byte range `[va, va + size)` touches.
    ///
    /// Returns `Ok(())` on success, `Err()` if a needed page-table page
    /// could not be allocated.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert_ne!(size, 0, "size={size:#x}");

        let last = va.byte_add(size - 1)?.page_rounddown();
        let mut va = va.page_rounddown();
        let mut pa = pa;
        loop {
            self.map_page(va, pa, perm)?;
            if va == last {
                return Ok(());
            }

            va = va.byte_add(PAGE_SIZE).unwrap();
            pa = pa.byte_add(PAGE_SIZE);
        }
    }

    /// Unmaps the page of memory at virtual address `va`.
    ///
    /// Absent and invalid entries are skipped: a demand-paged address
    /// space may never have materialized the page. An interior entry at
    /// the leaf level means the caller passed bad bounds and panics.
    ///
    /// Returns the physical address of the page that was unmapped, if any.
    pub(super) fn unmap_page(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        assert!(va.is_page_aligned(), "va={va:#x}");

        self.update_level0_entry(va, false, |pte| {
            if !pte.is_valid() {
                return None;
            }
            assert!(pte.is_leaf(), "unmap a non-leaf entry: {:?}", pte.flags());
            let pa = pte.phys_addr();
            pte.clear();
            Some(pa)
        })
        .ok()
        .flatten()
    }

    /// Unmaps the pages of memory starting at virtual address `va` and
    /// covering `npages` pages.
    ///
    /// The returned iterator yields the physical frames that were actually
    /// mapped; the caller owns them afterwards and decides whether they
    /// are freed. Dropping the iterator still unmaps the whole range.
    pub(super) fn unmap_pages(
        &mut self,
        va: VirtAddr,
        npages: usize,
    ) -> Result<UnmapPages<'_>, KernelError> {
        Ok(UnmapPages {
            pt: self,
            chunks: AddressChunks::from_size(va, npages * PAGE_SIZE)?,
        })
    }

    /// Returns the leaf PTE in the page tables that corresponds to virtual
    /// address `va`.
    pub(super) fn find_leaf_entry(&self, va: VirtAddr) -> Result<&PtEntry, KernelError> {
        if va >= VirtAddr::MAX {
            return Err(KernelError::VirtualPageNotMapped(va));
        }

        let mut pt = self;
        for level in (1..=2).rev() {
            let index = Self::entry_index(level, va);
            pt = pt.0[index]
                .get_page_table()
                .ok_or(KernelError::VirtualPageNotMapped(va))?;
        }

        let index = Self::entry_index(0, va);
        let pte = &pt.0[index];
        if !pte.is_leaf() {
            return Err(KernelError::VirtualPageNotMapped(va));
        }
        Ok(pte)
    }

    /// Updates the level-0 PTE in the page tables that corresponds to
    /// virtual address `va`.
    ///
    /// If `insert_new_table` is `true`, it will allocate new page-table
    /// pages as needed; pages installed before a later allocation failure
    /// stay in place, owned by this table.
    ///
    /// Updated PTE must be leaf PTE or invalid.
    pub(super) fn update_level0_entry<T, F>(
        &mut self,
        va: VirtAddr,
        insert_new_table: bool,
        f: F,
    ) -> Result<T, KernelError>
    where
        F: for<'a> FnOnce(&'a mut PtEntry) -> T,
    {
        assert!(va < VirtAddr::MAX);

        let mut pt = self;
        for level in (1..=2).rev() {
            let index = Self::entry_index(level, va);
            if !pt.0[index].is_valid() {
                if !insert_new_table {
                    return Err(KernelError::VirtualPageNotMapped(va));
                }
                let new_pt = Self::try_allocate()?;
                pt.0[index].set_page_table(new_pt);
            }
            pt = pt.0[index].get_page_table_mut().unwrap();
        }

        let index = Self::entry_index(0, va);
        let pte = &mut pt.0[index];
        let res = f(pte);
        // cannot change PTE to non-leaf (level0 PTE must be invalid or leaf)
        assert!(!pte.is_non_leaf());
        Ok(res)
    }

    /// Looks up a virtual address, returns the physical address.
    ///
    /// The leaf PTE must carry every flag in `flags`.
    pub fn resolve_virtual_address(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<PhysAddr, KernelError> {
        let pte = self.find_leaf_entry(va)?;
        assert!(pte.is_valid() && pte.is_leaf());
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessiblePage(va));
        }

        Ok(pte.phys_addr().byte_add(va.addr() % PAGE_SIZE))
    }

    /// Fetches the page that is mapped at virtual address `va`.
    pub(super) fn fetch_page(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&[u8; PAGE_SIZE], KernelError> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        let pa = self.resolve_virtual_address(va, flags)?;
        let page = unsafe { pa.as_mut_ptr::<[u8; PAGE_SIZE]>().as_ref() };
        Ok(page)
    }

    /// Fetches the page that is mapped at virtual address `va`.
    pub(super) fn fetch_page_mut(
        &mut self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&mut [u8; PAGE_SIZE], KernelError> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        let pa = self.resolve_virtual_address(va, flags)?;
        let page = unsafe { pa.as_mut_ptr::<[u8; PAGE_SIZE]>().as_mut() };
        Ok(page)
    }

    /// Recursively frees page-table pages.
    ///
    /// All leaf mappings must already have been removed.
    pub(super) fn free_descendant(&mut self) {
        for pte in &mut self.0 {
            assert!(
                !pte.is_valid() || pte.is_non_leaf(),
                "leaf mapping still present: {:?}",
                pte.flags()
            );
            if let Some(mut pt) = pte.take_page_table() {
                pt.free_descendant();
                pte.clear();
            }
        }
    }

    /// Recursively frees the page-table pages reachable from this table,
    /// leaving mapped frames alone.
    ///
    /// For tables whose leaf frames are borrowed and must survive, such
    /// as the kernel's direct map of devices and RAM.
    pub(super) fn free_tables(&mut self) {
        for pte in &mut self.0 {
            if let Some(mut pt) = pte.take_page_table() {
                pt.free_tables();
            }
            pte.clear();
        }
    }

    /// Writes a three-level dump of the page table to `w`.
    ///
    /// Every valid entry is printed with its index, raw bits and physical
    /// address; leaves additionally carry their flag letters and the
    /// inclusive virtual address range they cover.
    pub fn dump(&self, w: &mut dyn fmt::Write, pid: usize, name: &str) -> fmt::Result {
        writeln!(
            w,
            "page table {:#x} pid={pid} cmd={name}",
            self.phys_addr().addr()
        )?;
        self.dump_level(w, 2, 0)
    }

    fn dump_level(&self, w: &mut dyn fmt::Write, level: usize, va_base: usize) -> fmt::Result {
        for (i, pte) in self.0.iter().enumerate() {
            if !pte.is_valid() {
                continue;
            }

            let va = va_base + (i << (PAGE_SHIFT + 9 * level));
            for _ in level..2 {
                write!(w, ".. ")?;
            }
            if let Some(pt) = pte.get_page_table() {
                writeln!(w, "..{i}: pte {:#x} pa {:#x}", pte.bits(), pt.phys_addr())?;
                pt.dump_level(w, level - 1, va)?;
            } else {
                let page_size = PAGE_SIZE << (9 * level);
                writeln!(
                    w,
                    "..{i}: pte {:#x} pa {:#x} {} va {va:#x}..={:#x}",
                    pte.bits(),
                    pte.phys_addr(),
                    FlagLetters(pte.flags()),
                    va + page_size - 1,
                )?;
            }
        }
        Ok(())
    }
}

struct FlagLetters(PtEntryFlags);

impl fmt::Display for FlagLetters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut all_flags = PtEntryFlags::all();
        all_flags.remove(PtEntryFlags::V);
        for (name, flag) in all_flags.iter_names() {
            if self.0.contains(flag) {
                for ch in name.chars() {
                    write!(f, "{}", ch.to_ascii_lowercase())?;
                }
            } else {
                write!(f, "-")?;
            }
        }
        Ok(())
    }
}

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Valid Bit of page table entry.
        ///
        /// If set, an entry for this virtual address exists.
        const V = 1 << 0;

        /// Read Bit of page table entry.
        ///
        /// If set, the CPU can read to this virtual address.
        const R = 1 << 1;

        /// Write Bit of page table entry.
        ///
        /// If set, the CPU can write to this virtual address.
        const W = 1 << 2;

        /// Executable Bit of page table entry.
        ///
        /// If set, the CPU can executes the instructions on this virtual address.
        const X = 1 << 3;

        /// UserMode Bit of page table entry.
        ///
        /// If set, userspace can access this virtual address.
        const U = 1 << 4;

        /// Global Mapping Bit of page table entry.
        ///
        /// If set, this virtual address exists in all address spaces.
        const G = 1 << 5;

        /// Access Bit of page table entry.
        ///
        /// If set, this virtual address have been accesses.
        const A = 1 << 6;

        /// Dirty Bit of page table entry.
        ///
        /// If set, this virtual address have been written.
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const WX = Self::W.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

pub(super) struct UnmapPages<'a> {
    pt: &'a mut PageTable,
    chunks: AddressChunks,
}

impl Iterator for UnmapPages<'_> {
    type Item = PhysAddr;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = self.chunks.next()?;
            if let Some(pa) = self.pt.unmap_page(chunk.page_range().start) {
                return Some(pa);
            }
        }
    }
}

impl Drop for UnmapPages<'_> {
    fn drop(&mut self) {
        for _ in self {}
    }
}

#[repr(transparent)]
#[derive(Pod)]
pub(super) struct PtEntry(usize);

impl PtEntry {
    const FLAGS_MASK: usize = 0x3FF;

    fn new(ppn: PhysPageNum, flags: PtEntryFlags) -> Self {
        assert_eq!(
            flags.bits() & Self::FLAGS_MASK,
            flags.bits(),
            "flags: {flags:#x}={flags:?}"
        );
        let bits = (ppn.value() << 10) | (flags.bits() & Self::FLAGS_MASK);
        Self(bits)
    }

    fn bits(&self) -> usize {
        self.0
    }

    fn get_page_table(&self) -> Option<&PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_mut_ptr::<PageTable>().as_ref() })
    }

    fn get_page_table_mut(&mut self) -> Option<&mut PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_mut_ptr::<PageTable>().as_mut() })
    }

    fn set_page_table(&mut self, pt: PageBox<PageTable>) {
        assert!(!self.is_valid());
        let ppn = pt.phys_page_num();
        let _ = PageBox::into_raw(pt);
        *self = Self::new(ppn, PtEntryFlags::V);
    }

    fn take_page_table(&mut self) -> Option<PageBox<PageTable>> {
        self.is_non_leaf().then(|| {
            let ptr = self.phys_addr().as_mut_ptr();
            // SAFETY: a non-leaf entry owns the page-table page it points
            // to; the entry is cleared so ownership moves to the box.
            let pt = unsafe { PageBox::from_raw(ptr) };
            self.clear();
            pt
        })
    }

    /// Returns physical page number (PPN)
    pub(super) fn phys_page_num(&self) -> PhysPageNum {
        PhysPageNum::new(self.0 >> 10)
    }

    fn set_phys_page_num(&mut self, ppn: PhysPageNum, flags: PtEntryFlags) {
        assert!(!self.is_valid());
        assert!(flags.contains(PtEntryFlags::V));
        *self = Self::new(ppn, flags);
    }

    /// Returns physical address (PA)
    pub(super) fn phys_addr(&self) -> PhysAddr {
        self.phys_page_num().phys_addr()
    }

    pub(super) fn set_phys_addr(&mut self, pa: PhysAddr, flags: PtEntryFlags) {
        self.set_phys_page_num(pa.phys_page_num(), flags);
    }

    /// Returns `true` if this page is valid
    pub(super) fn is_valid(&self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    /// Returns `true` if this page is a valid leaf entry.
    pub(super) fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    /// Returns `true` if this page is a valid non-leaf entry.
    pub(super) fn is_non_leaf(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    /// Returns page table entry flags
    pub(super) fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Sets page table entry flags.
    pub(super) fn set_flags(&mut self, flags: PtEntryFlags) {
        self.0 &= !Self::FLAGS_MASK;
        self.0 |= flags.bits();
    }

    /// Clears the page table entry.
    pub(super) fn clear(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{super::testing, *};
    use crate::memory::page;

    #[test]
    fn test_entry_encoding() {
        let ppn = PhysPageNum::new(0x8_7654);
        let pte = PtEntry::new(ppn, PtEntryFlags::URW | PtEntryFlags::V);
        assert_eq!(pte.phys_page_num(), ppn);
        assert_eq!(pte.phys_addr().addr(), 0x8_7654 << PAGE_SHIFT);
        assert_eq!(pte.flags(), PtEntryFlags::URW | PtEntryFlags::V);
        assert!(pte.is_valid());
        assert!(pte.is_leaf());
        assert!(!pte.is_non_leaf());

        let interior = PtEntry::new(ppn, PtEntryFlags::V);
        assert!(interior.is_valid());
        assert!(!interior.is_leaf());
        assert!(interior.is_non_leaf());
    }

    #[test]
    fn test_map_translate_unmap() {
        let _frames = testing::lock_frames();

        let mut pt = PageTable::try_allocate().unwrap();
        let frame = page::alloc_zeroed_page().unwrap();
        let pa = PhysAddr::new(frame.addr().get());

        let va = VirtAddr::new(0x1000).unwrap();
        pt.map_pages(va, PAGE_SIZE, pa, PtEntryFlags::URW).unwrap();

        // translation keeps the byte offset within the page
        let probe = VirtAddr::new(0x1234).unwrap();
        let resolved = pt.resolve_virtual_address(probe, PtEntryFlags::U).unwrap();
        assert_eq!(resolved.addr(), pa.addr() + 0x234);

        let pte = pt.find_leaf_entry(va).unwrap();
        assert_eq!(pte.flags(), PtEntryFlags::URW | PtEntryFlags::V);

        let unmapped: Vec<_> = pt.unmap_pages(va, 1).unwrap().collect();
        assert_eq!(unmapped, vec![pa]);
        assert!(pt.resolve_virtual_address(probe, PtEntryFlags::U).is_err());

        unsafe {
            page::free_page(frame);
        }
        pt.free_descendant();
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn test_remap_panics() {
        let _frames = testing::lock_frames();

        let mut pt = PageTable::try_allocate().unwrap();
        let va = VirtAddr::new(0x4000).unwrap();
        let pa = PhysAddr::new(0x8020_0000);
        pt.map_page(va, pa, PtEntryFlags::R).unwrap();
        pt.map_page(va, pa, PtEntryFlags::R).unwrap();
    }

    #[test]
    fn test_unmap_skips_absent_pages() {
        let _frames = testing::lock_frames();

        let mut pt = PageTable::try_allocate().unwrap();
        let frame = page::alloc_zeroed_page().unwrap();
        let pa = PhysAddr::new(frame.addr().get());

        // only the middle page of the range is mapped
        let va = VirtAddr::new(0x3000).unwrap();
        pt.map_page(va, pa, PtEntryFlags::URW).unwrap();

        let start = VirtAddr::new(0x2000).unwrap();
        let unmapped: Vec<_> = pt.unmap_pages(start, 3).unwrap().collect();
        assert_eq!(unmapped, vec![pa]);

        // unmapping a range with no tables at all is a no-op
        let far = VirtAddr::new(0x4000_0000).unwrap();
        assert_eq!(pt.unmap_pages(far, 4).unwrap().count(), 0);

        unsafe {
            page::free_page(frame);
        }
        pt.free_descendant();
    }

    #[test]
    fn test_walker_failure_leaves_no_mapping() {
        let _frames = testing::lock_frames();

        let mut pt = PageTable::try_allocate().unwrap();
        let va = VirtAddr::new(0x5000).unwrap();
        assert!(matches!(
            pt.find_leaf_entry(va),
            Err(KernelError::VirtualPageNotMapped(_))
        ));
        // the highest address is never mapped, and never panics
        assert!(pt.find_leaf_entry(VirtAddr::MAX).is_err());
        pt.free_descendant();
    }

    #[test]
    fn test_page_table_pages_are_reclaimed() {
        let _frames = testing::lock_frames();

        let before = page::free_page_count();
        {
            let mut pt = PageTable::try_allocate().unwrap();
            // two widely separated mappings force separate interior tables
            let frame = page::alloc_zeroed_page().unwrap();
            let pa = PhysAddr::new(frame.addr().get());
            let low = VirtAddr::new(0x1000).unwrap();
            let high = VirtAddr::MAX.byte_sub(PAGE_SIZE).unwrap();
            pt.map_page(low, pa, PtEntryFlags::URW).unwrap();
            pt.map_page(high, pa, PtEntryFlags::RX).unwrap();

            drop(pt.unmap_pages(low, 1).unwrap());
            drop(pt.unmap_pages(high, 1).unwrap());
            pt.free_descendant();
            unsafe {
                page::free_page(frame);
            }
        }
        assert_eq!(page::free_page_count(), before);
    }

    #[test]
    #[should_panic(expected = "leaf mapping still present")]
    fn test_free_descendant_rejects_leaves() {
        let _frames = testing::lock_frames();

        let mut pt = PageTable::try_allocate().unwrap();
        let va = VirtAddr::new(0x6000).unwrap();
        pt.map_page(va, PhysAddr::new(0x8030_0000), PtEntryFlags::R)
            .unwrap();
        pt.free_descendant();
    }

    #[test]
    fn test_dump_format() {
        let _frames = testing::lock_frames();

        let mut pt = PageTable::try_allocate().unwrap();
        let pa = PhysAddr::new(0x8040_0000);
        let va = VirtAddr::new(0x1000).unwrap();
        pt.map_page(va, pa, PtEntryFlags::URW).unwrap();

        let mut out = String::new();
        pt.dump(&mut out, 7, "init").unwrap();

        let mut lines = out.lines();
        assert!(lines.next().unwrap().starts_with("page table 0x"));
        assert!(lines.next().unwrap().starts_with("..0: pte 0x"));
        assert!(lines.next().unwrap().starts_with(".. ..0: pte 0x"));
        let leaf = lines.next().unwrap();
        assert!(leaf.starts_with(".. .. ..1: pte 0x"));
        assert!(leaf.contains("pa 0x80400000"));
        assert!(leaf.contains("rw-u---"));
        assert!(leaf.contains("va 0x1000..=0x1fff"));
        assert!(out.contains("pid=7"));
        assert!(out.contains("cmd=init"));

        drop(pt.unmap_pages(va, 1).unwrap());
        pt.free_descendant();
    }
}
