use core::{fmt, slice};

use dataview::{Pod, PodMethods as _};

use super::{
    PAGE_SIZE, PageRound as _, PhysAddr, PhysPageNum, VirtAddr,
    addr::AddressChunks,
    fault::{Access, ProcessMemory},
    page,
    page_table::{PageTable, PtEntryFlags},
};
use crate::error::KernelError;

/// A user address space: the root page table plus the size of the
/// contiguous image starting at address zero.
///
/// The address space owns every page-table page reachable from its root
/// and every user-accessible frame it maps. Pages the process layer maps
/// here itself (trampoline, trapframe, memory-area pages above `size`)
/// stay owned by the process layer and must be unmapped before drop.
pub struct UserPageTable {
    pt: page::PageBox<PageTable>,
    size: usize,
}

impl UserPageTable {
    /// Creates an empty user page table.
    ///
    /// Running out of frames while creating an address space is a broken
    /// precondition, not a recoverable condition; it panics.
    pub fn new() -> Self {
        Self {
            pt: PageTable::try_allocate().expect("out of memory"),
            size: 0,
        }
    }

    pub fn phys_page_num(&self) -> PhysPageNum {
        self.pt.phys_page_num()
    }

    /// Returns process size.
    pub fn size(&self) -> usize {
        self.size
    }

    pub(super) fn table(&self) -> &PageTable {
        &self.pt
    }

    pub(super) fn table_mut(&mut self) -> &mut PageTable {
        &mut self.pt
    }

    /// Loads the user initcode into address 0 of pagetable.
    ///
    /// For the very first process.
    /// `src.len()` must be less than a page.
    pub fn map_first(&mut self, src: &[u8]) -> Result<(), KernelError> {
        assert!(src.len() < PAGE_SIZE, "src.len()={:#x}", src.len());

        let mem = page::alloc_zeroed_page().unwrap();
        self.pt.map_page(
            VirtAddr::MIN,
            PhysAddr::new(mem.addr().get()),
            PtEntryFlags::URWX,
        )?;
        unsafe { slice::from_raw_parts_mut(mem.as_ptr(), src.len()) }.copy_from_slice(src);
        self.size += PAGE_SIZE;

        Ok(())
    }

    /// Allocates PTEs and physical memory to grow process to `new_size`,
    /// which need not be page aligned.
    ///
    /// On failure mid-way every page this call installed is freed again
    /// and the size is back to what it was.
    pub fn grow_to(&mut self, new_size: usize, xperm: PtEntryFlags) -> Result<(), KernelError> {
        if new_size < self.size {
            return Ok(());
        }

        let old_size = self.size;
        let map_start = VirtAddr::new(self.size.page_roundup()).unwrap();
        let map_end = VirtAddr::new(new_size)?;
        for chunk in AddressChunks::from_range(map_start..map_end) {
            let va0 = chunk.page_range().start;
            self.size = va0.addr();

            let mem = match page::alloc_zeroed_page() {
                Ok(mem) => mem,
                Err(e) => {
                    self.shrink_to(old_size);
                    return Err(e);
                }
            };

            if let Err(e) = self.pt.map_page(
                va0,
                PhysAddr::new(mem.addr().get()),
                xperm | PtEntryFlags::UR,
            ) {
                unsafe {
                    page::free_page(mem);
                }
                self.shrink_to(old_size);
                return Err(e);
            }
        }

        self.size = new_size;

        Ok(())
    }

    /// Deallocates user pages to bring the process size to `new_size`.
    ///
    /// `new_size` need not be page-aligned.
    /// `new_size` need not to be less than current size.
    pub fn shrink_to(&mut self, new_size: usize) {
        if new_size >= self.size {
            return;
        }

        if new_size.page_roundup() < self.size.page_roundup() {
            let npages = (self.size.page_roundup() - new_size.page_roundup()) / PAGE_SIZE;
            let start_va = VirtAddr::new(new_size.page_roundup()).unwrap();
            for pa in self.pt.unmap_pages(start_va, npages).unwrap() {
                unsafe {
                    page::free_page(pa.as_mut_ptr());
                }
            }
        }

        self.size = new_size;
    }

    /// Duplicates the first `size` bytes of this address space into
    /// `target`, frame by frame.
    ///
    /// Pages a demand-paged parent never materialized are skipped; the
    /// child faults them in on its own first access. On failure `target`
    /// is emptied again.
    pub fn try_clone_into(&self, target: &mut Self) -> Result<(), KernelError> {
        target.shrink_to(0);

        (|| {
            for chunk in AddressChunks::from_size(VirtAddr::MIN, self.size).unwrap() {
                let va = chunk.page_range().start;
                target.size = va.addr();
                let Ok(pte) = self.pt.find_leaf_entry(va) else {
                    continue;
                };
                assert!(pte.is_valid() && pte.is_leaf());

                let src_pa = pte.phys_addr();
                let flags = pte.flags();

                let dst = page::alloc_page()?;
                unsafe {
                    dst.as_ptr().copy_from(src_pa.as_ptr(), PAGE_SIZE);
                }

                if let Err(e) =
                    target
                        .pt
                        .map_page(va, PhysAddr::new(dst.addr().get()), flags)
                {
                    unsafe {
                        page::free_page(dst);
                    }
                    return Err(e);
                }
            }
            target.size = self.size;
            Ok(())
        })()
        .inspect_err(|_| {
            target.shrink_to(0);
        })
    }

    /// Marks a PTE invalid for user access.
    ///
    /// Used by exec for the user stackguard page. The page must be
    /// mapped; clearing an absent PTE is a bug and panics.
    pub fn forbid_user_access(&mut self, va: VirtAddr) {
        self.pt
            .update_level0_entry(va, false, |pte| {
                assert!(pte.is_leaf(), "no leaf mapping at va={va:#x}");
                let mut flags = pte.flags();
                flags.remove(PtEntryFlags::U);
                pte.set_flags(flags);
            })
            .expect("no leaf mapping");
    }

    /// Installs mappings for the process layer, e.g. the trampoline and
    /// trapframe pages. The frames stay owned by the caller.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        self.pt.map_pages(va, size, pa, perm)
    }

    /// Unmaps `npages` pages starting at `va`, skipping holes.
    ///
    /// With `free_frames` the unmapped frames go back to the frame
    /// allocator; otherwise they stay with their owner.
    pub fn unmap_pages(
        &mut self,
        va: VirtAddr,
        npages: usize,
        free_frames: bool,
    ) -> Result<(), KernelError> {
        let unmapped = self.pt.unmap_pages(va, npages)?;
        if free_frames {
            for pa in unmapped {
                unsafe {
                    page::free_page(pa.as_mut_ptr());
                }
            }
        }
        Ok(())
    }

    /// Looks up a virtual address, returns the physical address.
    ///
    /// The leaf PTE must carry every flag in `flags`; user translations
    /// pass a `U`-bearing set.
    pub fn resolve_virtual_address(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<PhysAddr, KernelError> {
        self.pt.resolve_virtual_address(va, flags)
    }

    /// Fetches the page that is mapped at virtual address `va`.
    pub fn fetch_page(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&[u8; PAGE_SIZE], KernelError> {
        self.pt.fetch_page(va, flags)
    }

    /// Fetches the page that is mapped at virtual address `va`.
    pub fn fetch_page_mut(
        &mut self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&mut [u8; PAGE_SIZE], KernelError> {
        self.pt.fetch_page_mut(va, flags)
    }

    /// Writes a three-level dump of this address space's page table.
    pub fn dump(&self, w: &mut dyn fmt::Write, pid: usize, name: &str) -> fmt::Result {
        self.pt.dump(w, pid, name)
    }

    /// Copies from kernel to user.
    ///
    /// Copies `src` to virtual address `dst_va`. The whole range is
    /// faulted in first, so the destination may be demand-paged and not
    /// yet materialized; it must be covered by the process's memory areas.
    pub fn copy_out<P>(
        &mut self,
        proc: &P,
        dst_va: VirtAddr,
        mut src: &[u8],
    ) -> Result<(), KernelError>
    where
        P: ProcessMemory,
    {
        self.resolve_fault_range(proc, dst_va, src.len(), Access::Write)?;

        for chunk in AddressChunks::from_size(dst_va, src.len())? {
            let va0 = chunk.page_range().start;
            let offset = chunk.offset_in_page().start;
            let n = chunk.size();

            let dst_page = self.pt.fetch_page_mut(va0, PtEntryFlags::UW)?;
            dst_page[offset..][..n].copy_from_slice(&src[..n]);
            src = &src[n..];
        }

        Ok(())
    }

    /// Copies from user to kernel.
    ///
    /// Fills `dst` from virtual address `src_va`, faulting the source
    /// range in first.
    pub fn copy_in<P>(
        &mut self,
        proc: &P,
        mut dst: &mut [u8],
        src_va: VirtAddr,
    ) -> Result<(), KernelError>
    where
        P: ProcessMemory,
    {
        self.resolve_fault_range(proc, src_va, dst.len(), Access::Read)?;

        for chunk in AddressChunks::from_size(src_va, dst.len())? {
            let va0 = chunk.page_range().start;
            let offset = chunk.offset_in_page().start;
            let n = chunk.size();

            let src_page = self.pt.fetch_page(va0, PtEntryFlags::UR)?;
            dst[..n].copy_from_slice(&src_page[offset..][..n]);
            dst = &mut dst[n..];
        }

        Ok(())
    }

    /// Copies a NUL-terminated string from user to kernel.
    ///
    /// Copies bytes into `dst` from virtual address `src_va` until a NUL
    /// is found; the NUL is copied too and the total length returned.
    /// Pages are faulted in one by one as the scan advances, since the
    /// string length is not known up front. A string that does not
    /// terminate within `dst.len()` bytes fails.
    pub fn copy_in_str<P>(
        &mut self,
        proc: &P,
        dst: &mut [u8],
        src_va: VirtAddr,
    ) -> Result<usize, KernelError>
    where
        P: ProcessMemory,
    {
        let max = dst.len();
        let mut copied = 0;
        let mut src_va = src_va;
        while copied < max {
            let va0 = src_va.page_rounddown();
            self.resolve_fault(proc, va0, Access::Read)?;

            let offset = src_va.addr() - va0.addr();
            let n = usize::min(PAGE_SIZE - offset, max - copied);
            let src_page = self.pt.fetch_page(va0, PtEntryFlags::UR)?;
            let bytes = &src_page[offset..][..n];

            match memchr::memchr(b'\0', bytes) {
                Some(i) => {
                    dst[copied..][..=i].copy_from_slice(&bytes[..=i]);
                    return Ok(copied + i + 1);
                }
                None => {
                    dst[copied..][..n].copy_from_slice(bytes);
                    copied += n;
                }
            }

            src_va = va0.byte_add(PAGE_SIZE)?;
        }
        Err(KernelError::UserStringTooLong(max))
    }

    /// Copies a value from kernel to user.
    pub fn copy_out_value<P, T>(
        &mut self,
        proc: &P,
        dst_va: VirtAddr,
        value: &T,
    ) -> Result<(), KernelError>
    where
        P: ProcessMemory,
        T: Pod,
    {
        self.copy_out(proc, dst_va, value.as_bytes())
    }

    /// Copies a value from user to kernel.
    pub fn copy_in_value<P, T>(&mut self, proc: &P, src_va: VirtAddr) -> Result<T, KernelError>
    where
        P: ProcessMemory,
        T: Pod,
    {
        let mut value = T::zeroed();
        self.copy_in(proc, value.as_bytes_mut(), src_va)?;
        Ok(value)
    }
}

impl Drop for UserPageTable {
    fn drop(&mut self) {
        self.shrink_to(0);
        self.pt.free_descendant();
    }
}

#[cfg(test)]
mod tests {
    use super::{super::testing, *};
    use crate::memory::fault::MapPerm;

    #[test]
    fn test_map_first() {
        let _frames = testing::lock_frames();

        let code = [0x13_u8, 0x05, 0x00, 0x00, 0x73];
        let mut upt = UserPageTable::new();
        upt.map_first(&code).unwrap();
        assert_eq!(upt.size(), PAGE_SIZE);

        let page = upt.fetch_page(VirtAddr::MIN, PtEntryFlags::URWX).unwrap();
        assert_eq!(&page[..code.len()], &code);
        assert!(page[code.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_grow_and_shrink() {
        let _frames = testing::lock_frames();

        let mut upt = UserPageTable::new();
        upt.grow_to(3 * PAGE_SIZE, PtEntryFlags::WX).unwrap();
        assert_eq!(upt.size(), 3 * PAGE_SIZE);

        let mut frames = vec![];
        for i in 0..3 {
            let va = VirtAddr::new(i * PAGE_SIZE).unwrap();
            let pte = upt.table().find_leaf_entry(va).unwrap();
            assert_eq!(pte.flags(), PtEntryFlags::URWX | PtEntryFlags::V);
            frames.push(pte.phys_addr());
        }
        frames.sort();
        frames.dedup();
        assert_eq!(frames.len(), 3, "frames are distinct");

        upt.shrink_to(PAGE_SIZE + 1);
        assert_eq!(upt.size(), PAGE_SIZE + 1);
        assert!(upt.table().find_leaf_entry(VirtAddr::MIN).is_ok());
        assert!(
            upt.table()
                .find_leaf_entry(VirtAddr::new(PAGE_SIZE).unwrap())
                .is_ok(),
            "the partially used page stays"
        );
        assert!(
            upt.table()
                .find_leaf_entry(VirtAddr::new(2 * PAGE_SIZE).unwrap())
                .is_err()
        );

        // shrinking past zero and growing backwards are no-ops
        upt.shrink_to(0);
        assert_eq!(upt.size(), 0);
        upt.grow_to(0, PtEntryFlags::W).unwrap();
        assert_eq!(upt.size(), 0);
    }

    #[test]
    fn test_clone_copies_and_isolates() {
        let _frames = testing::lock_frames();

        let mut parent = UserPageTable::new();
        parent.grow_to(2 * PAGE_SIZE, PtEntryFlags::W).unwrap();
        parent
            .fetch_page_mut(VirtAddr::MIN, PtEntryFlags::UW)
            .unwrap()[0] = 0x5a;

        let mut child = UserPageTable::new();
        parent.try_clone_into(&mut child).unwrap();
        assert_eq!(child.size(), parent.size());

        let child_page = child.fetch_page(VirtAddr::MIN, PtEntryFlags::UR).unwrap();
        assert_eq!(child_page[0], 0x5a);

        // a write through the parent is invisible in the child
        parent
            .fetch_page_mut(VirtAddr::MIN, PtEntryFlags::UW)
            .unwrap()[0] = 0xab;
        let child_page = child.fetch_page(VirtAddr::MIN, PtEntryFlags::UR).unwrap();
        assert_eq!(child_page[0], 0x5a);
    }

    #[test]
    fn test_clone_skips_holes() {
        let _frames = testing::lock_frames();

        let mut parent = UserPageTable::new();
        parent.grow_to(3 * PAGE_SIZE, PtEntryFlags::W).unwrap();
        let hole = VirtAddr::new(PAGE_SIZE).unwrap();
        parent.unmap_pages(hole, 1, true).unwrap();

        let mut child = UserPageTable::new();
        parent.try_clone_into(&mut child).unwrap();

        assert!(child.table().find_leaf_entry(VirtAddr::MIN).is_ok());
        assert!(child.table().find_leaf_entry(hole).is_err());
        assert!(
            child
                .table()
                .find_leaf_entry(VirtAddr::new(2 * PAGE_SIZE).unwrap())
                .is_ok()
        );
    }

    #[test]
    fn test_forbid_user_access() {
        let _frames = testing::lock_frames();

        let mut upt = UserPageTable::new();
        upt.grow_to(2 * PAGE_SIZE, PtEntryFlags::W).unwrap();

        let guard_va = VirtAddr::MIN;
        upt.forbid_user_access(guard_va);

        // still mapped, but no longer reachable from user mode
        assert!(
            upt.resolve_virtual_address(guard_va, PtEntryFlags::empty())
                .is_ok()
        );
        assert!(matches!(
            upt.resolve_virtual_address(guard_va, PtEntryFlags::U),
            Err(KernelError::InaccessiblePage(_))
        ));
    }

    #[test]
    #[should_panic(expected = "no leaf mapping")]
    fn test_forbid_user_access_requires_mapping() {
        let _frames = testing::lock_frames();

        let mut upt = UserPageTable::new();
        upt.grow_to(PAGE_SIZE, PtEntryFlags::W).unwrap();

        let absent = VirtAddr::new(0x40_0000).unwrap();
        upt.forbid_user_access(absent);
    }

    #[test]
    fn test_address_space_is_leak_free() {
        let _frames = testing::lock_frames();

        let before = page::free_page_count();
        {
            let mut upt = UserPageTable::new();
            upt.grow_to(17 * PAGE_SIZE, PtEntryFlags::W).unwrap();
            upt.shrink_to(5 * PAGE_SIZE);
            upt.grow_to(9 * PAGE_SIZE, PtEntryFlags::WX).unwrap();

            let mut child = UserPageTable::new();
            upt.try_clone_into(&mut child).unwrap();
        }
        assert_eq!(page::free_page_count(), before);
    }

    #[test]
    fn test_copy_out_and_in_across_pages() {
        let _frames = testing::lock_frames();

        let proc = testing::StubProc::new(vec![testing::anon_area(
            0x20000..0x22000,
            MapPerm::R | MapPerm::W,
        )]);
        let mut upt = UserPageTable::new();

        // the write straddles the boundary between the two pages
        let dst = VirtAddr::new(0x20ffc).unwrap();
        upt.copy_out(&proc, dst, b"ABCD\0").unwrap();

        assert!(
            upt.resolve_virtual_address(dst, PtEntryFlags::U).is_ok(),
            "first page demand-paged on the way in"
        );
        assert!(
            upt.resolve_virtual_address(VirtAddr::new(0x21000).unwrap(), PtEntryFlags::U)
                .is_ok(),
            "second page demand-paged on the way in"
        );

        let mut buf = [0_u8; 5];
        upt.copy_in(&proc, &mut buf, dst).unwrap();
        assert_eq!(&buf, b"ABCD\0");

        upt.unmap_pages(VirtAddr::new(0x20000).unwrap(), 2, true)
            .unwrap();
    }

    #[test]
    fn test_copy_fails_outside_areas() {
        let _frames = testing::lock_frames();

        let proc = testing::StubProc::new(vec![]);
        let mut upt = UserPageTable::new();

        let dst = VirtAddr::new(0x8000).unwrap();
        assert!(matches!(
            upt.copy_out(&proc, dst, b"x"),
            Err(KernelError::Fault(_))
        ));
    }

    #[test]
    fn test_copy_in_str_stops_at_nul() {
        let _frames = testing::lock_frames();

        let proc = testing::StubProc::new(vec![testing::anon_area(
            0x30000..0x32000,
            MapPerm::R | MapPerm::W,
        )]);
        let mut upt = UserPageTable::new();

        // place the string so that it crosses into the second page
        let src = VirtAddr::new(0x30ff8).unwrap();
        upt.copy_out(&proc, src, b"hello, world\0").unwrap();

        let mut buf = [0xff_u8; 32];
        let n = upt.copy_in_str(&proc, &mut buf, src).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf[..n], b"hello, world\0");
        assert_eq!(buf[n], 0xff, "bytes after the NUL are untouched");

        upt.unmap_pages(VirtAddr::new(0x30000).unwrap(), 2, true)
            .unwrap();
    }

    #[test]
    fn test_copy_in_str_without_nul_fails() {
        let _frames = testing::lock_frames();

        let proc = testing::StubProc::new(vec![testing::anon_area(
            0x30000..0x31000,
            MapPerm::R | MapPerm::W,
        )]);
        let mut upt = UserPageTable::new();

        let src = VirtAddr::new(0x30000).unwrap();
        upt.copy_out(&proc, src, b"abcdefgh").unwrap();

        let mut buf = [0_u8; 4];
        assert!(matches!(
            upt.copy_in_str(&proc, &mut buf, src),
            Err(KernelError::UserStringTooLong(4))
        ));

        upt.unmap_pages(src, 1, true).unwrap();
    }

    #[test]
    fn test_typed_copies_round_trip() {
        let _frames = testing::lock_frames();

        let proc = testing::StubProc::new(vec![testing::anon_area(
            0x40000..0x41000,
            MapPerm::R | MapPerm::W,
        )]);
        let mut upt = UserPageTable::new();

        let va = VirtAddr::new(0x40010).unwrap();
        upt.copy_out_value(&proc, va, &0x1122_3344_5566_7788_u64)
            .unwrap();
        let value: u64 = upt.copy_in_value(&proc, va).unwrap();
        assert_eq!(value, 0x1122_3344_5566_7788);

        upt.unmap_pages(VirtAddr::new(0x40000).unwrap(), 1, true)
            .unwrap();
    }
}
