//! Demand paging: resolution of user page faults against a process's
//! memory areas.
//!
//! The process layer owns the area registry and its lock; this module
//! sees both through [`ProcessMemory`]. A fault is resolved under that
//! lock, except for the read that fills a file-backed page, which may
//! sleep: the lock is dropped for the duration of the read. Dropping the
//! guard is the unlock, and lookups hand out owned snapshots, so no
//! reference into the registry can survive it.

use core::{ops::Range, slice};

use bitflags::bitflags;

use super::{
    PAGE_SIZE, PageRound as _, PhysAddr, VirtAddr, page, page_table::PtEntryFlags,
    vm_user::UserPageTable,
};
use crate::error::KernelError;

bitflags! {
    /// Permission of a memory area: the subset of R, W and X its pages
    /// are mapped with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPerm: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

impl From<MapPerm> for PtEntryFlags {
    fn from(perm: MapPerm) -> Self {
        let mut flags = Self::empty();
        if perm.contains(MapPerm::R) {
            flags |= Self::R;
        }
        if perm.contains(MapPerm::W) {
            flags |= Self::W;
        }
        if perm.contains(MapPerm::X) {
            flags |= Self::X;
        }
        flags
    }
}

/// A contiguous region of user virtual memory with uniform permissions,
/// optionally filled from a file on first touch.
///
/// Looked up from the process layer's registry; this is an owned
/// snapshot, valid regardless of what happens to the registry afterwards.
#[derive(Debug, Clone)]
pub struct VmArea<F> {
    pub range: Range<VirtAddr>,
    pub perm: MapPerm,
    pub backing: Option<FileBacking<F>>,
}

impl<F> VmArea<F> {
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.range.contains(&va)
    }
}

/// The file contents behind a file-backed area.
///
/// The first `len` bytes of the area mirror the file starting at
/// `offset`; pages past `len` stay zero.
#[derive(Debug, Clone)]
pub struct FileBacking<F> {
    pub file: F,
    pub offset: usize,
    pub len: usize,
}

/// The access that caused a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// Maps an Sv39 page-fault exception code to the access it reports.
    pub fn from_page_fault_code(code: usize) -> Option<Self> {
        match code {
            12 => Some(Self::Execute),
            13 => Some(Self::Read),
            15 => Some(Self::Write),
            _ => None,
        }
    }

    fn map_perm(self) -> MapPerm {
        match self {
            Self::Read => MapPerm::R,
            Self::Write => MapPerm::W,
            Self::Execute => MapPerm::X,
        }
    }
}

/// Why a fault could not be resolved.
///
/// The trap handler dispatches on this exhaustively; anything but a
/// resolved fault kills the faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("no area covers the faulting address")]
    NoArea,
    #[error("access denied by the covering area")]
    PermissionDenied,
    #[error("out of physical frames")]
    OutOfMemory,
    #[error("page table update failed")]
    MapFailed,
    #[error("read from the backing file failed")]
    BackingRead,
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page was already present; the fault is likely a stale TLB
    /// entry.
    AlreadyMapped,
    /// A fresh frame was installed at the faulting page.
    Mapped(PhysAddr),
}

/// Lookup into a process's area registry. Implemented by the guard that
/// holds the registry lock.
pub trait VmaLookup {
    type File;

    /// Returns the area covering `va`, as an owned snapshot.
    fn lookup(&self, va: VirtAddr) -> Option<VmArea<Self::File>>;
}

/// What the fault resolver needs from the process layer: the locked area
/// registry and reads from backing files.
pub trait ProcessMemory {
    type File: Clone;
    type AreasGuard<'a>: VmaLookup<File = Self::File>
    where
        Self: 'a;

    /// Locks the area registry; the guard holds the lock until dropped.
    fn lock_areas(&self) -> Self::AreasGuard<'_>;

    /// Reads `dst.len()` bytes from `file` at byte `offset` into `dst`.
    ///
    /// May sleep; callers must not hold the area lock.
    fn read_file(
        &self,
        file: &Self::File,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), KernelError>;
}

impl UserPageTable {
    /// Resolves a page fault at `va` caused by `access`.
    ///
    /// A fault on an already mapped, user-accessible page whose area
    /// permits the access is spurious and succeeds without touching
    /// anything. Otherwise the covering area authorizes the access, a
    /// zeroed frame is installed with the area's permissions, and a
    /// file-backed area fills the frame from its file.
    pub fn resolve_fault<P>(
        &mut self,
        proc: &P,
        va: VirtAddr,
        access: Access,
    ) -> Result<FaultResolution, FaultError>
    where
        P: ProcessMemory,
    {
        let va0 = va.page_rounddown();
        let areas = proc.lock_areas();
        let area = areas.lookup(va);

        if let Ok(pte) = self.table().find_leaf_entry(va0) {
            // Already mapped; check that the access was legitimate.
            let flags = pte.flags();
            let Some(area) = area else {
                return Err(FaultError::NoArea);
            };
            if !area.perm.is_empty() && !area.perm.contains(access.map_perm()) {
                return Err(FaultError::PermissionDenied);
            }
            if !flags.contains(PtEntryFlags::U) {
                return Err(FaultError::PermissionDenied);
            }
            return Ok(FaultResolution::AlreadyMapped);
        }

        let Some(area) = area else {
            return Err(FaultError::NoArea);
        };
        if !area.perm.contains(access.map_perm()) {
            return Err(FaultError::PermissionDenied);
        }

        let frame = page::alloc_zeroed_page().map_err(|_| FaultError::OutOfMemory)?;
        let pa = PhysAddr::new(frame.addr().get());
        let perm = PtEntryFlags::U | PtEntryFlags::from(area.perm);
        if self.table_mut().map_page(va0, pa, perm).is_err() {
            unsafe {
                page::free_page(frame);
            }
            return Err(FaultError::MapFailed);
        }

        if let Some(backing) = &area.backing {
            debug_assert!(area.range.start.is_page_aligned());
            let area_offset = va0.addr() - area.range.start.addr();
            if area_offset < backing.len {
                let n = usize::min(PAGE_SIZE, backing.len - area_offset);
                let file = backing.file.clone();
                let file_offset = backing.offset + area_offset;

                // The read may sleep; it must not run under the area lock.
                drop(areas);

                let dst = unsafe { slice::from_raw_parts_mut(frame.as_ptr(), n) };
                if proc.read_file(&file, file_offset, dst).is_err() {
                    if let Some(pa) = self.table_mut().unmap_page(va0) {
                        unsafe {
                            page::free_page(pa.as_mut_ptr());
                        }
                    }
                    return Err(FaultError::BackingRead);
                }
            }
        }

        Ok(FaultResolution::Mapped(pa))
    }

    /// Resolves faults for every page the byte range `[va, va + len)`
    /// touches, stopping at the first failure.
    ///
    /// The area lock is taken and released once per page, so concurrent
    /// registry updates are observed between pages, never within one.
    pub fn resolve_fault_range<P>(
        &mut self,
        proc: &P,
        va: VirtAddr,
        len: usize,
        access: Access,
    ) -> Result<(), KernelError>
    where
        P: ProcessMemory,
    {
        if len == 0 {
            return Ok(());
        }

        let last = va.byte_add(len - 1)?.page_rounddown();
        let mut va0 = va.page_rounddown();
        loop {
            self.resolve_fault(proc, va0, access)?;
            if va0 == last {
                return Ok(());
            }
            va0 = va0.byte_add(PAGE_SIZE)?;
        }
    }
}
