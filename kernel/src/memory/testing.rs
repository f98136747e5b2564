//! Shared scaffolding for the memory tests: a page-aligned arena handed
//! to the global frame allocator once, and a stub process layer for the
//! fault and copy paths.

use std::{
    ops::Range,
    sync::{Arc, Mutex, MutexGuard, Once, PoisonError},
};

use super::{
    PAGE_SIZE, VirtAddr,
    fault::{FileBacking, MapPerm, ProcessMemory, VmArea, VmaLookup},
    page,
    vm_user::UserPageTable,
};
use crate::error::KernelError;

const HEAP_PAGES: usize = 1024;

static INIT: Once = Once::new();
static SERIAL: Mutex<()> = Mutex::new(());

/// Grants exclusive use of the shared frame arena.
///
/// Tests that allocate frames hold this for their whole body, so the
/// frame counts observed inside a test are deterministic.
pub(crate) fn lock_frames() -> MutexGuard<'static, ()> {
    INIT.call_once(|| {
        let layout =
            std::alloc::Layout::from_size_align(HEAP_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let start = unsafe { std::alloc::alloc(layout) };
        assert!(!start.is_null());
        let end = unsafe { start.add(HEAP_PAGES * PAGE_SIZE) };
        unsafe {
            page::init(start..end);
        }
    });
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn user_page_table() -> UserPageTable {
    UserPageTable::new()
}

pub(crate) type StubFile = Arc<Vec<u8>>;

pub(crate) fn stub_file(bytes: Vec<u8>) -> StubFile {
    Arc::new(bytes)
}

pub(crate) fn anon_area(range: Range<usize>, perm: MapPerm) -> VmArea<StubFile> {
    VmArea {
        range: VirtAddr::new(range.start).unwrap()..VirtAddr::new(range.end).unwrap(),
        perm,
        backing: None,
    }
}

pub(crate) fn file_area(
    range: Range<usize>,
    perm: MapPerm,
    file: StubFile,
    offset: usize,
    len: usize,
) -> VmArea<StubFile> {
    VmArea {
        range: VirtAddr::new(range.start).unwrap()..VirtAddr::new(range.end).unwrap(),
        perm,
        backing: Some(FileBacking { file, offset, len }),
    }
}

/// A stand-in for the process layer: an area registry under a lock, and
/// files that live in memory.
pub(crate) struct StubProc {
    areas: Mutex<Vec<VmArea<StubFile>>>,
}

impl StubProc {
    pub(crate) fn new(areas: Vec<VmArea<StubFile>>) -> Self {
        Self {
            areas: Mutex::new(areas),
        }
    }
}

pub(crate) struct StubAreas<'a>(MutexGuard<'a, Vec<VmArea<StubFile>>>);

impl VmaLookup for StubAreas<'_> {
    type File = StubFile;

    fn lookup(&self, va: VirtAddr) -> Option<VmArea<StubFile>> {
        self.0.iter().find(|area| area.contains(va)).cloned()
    }
}

impl ProcessMemory for StubProc {
    type File = StubFile;
    type AreasGuard<'a>
        = StubAreas<'a>
    where
        Self: 'a;

    fn lock_areas(&self) -> StubAreas<'_> {
        StubAreas(self.areas.lock().unwrap())
    }

    fn read_file(
        &self,
        file: &StubFile,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), KernelError> {
        // the resolver must have released the area lock before reading
        assert!(
            self.areas.try_lock().is_ok(),
            "area lock held across a file read"
        );

        let end = offset.checked_add(dst.len()).ok_or(KernelError::StorageIo)?;
        let bytes = file.get(offset..end).ok_or(KernelError::StorageIo)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}
