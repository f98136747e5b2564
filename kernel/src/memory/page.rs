//! Physical memory allocator, for user processes,
//! kernel stacks, page-table pages,
//! and pipe buffers.
//!
//! Allocates whole 4096-byte pages.

use core::{ops::Range, ptr::NonNull};

use page_alloc::{PageFrameAllocator, RetrievePageFrameAllocator};
use spin::{Mutex, MutexGuard, Once};

use super::PAGE_SIZE;
use crate::error::KernelError;

static PAGE_FRAME_ALLOCATOR: Once<Mutex<PageFrameAllocator<PAGE_SIZE>>> = Once::new();

fn allocator() -> &'static Mutex<PageFrameAllocator<PAGE_SIZE>> {
    PAGE_FRAME_ALLOCATOR
        .get()
        .expect("frame allocator is not initialized")
}

/// Hands the page range `heap` to the frame allocator.
///
/// Called once at boot with the range between the end of the kernel image
/// and the top of physical RAM.
///
/// # Safety
///
/// `heap` must be page-aligned, unused by anything else, and valid for the
/// lifetime of the kernel.
pub unsafe fn init(heap: Range<*mut u8>) {
    PAGE_FRAME_ALLOCATOR.call_once(|| unsafe { Mutex::new(PageFrameAllocator::new(heap)) });
}

/// Frees the page of physical memory pointed at by `pa`,
/// which normally should have been returned by a
/// call to [`alloc_page`].
///
/// # Safety
///
/// `pa` must have come from [`alloc_page`] or [`alloc_zeroed_page`] and
/// must not be used afterwards.
pub unsafe fn free_page(pa: NonNull<u8>) {
    // Fill with junk to catch dangling refs.
    unsafe {
        pa.write_bytes(1, PAGE_SIZE);
    }
    unsafe {
        allocator().lock().free(pa);
    }
}

/// Allocates one 4096-byte page of physical memory.
///
/// Returns a pointer that the kernel can use.
pub fn alloc_page() -> Result<NonNull<u8>, KernelError> {
    let p = allocator().lock().alloc().ok_or(KernelError::NoFreePage)?;
    unsafe {
        p.write_bytes(5, PAGE_SIZE);
    }
    Ok(p)
}

/// Allocates one 4096-byte zeroed page of physical memory.
///
/// Returns a pointer that the kernel can use.
pub fn alloc_zeroed_page() -> Result<NonNull<u8>, KernelError> {
    allocator()
        .lock()
        .alloc_zeroed()
        .ok_or(KernelError::NoFreePage)
}

/// Returns the number of physical pages currently free.
pub fn free_page_count() -> usize {
    allocator().lock().free_pages()
}

/// Hands the global frame allocator to [`PageBox`].
pub struct Retriever;

impl RetrievePageFrameAllocator<PAGE_SIZE> for Retriever {
    type AllocatorRef = MutexGuard<'static, PageFrameAllocator<PAGE_SIZE>>;

    fn retrieve_allocator() -> Self::AllocatorRef {
        allocator().lock()
    }
}

/// A pointer type that uniquely owns a page of type `T`.
pub type PageBox<T> = page_alloc::PageBox<T, Retriever, PAGE_SIZE>;
