use spin::Once;

#[cfg(target_arch = "riscv64")]
use riscv::{asm, register::satp};

use super::{
    PAGE_SIZE, PhysAddr, VirtAddr,
    layout::{
        CLINT, CLINT_SIZE, KERN_BASE, KernelLayout, PHYS_TOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0,
        VIRTIO0, VIRTIO1,
    },
    page::PageBox,
    page_table::{PageTable, PtEntryFlags},
};
use crate::error::KernelError;

/// The kernel's page table.
static KERNEL_PAGE_TABLE: Once<KernelPageTable> = Once::new();

/// Installs the kernel page table built by boot code.
///
/// Called once, after the boot hart has added its extra mappings (the
/// per-process kernel stacks) with [`KernelPageTable::map`].
pub fn init(kpgtbl: KernelPageTable) {
    KERNEL_PAGE_TABLE.call_once(|| kpgtbl);
}

pub fn get() -> &'static KernelPageTable {
    KERNEL_PAGE_TABLE
        .get()
        .expect("kernel page table is not initialized")
}

/// Switch h/w page table register to the kernel's page table,
/// and enable paging.
#[cfg(target_arch = "riscv64")]
pub fn init_hart() {
    // wait for any previous writes to the page table memory to finish.
    asm::sfence_vma_all();

    unsafe {
        satp::set(satp::Mode::Sv39, 0, get().0.phys_page_num().value());
    }

    // flush stale entries from the TLB.
    asm::sfence_vma_all();
}

fn ident_map(kpgtbl: &mut PageTable, addr: usize, size: usize, perm: PtEntryFlags) {
    kpgtbl
        .map_pages(VirtAddr::new(addr).unwrap(), size, PhysAddr::new(addr), perm)
        .unwrap();
}

pub struct KernelPageTable(PageBox<PageTable>);

impl KernelPageTable {
    /// Makes a direct-map page table for the kernel.
    pub fn new(layout: &KernelLayout) -> Self {
        use PtEntryFlags as F;

        let mut kpgtbl = PageTable::try_allocate().unwrap();

        // uart registers
        ident_map(&mut kpgtbl, UART0, PAGE_SIZE, F::RW);

        // virtio mmio disk interfaces
        ident_map(&mut kpgtbl, VIRTIO0, PAGE_SIZE, F::RW);
        ident_map(&mut kpgtbl, VIRTIO1, PAGE_SIZE, F::RW);

        // CLINT
        ident_map(&mut kpgtbl, CLINT, CLINT_SIZE, F::RW);

        // PLIC
        ident_map(&mut kpgtbl, PLIC, PLIC_SIZE, F::RW);

        // map kernel text executable and read-only.
        let text_end = layout.text_end.addr();
        ident_map(&mut kpgtbl, KERN_BASE, text_end - KERN_BASE, F::RX);

        // map kernel data and the physical RAM we'll make use of.
        ident_map(&mut kpgtbl, text_end, PHYS_TOP - text_end, F::RW);

        // map the trampoline for trap entry/exit to
        // the highest virtual address in the kernel.
        kpgtbl
            .map_pages(TRAMPOLINE, PAGE_SIZE, layout.trampoline, F::RX)
            .unwrap();

        Self(kpgtbl)
    }

    /// Adds a kernel mapping after [`KernelPageTable::new`], e.g. for the
    /// per-process kernel stacks.
    ///
    /// Boot-time only; panics if a page-table page cannot be allocated.
    pub fn map(&mut self, va: VirtAddr, size: usize, pa: PhysAddr, perm: PtEntryFlags) {
        self.0.map_pages(va, size, pa, perm).unwrap();
    }

    /// Translates a kernel virtual address to a physical address.
    ///
    /// Used for virtual addresses the kernel does not map one-to-one,
    /// such as the kernel stacks.
    pub fn phys_addr(&self, va: VirtAddr) -> Result<PhysAddr, KernelError> {
        self.0.resolve_virtual_address(va, PtEntryFlags::empty())
    }
}

impl Drop for KernelPageTable {
    fn drop(&mut self) {
        // the mapped frames are borrowed (devices, kernel image, RAM);
        // only the page-table pages themselves go back
        self.0.free_tables();
    }
}
