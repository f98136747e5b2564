//! Physical memory layout
//!
//! qemu -machine virt is set up like this,
//! based on qemu's [hw/riscv/virt.c]:
//!
//! ```text
//! 0x0000_1000 -- boot ROM, provided by qemu
//! 0x0200_0000 -- CLINT
//! 0x0c00_0000 -- PLIC
//! 0x1000_0000 -- UART0
//! 0x1000_1000 -- virtio disk
//! 0x8000_0000 -- boot ROM jumps here in machine mode
//!               -kernel loads the kernel here
//! unused RAM after 0x8000_0000.
//! ```
//!
//! the kernel uses physical memory thus:
//!
//! ```text
//! 0x8000_0000 -- KERN_BASE. start of kernel text
//! text_end    -- start of kernel data
//! PHYS_TOP    -- end of RAM used by the kernel
//! ```
//!
//! [hw/riscv/virt.c]: https://github.com/qemu/qemu/blob/9.2.0/hw/riscv/virt.c

use super::{PAGE_SIZE, PhysAddr, VirtAddr};

// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;

// virtio mmio disk interfaces
pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO1: usize = 0x1000_2000;

// core local interruptor (CLINT), which contains the timer.
pub const CLINT: usize = 0x200_0000;
pub const CLINT_SIZE: usize = 0x1_0000;

// qemu puts platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x40_0000;

// the kernel expects there to be RAM
// for use by the kernel and user pages
// from physical address 0x80000000 to PHYS_TOP.
pub const KERN_BASE: usize = 0x8000_0000;
pub const PHYS_TOP: usize = KERN_BASE + 128 * 1024 * 1024;

/// A page of trap entry/exit code, mapped at the highest virtual address
/// in user and kernel space alike, so that traps can switch page tables
/// without losing instruction continuity.
pub const TRAMPOLINE: VirtAddr = match VirtAddr::MAX.byte_sub(PAGE_SIZE) {
    Ok(va) => va,
    Err(_) => unreachable!(),
};

/// The addresses `kernel.ld` determines at link time.
#[derive(Debug, Clone)]
pub struct KernelLayout {
    /// Address of the end of kernel code.
    pub text_end: PhysAddr,
    /// Physical address of the trampoline code page.
    pub trampoline: PhysAddr,
}

#[cfg(target_arch = "riscv64")]
impl KernelLayout {
    /// Reads the layout from the linker-script symbols.
    pub fn from_linker() -> Self {
        unsafe extern "C" {
            #[link_name = "etext"]
            static mut TEXT_END: [u8; 0];
            #[link_name = "trampoline"]
            static mut TRAMPOLINE_CODE: [u8; 0];
        }

        Self {
            text_end: PhysAddr::new((&raw mut TEXT_END).addr()),
            trampoline: PhysAddr::new((&raw mut TRAMPOLINE_CODE).addr()),
        }
    }
}
