use crate::memory::{VirtAddr, fault::FaultError};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("no free page found")]
    NoFreePage,
    #[error("too large virtual address: {0:#x}")]
    TooLargeVirtualAddress(usize),
    #[error("virtual address underflow")]
    VirtualAddressUnderflow,
    #[error("page not mapped: {0:#x}")]
    VirtualPageNotMapped(VirtAddr),
    #[error("inaccessible page: {0:#x}")]
    InaccessiblePage(VirtAddr),
    #[error("user string exceeds {0} bytes without a NUL")]
    UserStringTooLong(usize),
    #[error("backing storage i/o error")]
    StorageIo,
    #[error("page fault not resolved: {0}")]
    Fault(#[from] FaultError),
}
