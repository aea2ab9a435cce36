//! Platform configuration for the QEMU `virt` machine.
//!
//! Rowan runs on a single-hart RISC-V board: 128 MiB of RAM at
//! `0x8000_0000`, a 16550 UART at `0x1000_0000`, Sv39 paging. Everything
//! the rest of the kernel needs to know about the memory map lives here,
//! so the numbers are written down exactly once.

/// Log2 of the page size.
pub const PAGE_ORDER: usize = 12;

/// Size of one page (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_ORDER;

/// Entries per page table: one page worth of 8-byte PTEs.
pub const PTE_CNT: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// Level of the root page table (levels are numbered 2 down to 0).
pub const ROOT_LEVEL: usize = 2;

/// Size of a level-1 superpage (2 MiB).
pub const MEGA_SIZE: usize = (1 << 9) * PAGE_SIZE;

/// Size of a level-2 superpage (1 GiB).
pub const GIGA_SIZE: usize = (1 << 9) * MEGA_SIZE;

/// Physical address where RAM begins. The kernel image is linked here.
pub const RAM_START_PMA: usize = 0x8000_0000;

/// Amount of physical RAM.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;

/// One past the last physical RAM address.
pub const RAM_END_PMA: usize = RAM_START_PMA + RAM_SIZE;

/// Start of the user virtual address window. Nothing below this may be
/// mapped on behalf of a user process.
pub const UMEM_START_VMA: usize = 0xC000_0000;

/// One past the end of the user virtual address window.
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

/// Size of the kernel heap, carved out right after the kernel image.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// MMIO base of the first 16550 UART on the virt board.
pub const UART0_BASE: usize = 0x1000_0000;

/// Size of a kernel thread stack.
pub const KSTACK_SIZE: usize = 16 * 1024;

/// Maximum number of threads.
pub const NTHR: usize = 32;

/// Maximum number of processes.
pub const NPROC: usize = 16;

/// Open file slots per process.
pub const NFILE: usize = 16;
