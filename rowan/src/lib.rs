//! # Rowan — a teaching kernel for single-core RISC-V
//!
//! Rowan boots on the QEMU `virt` machine, builds an Sv39 identity
//! mapping for itself, runs cooperative kernel threads, and multiplexes
//! ELF user programs as processes with lazily-populated address spaces.
//! The library crate carries everything; the `rowan` binary is just the
//! boot shim around `kmain`.
//!
//! On non-RISC-V hosts the crate still compiles — the privileged
//! hardware sits behind `arch`, which swaps in a mock register file —
//! so the memory manager and friends run under plain `cargo test`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod conf;
pub mod console;
pub mod elf;
pub mod error;
pub mod fs;
pub mod heap;
pub mod memory;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod trap;

/// Kernel heap behind Rust's allocation primitives. `memory::init`
/// hands it its window; until then any allocation fails.
#[cfg(target_arch = "riscv64")]
#[global_allocator]
static GLOBAL_ALLOCATOR: heap::KernelHeap = heap::KernelHeap::new();

/// Point the global allocator at its memory window.
#[cfg(target_arch = "riscv64")]
pub(crate) fn heap_init(heap_start: usize, heap_size: usize) {
    unsafe {
        GLOBAL_ALLOCATOR.init(heap_start, heap_size);
    }
}

/// Free heap bytes (diagnostics).
#[cfg(target_arch = "riscv64")]
pub fn heap_free_bytes() -> usize {
    GLOBAL_ALLOCATOR.free_bytes()
}
