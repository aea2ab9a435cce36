//! RISC-V privileged-architecture access.
//!
//! `satp` and the fences are raw CSR instructions; sstatus bits and `wfi`
//! go through the `riscv` crate.

use core::arch::asm;

use riscv::register::sstatus;

/// Read the translation-control register.
#[inline]
pub fn read_satp() -> u64 {
    let bits: u64;
    unsafe {
        asm!("csrr {}, satp", out(reg) bits, options(nomem, nostack, preserves_flags));
    }
    bits
}

/// Write the translation-control register. The caller fences.
#[inline]
pub fn write_satp(bits: u64) {
    unsafe {
        asm!("csrw satp, {}", in(reg) bits, options(nostack, preserves_flags));
    }
}

/// Atomically exchange the translation-control register, returning the
/// previous value. The caller fences.
#[inline]
pub fn swap_satp(bits: u64) -> u64 {
    let prev: u64;
    unsafe {
        asm!("csrrw {}, satp, {}", out(reg) prev, in(reg) bits, options(nostack, preserves_flags));
    }
    prev
}

/// Invalidate all cached translations.
#[inline]
pub fn sfence_vma_all() {
    unsafe {
        asm!("sfence.vma zero, zero", options(nostack, preserves_flags));
    }
}

/// Invalidate cached translations for the page containing `vma`.
#[inline]
pub fn sfence_vma_page(vma: usize) {
    unsafe {
        asm!("sfence.vma {}, zero", in(reg) vma, options(nostack, preserves_flags));
    }
}

/// Whether supervisor interrupts are currently enabled.
#[inline]
pub fn interrupts_enabled() -> bool {
    sstatus::read().sie()
}

/// Disable supervisor interrupts.
#[inline]
pub fn disable_interrupts() {
    unsafe {
        sstatus::clear_sie();
    }
}

/// Enable supervisor interrupts.
#[inline]
pub fn enable_interrupts() {
    unsafe {
        sstatus::set_sie();
    }
}

/// Permit supervisor loads and stores to user-accessible pages (SUM).
#[inline]
pub fn allow_user_access() {
    unsafe {
        sstatus::set_sum();
    }
}

/// Idle until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Supervisor status register.
#[inline]
pub fn read_sstatus() -> usize {
    let bits: usize;
    unsafe {
        asm!("csrr {}, sstatus", out(reg) bits, options(nomem, nostack, preserves_flags));
    }
    bits
}

/// Exception cause register.
#[inline]
pub fn read_scause() -> usize {
    let bits: usize;
    unsafe {
        asm!("csrr {}, scause", out(reg) bits, options(nomem, nostack, preserves_flags));
    }
    bits
}

/// Trap value register (faulting address for page faults).
#[inline]
pub fn read_stval() -> usize {
    let bits: usize;
    unsafe {
        asm!("csrr {}, stval", out(reg) bits, options(nomem, nostack, preserves_flags));
    }
    bits
}
