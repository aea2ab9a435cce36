//! Host stand-ins for the privileged CSRs.
//!
//! A mock `satp` and interrupt-enable bit, atomic so parallel unit tests
//! cannot tear them. Fences are no-ops: the host has no translation cache
//! to invalidate, and the tests only care that the table contents are
//! right when the dust settles.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static SATP: AtomicU64 = AtomicU64::new(0);
static SIE: AtomicBool = AtomicBool::new(false);

pub fn read_satp() -> u64 {
    SATP.load(Ordering::SeqCst)
}

pub fn write_satp(bits: u64) {
    SATP.store(bits, Ordering::SeqCst);
}

pub fn swap_satp(bits: u64) -> u64 {
    SATP.swap(bits, Ordering::SeqCst)
}

pub fn sfence_vma_all() {}

pub fn sfence_vma_page(_vma: usize) {}

pub fn interrupts_enabled() -> bool {
    SIE.load(Ordering::SeqCst)
}

pub fn disable_interrupts() {
    SIE.store(false, Ordering::SeqCst);
}

pub fn enable_interrupts() {
    SIE.store(true, Ordering::SeqCst);
}

pub fn allow_user_access() {}

pub fn wait_for_interrupt() {}

pub fn read_sstatus() -> usize {
    0
}

pub fn read_scause() -> usize {
    0
}

pub fn read_stval() -> usize {
    0
}
