//! # User Page Fault Handler
//!
//! Lazy allocation for the user window. A user process's stack and heap
//! are not populated up front; the first touch of an unmapped page lands
//! here, gets one zero-filled page mapped read/write/user, and the
//! process resumes none the wiser.
//!
//! Everything else is *not handled* and the trap dispatcher treats it as
//! a protection violation: faults outside the user window, and faults on
//! addresses that already carry a valid mapping at any level (those are
//! permission problems — a write to a read-only page, an execute of a
//! data page — and handing out a fresh page would paper over them).

use super::addr::VirtAddr;
use super::map::map_page;
use super::phys::{alloc_phys_page, free_phys_page};
use super::pte::{walk, PteFlags, Walk};
use super::space::active_root;
use crate::conf::{PAGE_SIZE, UMEM_END_VMA, UMEM_START_VMA};

/// Attempt to service a U-mode page fault at `vma`. Returns true when
/// the fault was a lazy-allocation opportunity and has been serviced;
/// false when the caller must treat it as an access violation.
pub fn handle_umode_page_fault(vma: VirtAddr) -> bool {
    if vma.as_usize() < UMEM_START_VMA || vma.as_usize() >= UMEM_END_VMA {
        return false;
    }

    // Only a path that is unmapped the whole way down qualifies. A leaf
    // at any level (superpages included) or a valid bottom entry means
    // the address is mapped and the fault is a real violation.
    match unsafe { walk(active_root(), vma) } {
        Walk::Unmapped { .. } => {}
        Walk::Leaf { .. } | Walk::Malformed => return false,
    }

    let pp = alloc_phys_page();
    unsafe {
        core::ptr::write_bytes(pp.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }

    // map_page re-checks the slot and fences the address on success.
    match map_page(
        vma.page_round_down(),
        pp,
        PteFlags::R | PteFlags::W | PteFlags::U,
    ) {
        Ok(_) => true,
        Err(_) => {
            unsafe {
                free_phys_page(pp);
            }
            false
        }
    }
}

// Behavioral tests live in memory::tests, where an active space with a
// backing arena is available.
