//! # Range Mapping API
//!
//! Page- and range-granularity mapping of the *active* address space:
//! map, map-with-allocation, permission changes, unmap-and-free. This is
//! the layer the ELF loader and the page-fault handler build on.
//!
//! All operations work in the user window only — the kernel's own
//! mappings are built once at boot and never touched through this API.
//! Sizes round up to whole pages, and each operation invalidates cached
//! translations for everything it touched exactly once before returning.

use super::addr::{PhysAddr, VirtAddr};
use super::phys::{alloc_phys_pages, free_phys_page, free_phys_pages};
use super::pte::{locate_leaf_slot, Pte, PteFlags, WalkStop};
use super::space::active_root;
use crate::arch;
use crate::conf::{PAGE_SIZE, UMEM_END_VMA, UMEM_START_VMA};
use crate::error::{Error, Result};

/// Whether `vma` may carry a user mapping.
fn in_user_window(vma: VirtAddr) -> bool {
    vma.as_usize() >= UMEM_START_VMA && vma.as_usize() < UMEM_END_VMA
}

/// Map the page at `pp` into the active space at `vma`.
///
/// Missing intermediate tables are allocated and zeroed on demand. An
/// already-valid leaf is refused with `Busy`: callers unmap before they
/// remap, so a stale mapping can never silently leak its old page.
pub fn map_page(vma: VirtAddr, pp: PhysAddr, rwxug_flags: PteFlags) -> Result<VirtAddr> {
    map_page_nofence(vma, pp, rwxug_flags)?;
    arch::sfence_vma_page(vma.as_usize());
    Ok(vma)
}

fn map_page_nofence(vma: VirtAddr, pp: PhysAddr, rwxug_flags: PteFlags) -> Result<()> {
    if !vma.well_formed() || !vma.is_page_aligned() || !pp.is_page_aligned() {
        return Err(Error::Invalid);
    }
    if !in_user_window(vma) {
        // At or below the kernel/user boundary (or past the window).
        return Err(Error::Invalid);
    }
    unsafe {
        let slot = locate_leaf_slot(active_root(), vma, true).map_err(|stop| match stop {
            WalkStop::Superpage(_) => Error::Busy,
            WalkStop::Missing(_) => Error::Invalid,
        })?;
        if (*slot).is_valid() {
            return Err(Error::Busy);
        }
        *slot = Pte::leaf(pp, rwxug_flags);
    }
    Ok(())
}

/// Map `ceil(size / PAGE_SIZE)` consecutive pages starting at `vma`,
/// backed by the physically contiguous run starting at `pp`.
pub fn map_range(vma: VirtAddr, size: usize, pp: PhysAddr, rwxug_flags: PteFlags) -> Result<VirtAddr> {
    let pages = size.div_ceil(PAGE_SIZE);
    let mut result = Ok(());
    for i in 0..pages {
        result = map_page_nofence(vma.add(i * PAGE_SIZE), pp.add_pages(i), rwxug_flags);
        if result.is_err() {
            break;
        }
    }
    // One batched invalidation for the whole range, error or not —
    // earlier pages of a failed range did land in the tree.
    arch::sfence_vma_all();
    result.map(|_| vma)
}

/// Allocate a physically contiguous run covering `size` bytes and map it
/// at `vma`. On failure the fresh run goes straight back to the pool.
pub fn alloc_and_map_range(vma: VirtAddr, size: usize, rwxug_flags: PteFlags) -> Result<VirtAddr> {
    let pages = size.div_ceil(PAGE_SIZE);
    if pages == 0 {
        return Err(Error::Invalid);
    }
    let pp = alloc_phys_pages(pages);
    match map_range(vma, size, pp, rwxug_flags) {
        Ok(vma) => Ok(vma),
        Err(err) => {
            unsafe {
                free_phys_pages(pp, pages);
            }
            Err(err)
        }
    }
}

/// Rewrite the access flags of every already-mapped page in
/// `[vp, vp + size)`. Changes permissions only — it never creates a
/// mapping, and finding a hole in the range is a programming error, not
/// a runtime condition to tolerate.
pub fn set_range_flags(vp: VirtAddr, size: usize, rwxug_flags: PteFlags) {
    // The offset of an unaligned `vp` counts against the span.
    let pages = (vp.page_offset() + size).div_ceil(PAGE_SIZE);
    let base = vp.page_round_down();
    for i in 0..pages {
        let vma = base.add(i * PAGE_SIZE);
        unsafe {
            let slot = match locate_leaf_slot(active_root(), vma, false) {
                Ok(slot) => slot,
                Err(_) => panic!("set_range_flags: {:?} is not mapped", vma),
            };
            if !(*slot).is_valid() {
                panic!("set_range_flags: {:?} is not mapped", vma);
            }
            *slot = Pte::leaf((*slot).phys_addr(), rwxug_flags);
        }
    }
    arch::sfence_vma_all();
}

/// Unmap every page in `[vp, vp + size)` and return its frame to the
/// allocator. Pages that are unmapped at any level, or whose mapping is
/// global, are silently skipped — the range may be sparse.
pub fn unmap_and_free_range(vp: VirtAddr, size: usize) {
    let pages = (vp.page_offset() + size).div_ceil(PAGE_SIZE);
    let base = vp.page_round_down();
    for i in 0..pages {
        let vma = base.add(i * PAGE_SIZE);
        unsafe {
            let slot = match locate_leaf_slot(active_root(), vma, false) {
                Ok(slot) => slot,
                Err(_) => continue,
            };
            let pte = *slot;
            if !pte.is_valid() || pte.is_global() {
                continue;
            }
            free_phys_page(pte.phys_addr());
            *slot = Pte::invalid();
        }
    }
    arch::sfence_vma_all();
}

// Behavioral tests live in memory::tests, where an active space with a
// backing arena is available.
