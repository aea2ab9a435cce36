//! # User Pointer Validation
//!
//! The kernel must never dereference a user-supplied pointer it has not
//! checked: a hostile process can pass any bit pattern it likes, and one
//! careless kernel-mode load through it would read (or one store would
//! corrupt) arbitrary memory. Before the syscall layer touches user
//! memory it runs the pointer through this module, which walks the
//! active page table read-only and confirms every touched page is mapped
//! with at least the required access.
//!
//! Validation failure is a routine, recoverable outcome — the syscall
//! returns a bad-address error to the process and the kernel carries on.

use super::addr::VirtAddr;
use super::pte::{walk, PteFlags, Walk};
use super::space::active_root;
use crate::conf::{GIGA_SIZE, MEGA_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};

/// Bytes covered by a leaf at `level`.
fn level_size(level: usize) -> usize {
    match level {
        0 => PAGE_SIZE,
        1 => MEGA_SIZE,
        _ => GIGA_SIZE,
    }
}

/// Check that `[vp, vp + len)` is mapped with at least `rwxug_flags`
/// access at every page.
///
/// A zero-length range is trivially valid. The range must not wrap the
/// address width, and both ends must be well-formed — an ill-formed
/// address would fault in hardware no matter what the tables say.
pub fn validate_vptr(vp: VirtAddr, len: usize, rwxug_flags: PteFlags) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    if !vp.well_formed() {
        return Err(Error::BadAddress);
    }
    let end = vp
        .as_usize()
        .checked_add(len)
        .ok_or(Error::BadAddress)?;
    if !VirtAddr::new(end - 1).well_formed() {
        return Err(Error::BadAddress);
    }

    let mut vma = vp.page_round_down();
    while vma.as_usize() < end {
        match unsafe { walk(active_root(), vma) } {
            Walk::Unmapped { .. } | Walk::Malformed => return Err(Error::BadAddress),
            Walk::Leaf { level, pte } => {
                if !pte.covers(rwxug_flags) {
                    return Err(Error::BadAddress);
                }
                // The whole extent of a superpage leaf is covered by the
                // flags we just checked; skip to its end.
                let span = level_size(level);
                let next = (vma.as_usize() & !(span - 1)) + span;
                vma = VirtAddr::new(next);
            }
        }
    }
    Ok(())
}

/// Check that the NUL-terminated string at `vs` is fully mapped with at
/// least `rug_flags` access, returning its length (NUL excluded).
///
/// The scan works one page at a time and never reads a byte of a page
/// that has not just been validated. The bytes are read through the
/// translation that was validated, so a concurrent remap cannot redirect
/// the scan.
pub fn validate_vstr(vs: VirtAddr, rug_flags: PteFlags) -> Result<usize> {
    let mut vma = vs;
    let mut len = 0usize;
    loop {
        if !vma.well_formed() {
            // Ran off the top of the address space without a NUL.
            return Err(Error::BadAddress);
        }
        let page_end = vma.page_round_down().add(PAGE_SIZE);
        let span = page_end.as_usize() - vma.as_usize();
        validate_vptr(vma, span, rug_flags)?;

        // The page checked out; find its physical bytes and scan them.
        let (level, pte) = match unsafe { walk(active_root(), vma) } {
            Walk::Leaf { level, pte } => (level, pte),
            // validate_vptr above already proved this is a leaf.
            _ => return Err(Error::BadAddress),
        };
        let base = pte.phys_addr().as_usize() + (vma.as_usize() & (level_size(level) - 1));
        for i in 0..span {
            let byte = unsafe { *((base + i) as *const u8) };
            if byte == 0 {
                return Ok(len);
            }
            len += 1;
        }
        vma = page_end;
    }
}

/// Copy user memory at `vp` into `dst` after validating readability.
///
/// The copy goes through the user virtual address itself, which requires
/// the owning space to be active and `sstatus.SUM` to be set (done once
/// at boot).
pub fn copy_from_user(dst: &mut [u8], vp: VirtAddr) -> Result<()> {
    validate_vptr(vp, dst.len(), PteFlags::U | PteFlags::R)?;
    unsafe {
        core::ptr::copy_nonoverlapping(vp.as_usize() as *const u8, dst.as_mut_ptr(), dst.len());
    }
    Ok(())
}

/// Copy `src` into user memory at `vp` after validating writability.
pub fn copy_to_user(vp: VirtAddr, src: &[u8]) -> Result<()> {
    validate_vptr(vp, src.len(), PteFlags::U | PteFlags::W)?;
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), vp.as_usize() as *mut u8, src.len());
    }
    Ok(())
}

// Behavioral tests live in memory::tests, where an active space with a
// backing arena is available.
