//! # Address Space Manager
//!
//! An address space is identified by its *memory-space tag*: the exact
//! image of the hardware translation-control register (`satp`) — paging
//! mode, ASID, and the physical page number of the root table. Exactly
//! one tag is active on the hart at a time; switching tags switches
//! worlds.
//!
//! Beyond get/switch, this module owns whole-space lifecycle: deep
//! cloning for `fork`, recursive teardown for `exec` and `exit`. Global
//! (kernel) mappings are shared by reference across every space and
//! survive teardown; everything else is per-space and gets freed.

use core::sync::atomic::{AtomicU64, Ordering};

use super::addr::PhysAddr;
use super::phys::{alloc_phys_page, alloc_phys_pages, free_phys_page, free_phys_pages};
use super::pte::{child_table, PageTable, Pte, PteFlags};
use crate::arch;
use crate::conf::{PAGE_SIZE, PTE_CNT, ROOT_LEVEL};

/// Sv39 mode value in satp bits 63:60.
const SATP_MODE_SV39: u64 = 8;
const SATP_MODE_SHIFT: u64 = 60;
const SATP_ASID_SHIFT: u64 = 44;

/// A memory-space tag: mode, ASID, and root-table page number, encoded
/// exactly as the hardware expects them in `satp`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Mtag(u64);

impl Mtag {
    /// Tag for the root table at `root` under the given ASID.
    pub fn new(root: PhysAddr, asid: u16) -> Self {
        Self(
            (SATP_MODE_SV39 << SATP_MODE_SHIFT)
                | ((asid as u64) << SATP_ASID_SHIFT)
                | root.page_num().as_u64(),
        )
    }

    /// Recover the root-table address: shift out mode and ASID (20 high
    /// bits), leaving the 44-bit PPN scaled back up to an address.
    pub fn root(self) -> PhysAddr {
        PhysAddr::new(((self.0 << 20) >> 8) as usize)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for Mtag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Mtag({:#x})", self.0)
    }
}

/// Tag of the permanent kernel space, recorded once by `memory::init`.
static MAIN_MTAG: AtomicU64 = AtomicU64::new(0);

/// Record the permanent kernel tag. `memory::init` calls this once;
/// tests use it to stand up a fake kernel space.
pub fn set_main_mtag(tag: Mtag) {
    MAIN_MTAG.store(tag.raw(), Ordering::SeqCst);
}

/// The permanent kernel space's tag.
pub fn main_mtag() -> Mtag {
    Mtag(MAIN_MTAG.load(Ordering::SeqCst))
}

/// Tag of the currently active address space.
pub fn active_mspace() -> Mtag {
    Mtag(arch::read_satp())
}

/// Install `tag` as the active address space, returning the outgoing
/// tag. Cached translations are invalidated so neither the old nor the
/// new space's stale entries can be observed.
pub fn switch_mspace(tag: Mtag) -> Mtag {
    let prev = arch::swap_satp(tag.raw());
    arch::sfence_vma_all();
    Mtag(prev)
}

/// Root table of the active space.
pub(super) fn active_root() -> *mut PageTable {
    active_mspace().root().as_mut_ptr()
}

/// Pages spanned by one leaf at `level` (1, 512, or 512*512).
fn level_pages(level: usize) -> usize {
    1 << (9 * level)
}

/// Deep-copy the active address space and return the new space's tag.
///
/// Every valid global entry is shared by reference — kernel pages and
/// kernel tables are common property of all spaces. Every valid
/// non-global leaf gets fresh physical pages with the contents copied;
/// every valid non-global table pointer gets a fresh child table, cloned
/// recursively. The copy is eager: after this returns the two spaces
/// share no writable storage.
pub fn clone_active_mspace() -> Mtag {
    let root = unsafe { clone_table(active_root(), ROOT_LEVEL) };
    Mtag::new(PhysAddr::new(root as usize), 0)
}

unsafe fn clone_table(src: *const PageTable, level: usize) -> *mut PageTable {
    let dst = alloc_phys_page().as_mut_ptr::<PageTable>();
    core::ptr::write_bytes(dst, 0, 1);

    for index in 0..PTE_CNT {
        let pte = (*src).entry(index);
        if !pte.is_valid() {
            continue;
        }
        if pte.is_global() {
            // Shared with every space; copy the entry, not the storage.
            *(*dst).entry_mut(index) = pte;
        } else if pte.is_leaf() {
            let pages = level_pages(level);
            let copy = alloc_phys_pages(pages);
            core::ptr::copy_nonoverlapping(
                pte.phys_addr().as_ptr::<u8>(),
                copy.as_mut_ptr::<u8>(),
                pages * PAGE_SIZE,
            );
            *(*dst).entry_mut(index) = Pte::leaf(copy, pte.flags() & PteFlags::RWXUG);
        } else {
            let child = clone_table(child_table(pte), level - 1);
            *(*dst).entry_mut(index) = Pte::table(PhysAddr::new(child as usize), false);
        }
    }

    dst
}

/// Tear the active space down to its global (kernel) mappings.
///
/// Every valid non-global leaf's backing pages go back to the allocator
/// and the entry is nulled. A child table is freed only once all of its
/// own entries ended up freed or were already invalid — a table still
/// holding global entries stays.
pub fn reset_active_mspace() {
    unsafe {
        reset_table(active_root(), ROOT_LEVEL);
    }
    arch::sfence_vma_all();
}

/// Returns true when `table` holds no remaining valid entries.
unsafe fn reset_table(table: *mut PageTable, level: usize) -> bool {
    let mut emptied = true;
    for index in 0..PTE_CNT {
        let pte = (*table).entry(index);
        if !pte.is_valid() {
            continue;
        }
        if pte.is_global() {
            emptied = false;
            continue;
        }
        if pte.is_leaf() {
            free_phys_pages(pte.phys_addr(), level_pages(level));
            *(*table).entry_mut(index) = Pte::invalid();
        } else {
            let child = child_table(pte);
            if reset_table(child, level - 1) {
                free_phys_page(PhysAddr::new(child as usize));
                *(*table).entry_mut(index) = Pte::invalid();
            } else {
                emptied = false;
            }
        }
    }
    emptied
}

/// Reset the active space, switch back to the permanent kernel space,
/// free the dead root table, and return the outgoing tag. The returned
/// tag names a space that no longer exists — it is a diagnostic value,
/// not something to switch to.
pub fn discard_active_mspace() -> Mtag {
    reset_active_mspace();
    let prev = switch_mspace(main_mtag());
    if prev != main_mtag() {
        // After reset the old root holds only shared global entries, so
        // the table page itself is the last per-space storage.
        unsafe {
            free_phys_page(prev.root());
        }
    }
    prev
}
