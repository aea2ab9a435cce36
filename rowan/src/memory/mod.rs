//! # Virtual Memory Manager
//!
//! The heart of the kernel: Sv39 page tables, the physical page pool,
//! address-space lifecycle, demand paging for the user window, and the
//! validation layer that keeps user pointers at arm's length.
//!
//! Layout at boot (all of it global, shared by every address space):
//!
//! ```text
//!          0 .. RAM_START:             RW gigapages (MMIO region)
//!  RAM_START .. kimg_end:              RX/R/RW pages by kernel image section
//!   kimg_end .. RAM_START + MEGA_SIZE: RW pages (heap start)
//!  RAM_START + MEGA_SIZE .. RAM_END:   RW megapages (heap tail, free page pool)
//! ```
//!
//! The kernel image must fit inside the first 2 MiB megapage of RAM —
//! that is what lets it get per-section permissions from one level-0
//! table. The heap takes a fixed window right after the image, the page
//! pool everything after that. The kernel runs identity-mapped, which is
//! what lets the paging code treat a physical address in a PTE as a
//! pointer it can follow.

pub mod addr;
pub mod fault;
pub mod map;
pub mod phys;
pub mod pte;
pub mod space;
pub mod validate;

pub use addr::{PageNum, PhysAddr, VirtAddr};
pub use fault::handle_umode_page_fault;
pub use map::{alloc_and_map_range, map_page, map_range, set_range_flags, unmap_and_free_range};
pub use phys::{
    alloc_phys_page, alloc_phys_pages, free_phys_page, free_phys_page_count, free_phys_pages,
};
pub use pte::{PageTable, Pte, PteFlags};
pub use space::{
    active_mspace, clone_active_mspace, discard_active_mspace, main_mtag, reset_active_mspace,
    switch_mspace, Mtag,
};
pub use validate::{copy_from_user, copy_to_user, validate_vptr, validate_vstr};

use core::sync::atomic::{AtomicBool, Ordering};

static MEMORY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Whether `init` has completed.
pub fn initialized() -> bool {
    MEMORY_INITIALIZED.load(Ordering::SeqCst)
}

// The kernel's permanent translation tables: root, the level-1 table for
// the RAM gigarange, and the level-0 table for the kernel's megapage.
// Built once at boot, never torn down.
#[cfg(target_arch = "riscv64")]
static mut MAIN_PT2: PageTable = PageTable::empty();
#[cfg(target_arch = "riscv64")]
static mut MAIN_PT1: PageTable = PageTable::empty();
#[cfg(target_arch = "riscv64")]
static mut MAIN_PT0: PageTable = PageTable::empty();

/// Build the kernel's identity mapping, enable paging, and hand the rest
/// of RAM to the heap and the page pool.
///
/// # Safety
///
/// Call exactly once, on the boot hart, before anything allocates.
#[cfg(target_arch = "riscv64")]
pub unsafe fn init() {
    use core::ptr::{addr_of, addr_of_mut};

    use crate::conf::{
        GIGA_SIZE, HEAP_SIZE, MEGA_SIZE, PAGE_SIZE, RAM_END_PMA, RAM_START_PMA,
    };

    // Linker-provided kernel image section boundaries (kernel.ld).
    extern "C" {
        static _kimg_start: u8;
        static _kimg_text_start: u8;
        static _kimg_text_end: u8;
        static _kimg_rodata_start: u8;
        static _kimg_rodata_end: u8;
        static _kimg_data_start: u8;
        static _kimg_end: u8;
    }

    let kimg_start = addr_of!(_kimg_start) as usize;
    let text_start = addr_of!(_kimg_text_start) as usize;
    let text_end = addr_of!(_kimg_text_end) as usize;
    let rodata_start = addr_of!(_kimg_rodata_start) as usize;
    let rodata_end = addr_of!(_kimg_rodata_end) as usize;
    let data_start = addr_of!(_kimg_data_start) as usize;
    let kimg_end = addr_of!(_kimg_end) as usize;

    assert_eq!(RAM_START_PMA, kimg_start);
    if kimg_end - kimg_start > MEGA_SIZE {
        panic!("kernel image exceeds its megapage");
    }

    let pt2 = addr_of_mut!(MAIN_PT2);
    let pt1 = addr_of_mut!(MAIN_PT1);
    let pt0 = addr_of_mut!(MAIN_PT0);

    // Identity-map the MMIO region as RW gigapages.
    let mut pma = 0;
    while pma < RAM_START_PMA {
        *(*pt2).entry_mut(VirtAddr::new(pma).vpn(2)) = Pte::leaf(
            PhysAddr::new(pma),
            PteFlags::R | PteFlags::W | PteFlags::G,
        );
        pma += GIGA_SIZE;
    }

    // The RAM gigarange descends into a level-1 table, and its first
    // megarange into a level-0 table, so the kernel image can be mapped
    // page by page with section-accurate permissions.
    *(*pt2).entry_mut(VirtAddr::new(RAM_START_PMA).vpn(2)) =
        Pte::table(PhysAddr::new(pt1 as usize), true);
    *(*pt1).entry_mut(VirtAddr::new(RAM_START_PMA).vpn(1)) =
        Pte::table(PhysAddr::new(pt0 as usize), true);

    let mut pp = text_start;
    while pp < text_end {
        *(*pt0).entry_mut(VirtAddr::new(pp).vpn(0)) = Pte::leaf(
            PhysAddr::new(pp),
            PteFlags::R | PteFlags::X | PteFlags::G,
        );
        pp += PAGE_SIZE;
    }
    let mut pp = rodata_start;
    while pp < rodata_end {
        *(*pt0).entry_mut(VirtAddr::new(pp).vpn(0)) =
            Pte::leaf(PhysAddr::new(pp), PteFlags::R | PteFlags::G);
        pp += PAGE_SIZE;
    }
    let mut pp = data_start;
    while pp < RAM_START_PMA + MEGA_SIZE {
        *(*pt0).entry_mut(VirtAddr::new(pp).vpn(0)) = Pte::leaf(
            PhysAddr::new(pp),
            PteFlags::R | PteFlags::W | PteFlags::G,
        );
        pp += PAGE_SIZE;
    }

    // Remaining RAM as RW megapages.
    let mut pp = RAM_START_PMA + MEGA_SIZE;
    while pp < RAM_END_PMA {
        *(*pt1).entry_mut(VirtAddr::new(pp).vpn(1)) = Pte::leaf(
            PhysAddr::new(pp),
            PteFlags::R | PteFlags::W | PteFlags::G,
        );
        pp += MEGA_SIZE;
    }

    // Enable paging.
    let tag = Mtag::new(PhysAddr::new(pt2 as usize), 0);
    space::set_main_mtag(tag);
    crate::arch::write_satp(tag.raw());
    crate::arch::sfence_vma_all();

    // The heap takes a fixed window right after the image; everything
    // beyond it becomes the free page pool.
    let heap_start = (kimg_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let heap_end = heap_start + HEAP_SIZE;
    if heap_end > RAM_END_PMA {
        panic!("out of memory");
    }
    crate::heap_init(heap_start, HEAP_SIZE);

    free_phys_pages(
        PhysAddr::new(heap_end),
        (RAM_END_PMA - heap_end) / PAGE_SIZE,
    );

    // Let supervisor code reach user pages once they are validated.
    crate::arch::allow_user_access();

    MEMORY_INITIALIZED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::conf::{PAGE_SIZE, UMEM_START_VMA};
    use crate::error::Error;
    use std::alloc::Layout;
    use std::sync::{Mutex, MutexGuard, Once, OnceLock};

    /// Tests below share the mock satp register, the global page pool,
    /// and the main-tag cell, so they run one at a time.
    fn serialize() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed the global page pool once with a page-aligned arena that
    /// stands in for physical RAM.
    fn seed_ram() {
        static SEED: Once = Once::new();
        SEED.call_once(|| {
            const ARENA_PAGES: usize = 4096; // 16 MiB
            let layout = Layout::from_size_align(ARENA_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
            let base = unsafe { std::alloc::alloc(layout) };
            assert!(!base.is_null());
            unsafe {
                free_phys_pages(PhysAddr::new(base as usize), ARENA_PAGES);
            }
        });
    }

    /// A fresh address space made active for the duration of a test.
    ///
    /// The root carries one fake "kernel" mapping: a global gigapage
    /// leaf over the RAM gigarange, standing in for the shared kernel
    /// image mapping. Dropping the space resets it, restores the
    /// previous satp and main tag, and frees the root.
    struct ActiveSpace {
        tag: Mtag,
        prev_satp: u64,
        prev_main: Mtag,
    }

    impl ActiveSpace {
        fn enter() -> Self {
            seed_ram();
            let root = alloc_phys_page();
            unsafe {
                core::ptr::write_bytes(root.as_mut_ptr::<PageTable>(), 0, 1);
                let table = root.as_mut_ptr::<PageTable>();
                *(*table).entry_mut(VirtAddr::new(0x8000_0000).vpn(2)) = Pte::leaf(
                    PhysAddr::new(0x8000_0000),
                    PteFlags::R | PteFlags::X | PteFlags::G,
                );
            }
            let tag = Mtag::new(root, 0);
            let prev_main = main_mtag();
            space::set_main_mtag(tag);
            let prev_satp = arch::swap_satp(tag.raw());
            Self {
                tag,
                prev_satp,
                prev_main,
            }
        }
    }

    impl Drop for ActiveSpace {
        fn drop(&mut self) {
            reset_active_mspace();
            arch::write_satp(self.prev_satp);
            space::set_main_mtag(self.prev_main);
            unsafe {
                free_phys_page(self.tag.root());
            }
        }
    }

    fn uva(offset: usize) -> VirtAddr {
        VirtAddr::new(UMEM_START_VMA + offset)
    }

    fn phys_byte(pp: PhysAddr, offset: usize) -> u8 {
        unsafe { *((pp.as_usize() + offset) as *const u8) }
    }

    fn set_phys_bytes(pp: PhysAddr, offset: usize, bytes: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (pp.as_usize() + offset) as *mut u8,
                bytes.len(),
            );
        }
    }

    const RWU: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::R.bits() | PteFlags::W.bits() | PteFlags::U.bits(),
    );
    const RU: PteFlags =
        PteFlags::from_bits_truncate(PteFlags::R.bits() | PteFlags::U.bits());

    #[test]
    fn map_then_validate_subset_of_flags() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let pp = alloc_phys_page();
        map_page(uva(0), pp, RWU).unwrap();

        assert!(validate_vptr(uva(0), 1, PteFlags::R).is_ok());
        assert!(validate_vptr(uva(0), 1, RU).is_ok());
        assert!(validate_vptr(uva(0), 1, RWU).is_ok());
        // Anything exceeding the mapped flags must fail.
        assert_eq!(
            validate_vptr(uva(0), 1, PteFlags::X),
            Err(Error::BadAddress)
        );
        assert_eq!(
            validate_vptr(uva(0), 1, RWU | PteFlags::X),
            Err(Error::BadAddress)
        );
    }

    #[test]
    fn map_page_refuses_remap_without_unmap() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let pp = alloc_phys_page();
        map_page(uva(0), pp, RWU).unwrap();
        let before = free_phys_page_count();
        let other = alloc_phys_page();
        assert_eq!(map_page(uva(0), other, RWU), Err(Error::Busy));
        unsafe { free_phys_page(other) };
        // The refused remap must not have consumed anything.
        assert_eq!(free_phys_page_count(), before);
    }

    #[test]
    fn map_page_rejects_kernel_addresses() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let pp = alloc_phys_page();
        assert_eq!(
            map_page(VirtAddr::new(0x8000_0000), pp, RWU),
            Err(Error::Invalid)
        );
        assert_eq!(map_page(VirtAddr::new(0), pp, RWU), Err(Error::Invalid));
        // Unaligned user address.
        assert_eq!(map_page(uva(0x10), pp, RWU), Err(Error::Invalid));
        unsafe { free_phys_page(pp) };
    }

    #[test]
    fn alloc_free_leaves_pool_balanced() {
        let _guard = serialize();
        seed_ram();

        let n = free_phys_page_count();
        let a = alloc_phys_pages(3);
        assert_eq!(free_phys_page_count(), n - 3);
        let b = alloc_phys_pages(2);
        assert_eq!(free_phys_page_count(), n - 5);
        unsafe {
            free_phys_pages(a, 3);
            free_phys_pages(b, 2);
        }
        assert_eq!(free_phys_page_count(), n);
    }

    #[test]
    fn fault_outside_user_window_not_handled() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let n = free_phys_page_count();
        assert!(!handle_umode_page_fault(VirtAddr::new(0x8000_0000)));
        assert!(!handle_umode_page_fault(VirtAddr::new(0x1_0000_0000)));
        assert!(!handle_umode_page_fault(VirtAddr::new(0)));
        // No page may have been allocated as a side effect.
        assert_eq!(free_phys_page_count(), n);
    }

    #[test]
    fn fault_allocates_exactly_once() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let va = uva(0x7000);
        let before = free_phys_page_count();
        assert!(handle_umode_page_fault(va));
        // One leaf page plus the two intermediate tables built on the way.
        assert_eq!(free_phys_page_count(), before - 3);

        // The page is mapped read/write/user and zero-filled.
        assert!(validate_vptr(va.page_round_down(), PAGE_SIZE, RWU).is_ok());
        match unsafe { pte::walk(space::active_root(), va) } {
            pte::Walk::Leaf { level, pte } => {
                assert_eq!(level, 0);
                assert_eq!(phys_byte(pte.phys_addr(), 0), 0);
                assert_eq!(phys_byte(pte.phys_addr(), PAGE_SIZE - 1), 0);
            }
            other => panic!("expected leaf, got {:?}", other),
        }

        // A second fault on the now-mapped address is a violation, and
        // allocates nothing.
        let mapped = free_phys_page_count();
        assert!(!handle_umode_page_fault(va));
        assert_eq!(free_phys_page_count(), mapped);
    }

    #[test]
    fn reset_returns_user_pages_and_keeps_globals() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let n = free_phys_page_count();
        let pa = alloc_phys_page();
        map_page(uva(0), pa, RWU).unwrap();
        let pb = alloc_phys_page();
        map_page(uva(PAGE_SIZE), pb, RU).unwrap();
        assert!(handle_umode_page_fault(uva(0x40_0000)));
        assert!(free_phys_page_count() < n);

        reset_active_mspace();

        // Every page and table the user mappings took came back.
        assert_eq!(free_phys_page_count(), n);
        // The fake kernel mapping (global gigapage) is intact.
        match unsafe { pte::walk(space::active_root(), VirtAddr::new(0x8000_0000)) } {
            pte::Walk::Leaf { level, pte } => {
                assert_eq!(level, 2);
                assert!(pte.is_global());
                assert!(pte.covers(PteFlags::R | PteFlags::X));
            }
            other => panic!("kernel mapping lost: {:?}", other),
        }
        // And the user mappings are gone.
        assert_eq!(
            validate_vptr(uva(0), 1, PteFlags::R),
            Err(Error::BadAddress)
        );
    }

    #[test]
    fn clone_deep_copies_user_pages_and_shares_globals() {
        let _guard = serialize();
        let space_guard = ActiveSpace::enter();

        let pp = alloc_phys_page();
        set_phys_bytes(pp, 0, b"parent data");
        map_page(uva(0), pp, RWU).unwrap();

        let before_clone = free_phys_page_count();
        let child = clone_active_mspace();
        // Child root + one table chain (pt1, pt0) + one copied page.
        assert_eq!(free_phys_page_count(), before_clone - 4);

        let parent = switch_mspace(child);
        assert_eq!(parent, space_guard.tag);

        // The child sees the same bytes through its own storage.
        let child_pte = match unsafe { pte::walk(space::active_root(), uva(0)) } {
            pte::Walk::Leaf { level: 0, pte } => pte,
            other => panic!("clone lost the mapping: {:?}", other),
        };
        assert_ne!(child_pte.phys_addr(), pp);
        assert_eq!(phys_byte(child_pte.phys_addr(), 0), b'p');

        // Mutating the parent's page must not show through.
        set_phys_bytes(pp, 0, b"X");
        assert_eq!(phys_byte(child_pte.phys_addr(), 0), b'p');

        // The global kernel entry is shared by reference.
        let child_kernel = unsafe {
            (*space::active_root()).entry(VirtAddr::new(0x8000_0000).vpn(2))
        };
        let parent_kernel = unsafe {
            (*parent.root().as_mut_ptr::<PageTable>())
                .entry(VirtAddr::new(0x8000_0000).vpn(2))
        };
        assert_eq!(child_kernel.raw(), parent_kernel.raw());

        // Discarding the child gives every cloned page back and lands us
        // on the main (here: parent) space.
        let discarded = discard_active_mspace();
        assert_eq!(discarded, child);
        assert_eq!(active_mspace(), space_guard.tag);
        assert_eq!(free_phys_page_count(), before_clone);
    }

    #[test]
    fn set_range_flags_narrows_permissions() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let va = uva(0);
        alloc_and_map_range(va, 3 * PAGE_SIZE, RWU).unwrap();
        assert!(validate_vptr(va, 3 * PAGE_SIZE, PteFlags::W).is_ok());

        set_range_flags(va, 3 * PAGE_SIZE, RU);

        assert_eq!(
            validate_vptr(va, 3 * PAGE_SIZE, PteFlags::W),
            Err(Error::BadAddress)
        );
        assert!(validate_vptr(va, 3 * PAGE_SIZE, PteFlags::R).is_ok());
    }

    #[test]
    #[should_panic(expected = "set_range_flags")]
    fn set_range_flags_on_unmapped_range_is_fatal() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();
        set_range_flags(uva(0x9_0000), PAGE_SIZE, RU);
    }

    #[test]
    fn map_range_backs_pages_contiguously() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let va = uva(0);
        alloc_and_map_range(va, 2 * PAGE_SIZE + 1, RWU).unwrap();
        let first = match unsafe { pte::walk(space::active_root(), va) } {
            pte::Walk::Leaf { pte, .. } => pte.phys_addr(),
            other => panic!("unmapped: {:?}", other),
        };
        for i in 1..3 {
            let next = match unsafe { pte::walk(space::active_root(), va.add(i * PAGE_SIZE)) } {
                pte::Walk::Leaf { pte, .. } => pte.phys_addr(),
                other => panic!("unmapped: {:?}", other),
            };
            assert_eq!(next.as_usize(), first.as_usize() + i * PAGE_SIZE);
        }
    }

    #[test]
    fn unmap_skips_holes_and_globals() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        // Entirely unmapped sub-range: a silent no-op.
        let n = free_phys_page_count();
        unmap_and_free_range(uva(0x20_0000), 4 * PAGE_SIZE);
        assert_eq!(free_phys_page_count(), n);

        // A global leaf inside the range survives untouched.
        let pp = alloc_phys_page();
        map_page(uva(0), pp, RU | PteFlags::G).unwrap();
        let before = free_phys_page_count();
        unmap_and_free_range(uva(0), 2 * PAGE_SIZE);
        assert_eq!(free_phys_page_count(), before);
        assert!(validate_vptr(uva(0), 1, PteFlags::R).is_ok());
    }

    #[test]
    fn unmap_returns_frames() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let va = uva(0);
        alloc_and_map_range(va, 3 * PAGE_SIZE, RWU).unwrap();
        let mapped = free_phys_page_count();
        unmap_and_free_range(va, 3 * PAGE_SIZE);
        assert_eq!(free_phys_page_count(), mapped + 3);
        assert_eq!(validate_vptr(va, 1, PteFlags::R), Err(Error::BadAddress));
    }

    #[test]
    fn validate_rejects_wraps_and_holes() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        // Wrapping past the address width.
        assert_eq!(
            validate_vptr(VirtAddr::new(usize::MAX - 10), 100, PteFlags::R),
            Err(Error::BadAddress)
        );
        // Ill-formed base address.
        assert_eq!(
            validate_vptr(VirtAddr::new(0x40_0000_0000), 1, PteFlags::R),
            Err(Error::BadAddress)
        );
        // Range touching an unmapped page.
        let pp = alloc_phys_page();
        map_page(uva(0), pp, RU).unwrap();
        assert!(validate_vptr(uva(0), PAGE_SIZE, PteFlags::R).is_ok());
        assert_eq!(
            validate_vptr(uva(0), PAGE_SIZE + 1, PteFlags::R),
            Err(Error::BadAddress)
        );
        // Zero length is trivially valid, mapped or not.
        assert!(validate_vptr(uva(0x50_0000), 0, RWU).is_ok());
    }

    #[test]
    fn validate_vstr_crosses_pages_and_stops_at_nul() {
        let _guard = serialize();
        let _space = ActiveSpace::enter();

        let pa = alloc_phys_page();
        let pb = alloc_phys_page();
        map_page(uva(0), pa, RU).unwrap();
        map_page(uva(PAGE_SIZE), pb, RU).unwrap();

        // "hello world\0" straddling the page boundary.
        set_phys_bytes(pa, PAGE_SIZE - 6, b"hello ");
        set_phys_bytes(pb, 0, b"world\0");
        assert_eq!(
            validate_vstr(uva(PAGE_SIZE - 6), RU),
            Ok(11)
        );

        // A NUL on the last byte of a page: the next (unmapped) page must
        // never be looked at.
        set_phys_bytes(pb, PAGE_SIZE - 1, b"\0");
        let tail = uva(2 * PAGE_SIZE - 1);
        assert_eq!(validate_vstr(tail, RU), Ok(0));

        // No NUL before an unmapped page fails cleanly.
        let mut fill = [b'y'; 4096];
        fill[4095] = b'z';
        set_phys_bytes(pb, 0, &fill);
        assert_eq!(validate_vstr(uva(PAGE_SIZE), RU), Err(Error::BadAddress));

        // Insufficient access rights fail before any byte is read.
        assert_eq!(
            validate_vstr(uva(0), PteFlags::R | PteFlags::W | PteFlags::U),
            Err(Error::BadAddress)
        );
    }
}
