//! # Physical Page Allocator
//!
//! Free physical pages live in a singly linked list of *chunks*, each a
//! run of consecutive free pages. The chunk header is written into the
//! first bytes of the region it describes — the free memory carries its
//! own bookkeeping, there is no side table. Initially all free pages form
//! one large chunk; allocation breaks chunks up, freeing merges them back
//! with their physical neighbors.
//!
//! Invariant: a header is only meaningful while its region is on the
//! list. The moment a region is handed out, its first bytes belong to the
//! caller and the header must never be touched again.
//!
//! The list is shared by every thread in the kernel and is guarded by an
//! `InterruptSafeLock`; nothing reads or writes it outside the lock.

use core::ptr::NonNull;

use super::addr::PhysAddr;
use crate::conf::PAGE_SIZE;
use crate::sync::InterruptSafeLock;

/// Header of a free chunk, embedded at the start of the chunk itself.
#[repr(C)]
struct PageChunk {
    next: Option<NonNull<PageChunk>>,
    /// Number of free pages in this chunk, this header's page included.
    pagecnt: usize,
}

/// The free-chunk list.
pub struct ChunkList {
    head: Option<NonNull<PageChunk>>,
}

unsafe impl Send for ChunkList {}

impl ChunkList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Best-fit allocation: take `cnt` pages from the smallest chunk that
    /// can satisfy the request, so large runs survive for large callers.
    ///
    /// A larger chunk shrinks in place — the header moves to the start of
    /// the remainder and the predecessor is relinked. An exact fit is
    /// unlinked entirely.
    pub fn alloc(&mut self, cnt: usize) -> Option<PhysAddr> {
        if cnt == 0 {
            return None;
        }
        unsafe {
            // Find the link pointing at the best chunk, so unlinking and
            // relinking need no second traversal.
            let mut link: *mut Option<NonNull<PageChunk>> = &mut self.head;
            let mut best: Option<*mut Option<NonNull<PageChunk>>> = None;
            let mut best_cnt = usize::MAX;

            while let Some(chunk) = *link {
                let pagecnt = chunk.as_ref().pagecnt;
                if pagecnt >= cnt && pagecnt < best_cnt {
                    best = Some(link);
                    best_cnt = pagecnt;
                }
                link = &mut (*chunk.as_ptr()).next;
            }

            let link = best?;
            let chunk = (*link)?;
            let start = chunk.as_ptr() as usize;
            let next = chunk.as_ref().next;

            if best_cnt == cnt {
                *link = next;
            } else {
                // Shrink in place: the remainder begins `cnt` pages in
                // and inherits the rest of the run.
                let rest = (start + cnt * PAGE_SIZE) as *mut PageChunk;
                (*rest).next = next;
                (*rest).pagecnt = best_cnt - cnt;
                *link = Some(NonNull::new_unchecked(rest));
            }

            Some(PhysAddr::new(start))
        }
    }

    /// Return `[pp, pp + cnt pages)` to the list, merging with any chunk
    /// that is physically adjacent on either side so the list converges
    /// back toward large runs.
    ///
    /// # Safety
    ///
    /// The region must have come from `alloc` (or be the initial pool),
    /// must not already be on the list, and must not be referenced by any
    /// live mapping.
    pub unsafe fn free(&mut self, pp: PhysAddr, cnt: usize) {
        if cnt == 0 {
            return;
        }
        let mut start = pp.as_usize();
        let mut pages = cnt;

        // Absorb physical neighbors. At most two merges are possible
        // (one on each side), but a merge changes our bounds, so rescan
        // until nothing adjacent remains.
        loop {
            let mut merged = false;
            let mut link: *mut Option<NonNull<PageChunk>> = &mut self.head;
            while let Some(chunk) = *link {
                let caddr = chunk.as_ptr() as usize;
                let cpages = chunk.as_ref().pagecnt;
                if caddr + cpages * PAGE_SIZE == start || start + pages * PAGE_SIZE == caddr {
                    *link = chunk.as_ref().next;
                    start = start.min(caddr);
                    pages += cpages;
                    merged = true;
                    break;
                }
                link = &mut (*chunk.as_ptr()).next;
            }
            if !merged {
                break;
            }
        }

        let header = start as *mut PageChunk;
        (*header).next = self.head;
        (*header).pagecnt = pages;
        self.head = Some(NonNull::new_unchecked(header));
    }

    /// Total free pages on the list. Bookkeeping and tests only — the
    /// allocator itself never consults this.
    pub fn total_pages(&self) -> usize {
        let mut total = 0;
        let mut cur = self.head;
        while let Some(chunk) = cur {
            unsafe {
                total += chunk.as_ref().pagecnt;
                cur = chunk.as_ref().next;
            }
        }
        total
    }
}

/// The kernel's one free-page list.
static FREE_PAGES: InterruptSafeLock<ChunkList> =
    InterruptSafeLock::new(ChunkList::new(), "free-pages");

/// Allocate `cnt` consecutive physical pages.
///
/// Exhaustion is fatal: with no paging to disk there is nothing sensible
/// to do but halt.
pub fn alloc_phys_pages(cnt: usize) -> PhysAddr {
    match FREE_PAGES.lock().alloc(cnt) {
        Some(pp) => pp,
        None => panic!("out of physical pages ({} requested)", cnt),
    }
}

/// Allocate one physical page.
pub fn alloc_phys_page() -> PhysAddr {
    alloc_phys_pages(1)
}

/// Return `cnt` pages starting at `pp` to the pool.
///
/// # Safety
///
/// Same contract as [`ChunkList::free`].
pub unsafe fn free_phys_pages(pp: PhysAddr, cnt: usize) {
    FREE_PAGES.lock().free(pp, cnt);
}

/// Return one page to the pool.
///
/// # Safety
///
/// Same contract as [`ChunkList::free`].
pub unsafe fn free_phys_page(pp: PhysAddr) {
    free_phys_pages(pp, 1);
}

/// Number of free physical pages (diagnostics and tests).
pub fn free_phys_page_count() -> usize {
    FREE_PAGES.lock().total_pages()
}
