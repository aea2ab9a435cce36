//! # Processes
//!
//! A process is a thread wearing an address space: a process-table slot
//! owns the memory-space tag, the open-file slots, and the trap frame
//! the user vector spills into. The heavy lifting lives elsewhere —
//! `memory::space` clones and discards address spaces, `elf` fills them
//! — and this module orchestrates.
//!
//! * `exec` resets the active space, loads the image, builds the
//!   argument stack at the top of the user window, and drops to U-mode.
//! * `fork` deep-copies the active space and hands the child a copy of
//!   the parent's trap frame with `a0` forced to 0.
//! * `exit` closes files, discards the space, and retires the thread.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::conf::{NFILE, NPROC, PAGE_SIZE, UMEM_END_VMA};
use crate::error::{Error, Result};
use crate::fs::{self, FsFile};
use crate::memory::{
    alloc_and_map_range, clone_active_mspace, discard_active_mspace, switch_mspace, validate,
    Mtag, PteFlags, VirtAddr,
};
use crate::sync::InterruptSafeLock;
use crate::trap::TrapFrame;
use crate::{elf, println, thread};

// sstatus bits the first user entry needs.
const SSTATUS_SPP: usize = 1 << 8; // previous privilege (clear = U)
const SSTATUS_SPIE: usize = 1 << 5; // interrupts enabled after sret
const SSTATUS_SUM: usize = 1 << 18; // kernel may touch user pages

/// One open-file slot.
#[derive(Clone)]
pub enum FileObject {
    /// The UART console.
    Console,
    /// A file on the root filesystem.
    File(FsFile),
}

pub struct Process {
    pub pid: usize,
    pub tid: thread::Tid,
    pub tag: Mtag,
    pub files: [Option<FileObject>; NFILE],
    /// Spill target for the user trap vector; boxed so its address is
    /// stable for sscratch.
    pub tfr: Box<TrapFrame>,
}

struct ProcessTable {
    procs: [Option<Box<Process>>; NPROC],
}

impl ProcessTable {
    const fn new() -> Self {
        const NONE: Option<Box<Process>> = None;
        Self { procs: [NONE; NPROC] }
    }
}

static PROCS: InterruptSafeLock<ProcessTable> =
    InterruptSafeLock::new(ProcessTable::new(), "process-table");

fn new_files() -> [Option<FileObject>; NFILE] {
    const NONE: Option<FileObject> = None;
    let mut files = [NONE; NFILE];
    // fd 0 and 1: the console.
    files[0] = Some(FileObject::Console);
    files[1] = Some(FileObject::Console);
    files
}

/// Allocate a process-table slot.
fn alloc_process(tid: thread::Tid, tag: Mtag, files: [Option<FileObject>; NFILE]) -> Result<usize> {
    let mut table = PROCS.lock();
    let pid = table
        .procs
        .iter()
        .position(|slot| slot.is_none())
        .ok_or(Error::NoMem)?;
    table.procs[pid] = Some(Box::new(Process {
        pid,
        tid,
        tag,
        files,
        tfr: Box::new(TrapFrame::zeroed()),
    }));
    drop(table);
    thread::set_process(tid, Some(pid));
    Ok(pid)
}

/// Run `f` over the current thread's process.
pub fn with_current<T>(f: impl FnOnce(&mut Process) -> T) -> Result<T> {
    let pid = thread::current_process().ok_or(Error::NotFound)?;
    let mut table = PROCS.lock();
    let proc = table.procs[pid].as_deref_mut().ok_or(Error::NotFound)?;
    Ok(f(proc))
}

/// Spawn the first user process from an executable on the root
/// filesystem. Returns the tid carrying it, for `join`.
pub fn spawn_init(path: &str) -> Result<thread::Tid> {
    // The path rides to the new thread through a leaked box; the thread
    // reclaims it immediately.
    let arg = Box::into_raw(Box::new(String::from(path))) as usize;
    thread::spawn(path, init_process_entry, arg)
}

extern "C" fn init_process_entry(arg: usize) {
    let path = *unsafe { Box::from_raw(arg as *mut String) };

    // A fresh space cloned from the kernel's: global mappings only.
    let tag = clone_active_mspace();
    switch_mspace(tag);

    let pid = match alloc_process(thread::current(), tag, new_files()) {
        Ok(pid) => pid,
        Err(err) => {
            println!("spawn {}: {}", path, err);
            discard_active_mspace();
            return;
        }
    };

    let result = fs::root()
        .and_then(|root| root.open(&path))
        .and_then(|file| exec(&file, &[&path]));
    // exec only returns on failure.
    if let Err(err) = result {
        println!("exec {}: {}", path, err);
        free_process(pid);
        discard_active_mspace();
    }
}

/// Replace the current process image with `file` and enter it, passing
/// `args` on the initial stack. On success this does not return.
pub fn exec(file: &FsFile, args: &[&str]) -> Result<()> {
    // Tear the old image out of the active space (globals survive) and
    // lay down the new one.
    crate::memory::reset_active_mspace();
    let entry = elf::load(file)?;

    // One stack page at the very top of the user window.
    let stack_page = VirtAddr::new(UMEM_END_VMA - PAGE_SIZE);
    alloc_and_map_range(
        stack_page,
        PAGE_SIZE,
        PteFlags::R | PteFlags::W | PteFlags::U,
    )?;
    let (sp, argc, argv) = build_stack(stack_page, args)?;

    with_current(|proc| {
        let tfr = proc.tfr.as_mut();
        *tfr = TrapFrame::zeroed();
        tfr.sepc = entry.as_usize();
        tfr.set_sp(sp);
        tfr.x[10] = argc; // a0
        tfr.x[11] = argv; // a1
        tfr.sstatus =
            (crate::arch::read_sstatus() & !SSTATUS_SPP) | SSTATUS_SPIE | SSTATUS_SUM;
        tfr as *mut TrapFrame
    })
    .map(|tfr| unsafe { enter_user(tfr) })
}

/// Build the initial user stack: argument strings at the top, then the
/// NULL-terminated pointer array, 16-byte aligned per the RISC-V ABI.
/// Returns (sp, argc, user argv pointer).
fn build_stack(stack_page: VirtAddr, args: &[&str]) -> Result<(usize, usize, usize)> {
    let total_strings: usize = args.iter().map(|arg| arg.len() + 1).sum();
    let ptr_bytes = (args.len() + 1) * core::mem::size_of::<usize>();
    let stksz = (total_strings + ptr_bytes + 15) & !15;
    if stksz > PAGE_SIZE {
        return Err(Error::NoMem);
    }

    let top = stack_page.as_usize() + PAGE_SIZE;
    let base = top - stksz;
    let mut string_at = base + ptr_bytes;
    let mut pointers = Vec::with_capacity(args.len() + 1);
    unsafe {
        for arg in args {
            core::ptr::copy_nonoverlapping(arg.as_ptr(), string_at as *mut u8, arg.len());
            *((string_at + arg.len()) as *mut u8) = 0;
            pointers.push(string_at);
            string_at += arg.len() + 1;
        }
        pointers.push(0);
        core::ptr::copy_nonoverlapping(
            pointers.as_ptr(),
            base as *mut usize,
            pointers.len(),
        );
    }
    Ok((base, args.len(), base))
}

/// Fork the current process. The child gets a deep copy of the address
/// space and of the trap frame, with `a0` = 0; the parent gets the
/// child's tid, the handle `wait` takes.
pub fn fork(tfr: &TrapFrame) -> Result<thread::Tid> {
    let files = with_current(|proc| proc.files.clone())?;
    let child_tag = clone_active_mspace();

    let child_tid = match thread::spawn("forked", forked_child_entry, 0) {
        Ok(tid) => tid,
        Err(err) => {
            // Unwind the clone: activate it, tear it down.
            let parent = switch_mspace(child_tag);
            discard_active_mspace();
            switch_mspace(parent);
            return Err(err);
        }
    };

    let pid = alloc_process(child_tid, child_tag, files)?;
    let mut child_tfr = tfr.clone();
    child_tfr.set_return(0);
    with_process(pid, |proc| *proc.tfr = child_tfr)?;
    Ok(child_tid)
}

fn with_process<T>(pid: usize, f: impl FnOnce(&mut Process) -> T) -> Result<T> {
    let mut table = PROCS.lock();
    let proc = table.procs[pid].as_deref_mut().ok_or(Error::NotFound)?;
    Ok(f(proc))
}

extern "C" fn forked_child_entry(_arg: usize) {
    // The parent has filled in our process slot by the time we run:
    // claim the cloned space and drop into user mode where the parent
    // trapped.
    let tfr = match with_current(|proc| {
        switch_mspace(proc.tag);
        proc.tfr.as_mut() as *mut TrapFrame
    }) {
        Ok(tfr) => tfr,
        Err(_) => return,
    };
    unsafe { enter_user(tfr) }
}

/// Wait for the process carried by `tid` to exit; returns its code.
pub fn wait(tid: thread::Tid) -> Result<i64> {
    thread::join(tid)
}

fn free_process(pid: usize) {
    let mut table = PROCS.lock();
    table.procs[pid] = None;
    drop(table);
    thread::set_process(thread::current(), None);
}

/// Terminate the current process: close its files, discard its address
/// space, retire its thread.
pub fn exit_current(code: i64) -> ! {
    if let Ok(pid) = with_current(|proc| proc.pid) {
        // Dropping the slot closes every file object.
        free_process(pid);
    }
    discard_active_mspace();
    thread::exit(code);
}

/// A user pointer argument, validated before use.
pub fn user_str(vs: usize, max: usize) -> Result<String> {
    let len = validate::validate_vstr(VirtAddr::new(vs), PteFlags::R | PteFlags::U)?;
    if len > max {
        return Err(Error::Invalid);
    }
    let mut bytes = alloc::vec![0u8; len];
    validate::copy_from_user(&mut bytes, VirtAddr::new(vs))?;
    String::from_utf8(bytes).map_err(|_| Error::Invalid)
}

#[cfg(target_arch = "riscv64")]
unsafe fn enter_user(tfr: *mut TrapFrame) -> ! {
    extern "C" {
        fn __enter_user(tfr: *mut TrapFrame) -> !;
    }
    __enter_user(tfr)
}

#[cfg(not(target_arch = "riscv64"))]
unsafe fn enter_user(_tfr: *mut TrapFrame) -> ! {
    unreachable!("user-mode entry is target-specific");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_table_starts_with_console_stdio() {
        let files = new_files();
        assert!(matches!(files[0], Some(FileObject::Console)));
        assert!(matches!(files[1], Some(FileObject::Console)));
        assert!(files[2..].iter().all(|slot| slot.is_none()));
    }

    #[test]
    fn build_stack_lays_out_argv() {
        // A page-aligned buffer standing in for the mapped stack page.
        let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let page = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        assert_ne!(page, 0);

        let (sp, argc, argv) = build_stack(VirtAddr::new(page), &["init", "-x"]).unwrap();
        assert_eq!(argc, 2);
        assert_eq!(argv, sp);
        assert_eq!(sp % 16, 0);

        unsafe {
            let ptrs = core::slice::from_raw_parts(argv as *const usize, 3);
            assert_eq!(ptrs[2], 0);
            let arg0 = core::ffi::CStr::from_ptr(ptrs[0] as *const core::ffi::c_char);
            let arg1 = core::ffi::CStr::from_ptr(ptrs[1] as *const core::ffi::c_char);
            assert_eq!(arg0.to_bytes(), b"init");
            assert_eq!(arg1.to_bytes(), b"-x");
        }
    }

    #[test]
    fn build_stack_refuses_oversized_argv() {
        let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let page = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        let big = "x".repeat(PAGE_SIZE);
        assert_eq!(
            build_stack(VirtAddr::new(page), &[&big]).err(),
            Some(Error::NoMem)
        );
    }
}
