//! # System Calls
//!
//! Dispatch for U-mode environment calls: the number rides in `a7`,
//! arguments in `a0`-`a5`, and the result goes back in `a0` as a
//! non-negative value or a negative error code.
//!
//! Every pointer a process hands in is hostile until
//! `validate_vptr`/`validate_vstr` says otherwise; a validation failure
//! becomes a bad-address return to the caller, never a kernel fault.
//! Calls whose substrate this kernel does not carry (pipes, writable
//! files, timers) return `NotSupported`.

use alloc::string::String;

use crate::conf::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::memory::{validate_vptr, PteFlags, VirtAddr};
use crate::process::{self, FileObject};
use crate::trap::TrapFrame;
use crate::{console, fs, print, thread};

pub const SYSCALL_EXIT: usize = 1;
pub const SYSCALL_EXEC: usize = 2;
pub const SYSCALL_FORK: usize = 3;
pub const SYSCALL_WAIT: usize = 4;
pub const SYSCALL_PRINT: usize = 5;
pub const SYSCALL_USLEEP: usize = 6;
pub const SYSCALL_FSCREATE: usize = 7;
pub const SYSCALL_FSDELETE: usize = 8;
pub const SYSCALL_OPEN: usize = 9;
pub const SYSCALL_CLOSE: usize = 10;
pub const SYSCALL_READ: usize = 11;
pub const SYSCALL_WRITE: usize = 12;
pub const SYSCALL_FCNTL: usize = 13;
pub const SYSCALL_PIPE: usize = 14;
pub const SYSCALL_UIODUP: usize = 15;

/// Longest path a process may pass.
const PATH_MAX: usize = 255;

/// Route one environment call. Returns the value for `a0`.
pub fn dispatch(tfr: &mut TrapFrame) -> i64 {
    let result = match tfr.syscall_number() {
        SYSCALL_EXIT => process::exit_current(tfr.arg(0) as i64),
        SYSCALL_EXEC => sysexec(tfr),
        SYSCALL_FORK => sysfork(tfr),
        SYSCALL_WAIT => syswait(tfr.arg(0)),
        SYSCALL_PRINT => sysprint(tfr.arg(0)),
        SYSCALL_OPEN => sysopen(tfr.arg(0), tfr.arg(1)),
        SYSCALL_CLOSE => sysclose(tfr.arg(0)),
        SYSCALL_READ => sysread(tfr.arg(0), tfr.arg(1), tfr.arg(2)),
        SYSCALL_WRITE => syswrite(tfr.arg(0), tfr.arg(1), tfr.arg(2)),
        SYSCALL_USLEEP | SYSCALL_FSCREATE | SYSCALL_FSDELETE | SYSCALL_FCNTL
        | SYSCALL_PIPE | SYSCALL_UIODUP => Err(Error::NotSupported),
        _ => Err(Error::Invalid),
    };
    match result {
        Ok(value) => value,
        Err(err) => err.to_errno(),
    }
}

/// exec(fd, argc, argv): replace this process with the image open on
/// `fd`. Only returns on failure.
fn sysexec(tfr: &mut TrapFrame) -> Result<i64> {
    let fd = tfr.arg(0);
    let argc = tfr.arg(1);
    let argv = tfr.arg(2);

    // Pull the argument vector out of user memory before the image
    // (and with it the strings) is torn down.
    if argc > PAGE_SIZE / core::mem::size_of::<usize>() - 1 {
        return Err(Error::Invalid);
    }
    let mut args: alloc::vec::Vec<String> = alloc::vec::Vec::with_capacity(argc);
    if argc > 0 {
        validate_vptr(
            VirtAddr::new(argv),
            (argc + 1) * core::mem::size_of::<usize>(),
            PteFlags::U | PteFlags::R,
        )?;
        for i in 0..argc {
            let slot = unsafe { *((argv + i * core::mem::size_of::<usize>()) as *const usize) };
            args.push(process::user_str(slot, PATH_MAX)?);
        }
    }

    let file = process::with_current(|proc| {
        match proc.files.get(fd).and_then(|slot| slot.clone()) {
            Some(FileObject::File(file)) => Ok(file),
            Some(FileObject::Console) | None => Err(Error::Invalid),
        }
    })??;

    let arg_refs: alloc::vec::Vec<&str> = args.iter().map(String::as_str).collect();
    process::exec(&file, &arg_refs)?;
    // exec came back: the image was bad.
    Err(Error::BadFormat)
}

fn sysfork(tfr: &TrapFrame) -> Result<i64> {
    process::fork(tfr).map(|tid| tid as i64)
}

/// wait(tid): join the child thread carrying the process.
fn syswait(tid: usize) -> Result<i64> {
    process::wait(tid)
}

/// print(msg): write a NUL-terminated string to the console.
fn sysprint(msg: usize) -> Result<i64> {
    let text = process::user_str(msg, PAGE_SIZE)?;
    print!("{}", text);
    Ok(0)
}

/// open(fd, path): open `path` from the root filesystem into slot `fd`.
fn sysopen(fd: usize, path: usize) -> Result<i64> {
    let path = process::user_str(path, PATH_MAX)?;
    let file = fs::root()?.open(&path)?;
    process::with_current(|proc| {
        let slot = proc.files.get_mut(fd).ok_or(Error::Invalid)?;
        if slot.is_some() {
            return Err(Error::Busy);
        }
        *slot = Some(FileObject::File(file));
        Ok(fd as i64)
    })?
}

fn sysclose(fd: usize) -> Result<i64> {
    process::with_current(|proc| {
        let slot = proc.files.get_mut(fd).ok_or(Error::Invalid)?;
        if slot.take().is_none() {
            return Err(Error::Invalid);
        }
        Ok(0)
    })?
}

/// read(fd, buf, len): console reads block for one byte; file reads
/// advance the cursor. Transfers are capped at one page per call.
fn sysread(fd: usize, buf: usize, len: usize) -> Result<i64> {
    let len = len.min(PAGE_SIZE);
    if len == 0 {
        return Ok(0);
    }
    validate_vptr(VirtAddr::new(buf), len, PteFlags::U | PteFlags::W)?;

    let object = process::with_current(|proc| {
        proc.files.get(fd).and_then(|slot| slot.clone()).ok_or(Error::Invalid)
    })??;

    match object {
        FileObject::Console => {
            let byte = console::read_byte();
            unsafe { *(buf as *mut u8) = byte };
            Ok(1)
        }
        FileObject::File(file) => {
            let dst = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len) };
            let mut file = file;
            let n = file.read(dst)?;
            // Write the moved cursor back to the process's slot.
            let pos = file.pos();
            process::with_current(|proc| {
                if let Some(Some(FileObject::File(f))) = proc.files.get_mut(fd).map(|s| s.as_mut())
                {
                    let _ = f.seek(pos);
                }
            })?;
            Ok(n as i64)
        }
    }
}

/// write(fd, buf, len): console only — the filesystem is read-only.
fn syswrite(fd: usize, buf: usize, len: usize) -> Result<i64> {
    let len = len.min(PAGE_SIZE);
    if len == 0 {
        return Ok(0);
    }
    validate_vptr(VirtAddr::new(buf), len, PteFlags::U | PteFlags::R)?;

    let object = process::with_current(|proc| {
        proc.files.get(fd).and_then(|slot| slot.clone()).ok_or(Error::Invalid)
    })??;

    match object {
        FileObject::Console => {
            for i in 0..len {
                let byte = unsafe { *((buf + i) as *const u8) };
                console::write_byte(byte);
            }
            // Let other threads breathe during long console writes.
            thread::yield_now();
            Ok(len as i64)
        }
        FileObject::File(_) => Err(Error::NotSupported),
    }
}
