//! # Threads
//!
//! Cooperative kernel threads. Nothing preempts a thread; it runs until
//! it yields, waits on a condition, or exits. That discipline keeps the
//! kernel's critical sections simple — with interrupts disabled there is
//! exactly one flow of control — at the price of requiring every
//! long-running loop to yield on its own.
//!
//! A context switch saves only the callee-saved registers (`ra`, `sp`,
//! `s0..s11`); everything else is dead across the `__switch` call by the
//! C calling convention. New threads are launched through a small
//! assembly shim that unpacks the entry function and argument from the
//! first two saved s-registers.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::string::ToString;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::conf::{KSTACK_SIZE, NTHR};
use crate::error::{Error, Result};
use crate::sync::InterruptSafeLock;

pub type Tid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Waiting,
    Exited,
}

/// Callee-saved register file, the only state a cooperative switch needs.
#[repr(C)]
struct Context {
    ra: usize,
    sp: usize,
    s: [usize; 12],
}

impl Context {
    const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

struct Thread {
    name: String,
    state: ThreadState,
    ctx: Context,
    /// None for the boot thread, which runs on the boot stack.
    stack: Option<Box<[u8]>>,
    exit_code: i64,
    /// Owning process, if this thread carries one.
    process: Option<usize>,
}

struct ThreadTable {
    threads: [Option<Box<Thread>>; NTHR],
    ready: VecDeque<Tid>,
}

impl ThreadTable {
    const fn new() -> Self {
        const NONE: Option<Box<Thread>> = None;
        Self {
            threads: [NONE; NTHR],
            ready: VecDeque::new(),
        }
    }

    fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(tid)?.as_deref()
    }

    fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(tid)?.as_deref_mut()
    }
}

static THREADS: InterruptSafeLock<ThreadTable> =
    InterruptSafeLock::new(ThreadTable::new(), "thread-table");

static CURRENT: AtomicUsize = AtomicUsize::new(0);

/// Broadcast on every thread exit; joiners re-check their child.
static THREAD_EXIT: Condition = Condition::new("thread-exit");

/// Adopt the boot flow of control as thread 0.
pub fn init() {
    let mut table = THREADS.lock();
    assert!(table.threads[0].is_none(), "thread manager already initialized");
    table.threads[0] = Some(Box::new(Thread {
        name: "main".to_string(),
        state: ThreadState::Running,
        ctx: Context::zeroed(),
        stack: None,
        exit_code: 0,
        process: None,
    }));
    CURRENT.store(0, Ordering::SeqCst);
}

/// Tid of the running thread.
pub fn current() -> Tid {
    CURRENT.load(Ordering::SeqCst)
}

/// Create a ready-to-run thread that will call `entry(arg)` on its own
/// stack.
pub fn spawn(name: &str, entry: extern "C" fn(usize), arg: usize) -> Result<Tid> {
    let mut table = THREADS.lock();

    let tid = table
        .threads
        .iter()
        .position(|slot| slot.is_none())
        .ok_or(Error::NoMem)?;

    // Built on the heap; a stack-local array this size would not fit on
    // the spawning thread's own stack.
    let stack = alloc::vec![0u8; KSTACK_SIZE].into_boxed_slice();
    let stack_top = (stack.as_ptr() as usize + KSTACK_SIZE) & !0xf;

    let mut ctx = Context::zeroed();
    ctx.ra = __thread_start as usize;
    ctx.sp = stack_top;
    ctx.s[0] = entry as usize;
    ctx.s[1] = arg;

    table.threads[tid] = Some(Box::new(Thread {
        name: name.to_string(),
        state: ThreadState::Ready,
        ctx,
        stack: Some(stack),
        exit_code: 0,
        process: None,
    }));
    table.ready.push_back(tid);
    Ok(tid)
}

/// Give up the processor; the thread stays runnable and resumes when the
/// scheduler comes back around to it.
pub fn yield_now() {
    reschedule(ThreadState::Ready);
}

/// Terminate the running thread. Its slot is reclaimed by `join`.
pub fn exit(code: i64) -> ! {
    {
        let mut table = THREADS.lock();
        let tid = current();
        if let Some(thread) = table.get_mut(tid) {
            thread.state = ThreadState::Exited;
            thread.exit_code = code;
        }
    }
    THREAD_EXIT.broadcast();
    reschedule(ThreadState::Exited);
    unreachable!("exited thread rescheduled");
}

/// Wait for `tid` to exit, reclaim it, and return its exit code.
pub fn join(tid: Tid) -> Result<i64> {
    loop {
        {
            let mut table = THREADS.lock();
            match table.get(tid) {
                None => return Err(Error::NotFound),
                Some(thread) if thread.state == ThreadState::Exited => {
                    let code = thread.exit_code;
                    // The exited thread switched away for good; its
                    // stack is dead and the slot can be reused.
                    table.threads[tid] = None;
                    return Ok(code);
                }
                Some(_) => {}
            }
        }
        THREAD_EXIT.wait();
    }
}

/// Record the process a thread belongs to.
pub fn set_process(tid: Tid, pid: Option<usize>) {
    let mut table = THREADS.lock();
    if let Some(thread) = table.get_mut(tid) {
        thread.process = pid;
    }
}

/// Process of the running thread.
pub fn current_process() -> Option<usize> {
    let table = THREADS.lock();
    table.get(current()).and_then(|thread| thread.process)
}

/// Name of the running thread (diagnostics).
pub fn current_name() -> String {
    let table = THREADS.lock();
    table
        .get(current())
        .map(|thread| thread.name.clone())
        .unwrap_or_else(|| "?".to_string())
}

/// Park the current thread in `new_state` and run the next ready one.
fn reschedule(new_state: ThreadState) {
    let (old_ctx, new_ctx) = {
        let mut table = THREADS.lock();
        let cur = current();

        if let Some(thread) = table.get_mut(cur) {
            if thread.state == ThreadState::Running {
                thread.state = new_state;
            }
        }
        if new_state == ThreadState::Ready {
            table.ready.push_back(cur);
        }

        let next = loop {
            match table.ready.pop_front() {
                Some(tid) => {
                    // Skip stale entries (exited or re-woken threads can
                    // appear twice).
                    if table.get(tid).map(|t| t.state) == Some(ThreadState::Ready) {
                        break tid;
                    }
                }
                None => {
                    if new_state == ThreadState::Ready {
                        // Nothing else to run; keep going ourselves.
                        if let Some(thread) = table.get_mut(cur) {
                            thread.state = ThreadState::Running;
                        }
                        return;
                    }
                    panic!("no runnable threads");
                }
            }
        };

        if next == cur {
            if let Some(thread) = table.get_mut(cur) {
                thread.state = ThreadState::Running;
            }
            return;
        }

        if let Some(thread) = table.get_mut(next) {
            thread.state = ThreadState::Running;
        }
        CURRENT.store(next, Ordering::SeqCst);

        // Raw context pointers survive the guard: threads are boxed, so
        // the table can grow or shrink without moving them.
        let old = table.get_mut(cur).map(|t| &mut t.ctx as *mut Context);
        let new = match table.get_mut(next) {
            Some(t) => &mut t.ctx as *mut Context,
            None => panic!("scheduled a dead thread"),
        };
        (old, new)
    };

    match old_ctx {
        Some(old) => unsafe { __switch(old, new_ctx) },
        // Current thread vanished (reclaimed exit); no state to save.
        None => unsafe { __switch(core::ptr::addr_of_mut!(DISCARD_CTX), new_ctx) },
    }
}

/// Scratch context for switches whose outgoing thread is already gone.
static mut DISCARD_CTX: Context = Context::zeroed();

/// First Rust code a new thread runs.
#[no_mangle]
extern "C" fn thread_bootstrap(entry: extern "C" fn(usize), arg: usize) -> ! {
    entry(arg);
    exit(0);
}

#[cfg(target_arch = "riscv64")]
extern "C" {
    fn __switch(old: *mut Context, new: *const Context);
    fn __thread_start();
}

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text
    .globl __switch
    .align 2
__switch:
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret

    .globl __thread_start
    .align 2
__thread_start:
    mv a0, s0
    mv a1, s1
    j thread_bootstrap
"#
);

#[cfg(not(target_arch = "riscv64"))]
#[allow(non_snake_case)]
unsafe fn __switch(_old: *mut Context, _new: *const Context) {
    unreachable!("context switching is target-specific");
}

#[cfg(not(target_arch = "riscv64"))]
#[allow(non_snake_case)]
fn __thread_start() {
    unreachable!("thread launch is target-specific");
}

/// A condition variable in the original's shape: wait parks the calling
/// thread, broadcast makes every waiter runnable again. There is no
/// signal-one — broadcast-and-recheck keeps lost-wakeup reasoning out of
/// the picture on a cooperative kernel.
pub struct Condition {
    waiters: InterruptSafeLock<VecDeque<Tid>>,
}

impl Condition {
    pub const fn new(_name: &'static str) -> Self {
        Self {
            waiters: InterruptSafeLock::new(VecDeque::new(), "condition"),
        }
    }

    /// Park the calling thread until the next `broadcast`.
    pub fn wait(&self) {
        let tid = current();
        self.waiters.lock().push_back(tid);
        reschedule(ThreadState::Waiting);
    }

    /// Make every waiter runnable.
    pub fn broadcast(&self) {
        let mut woken = VecDeque::new();
        core::mem::swap(&mut *self.waiters.lock(), &mut woken);
        let mut table = THREADS.lock();
        for tid in woken {
            if let Some(thread) = table.get_mut(tid) {
                if thread.state == ThreadState::Waiting {
                    thread.state = ThreadState::Ready;
                    table.ready.push_back(tid);
                }
            }
        }
    }
}
