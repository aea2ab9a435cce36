//! # Trap Handling
//!
//! One trap frame per process, xv6-style: while a process runs in
//! U-mode, `sscratch` points at its trap frame. The user vector spills
//! every register there, picks up the kernel stack pointer stashed in
//! the frame, and calls into [`trap_handler`]; the return path restores
//! the frame and `sret`s. Traps taken while already in S-mode are fatal
//! — this kernel runs its own code with interrupts disabled except for
//! brief, trap-free windows.
//!
//! Dispatch: an environment call from U-mode goes to the syscall layer;
//! a U-mode page fault goes to the lazy allocator and, if it is not a
//! lazy-allocation opportunity, kills the process; anything else panics.

use crate::memory::{handle_umode_page_fault, VirtAddr};
use crate::{arch, println, process, syscall};

/// Saved user state, one per process. `x[i]` holds register `xi`
/// (`x[0]` is hardwired zero and only stored for layout simplicity).
#[repr(C)]
#[derive(Clone)]
pub struct TrapFrame {
    pub x: [usize; 32],  // 0..256
    pub sstatus: usize,  // 256
    pub sepc: usize,     // 264
    /// Kernel stack to run the handler on; loaded by the user vector.
    pub kernel_sp: usize, // 272
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 32],
            sstatus: 0,
            sepc: 0,
            kernel_sp: 0,
        }
    }

    /// Argument registers a0-a5.
    pub fn arg(&self, n: usize) -> usize {
        self.x[10 + n]
    }

    /// Syscall number register a7.
    pub fn syscall_number(&self) -> usize {
        self.x[17]
    }

    /// Store a syscall return value in a0.
    pub fn set_return(&mut self, value: i64) {
        self.x[10] = value as usize;
    }

    pub fn sp(&self) -> usize {
        self.x[2]
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.x[2] = sp;
    }
}

// scause exception codes (interrupt bit clear).
pub const EXCP_ECALL_UMODE: usize = 8;
pub const EXCP_INSTR_PAGE_FAULT: usize = 12;
pub const EXCP_LOAD_PAGE_FAULT: usize = 13;
pub const EXCP_STORE_PAGE_FAULT: usize = 15;

const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);

/// Install the kernel trap vector.
pub fn init() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        use riscv::register::stvec::{self, TrapMode};
        extern "C" {
            fn __kernel_trap_vector();
        }
        stvec::write(__kernel_trap_vector as usize, TrapMode::Direct);
    }
}

/// Entered from the user trap vector with the process's trap frame.
#[no_mangle]
pub extern "C" fn trap_handler(tfr: &mut TrapFrame) {
    let scause = arch::read_scause();
    let stval = arch::read_stval();
    dispatch(tfr, scause, stval);
}

/// Route a U-mode trap. Split from `trap_handler` so the routing logic
/// is callable without real CSRs behind it.
fn dispatch(tfr: &mut TrapFrame, scause: usize, stval: usize) {
    if scause & INTERRUPT_BIT != 0 {
        // No interrupt sources are enabled for U-mode yet.
        panic!("unexpected interrupt (scause {:#x})", scause);
    }
    match scause {
        EXCP_ECALL_UMODE => {
            // Resume past the ecall instruction.
            tfr.sepc += 4;
            let ret = syscall::dispatch(tfr);
            tfr.set_return(ret);
        }
        EXCP_INSTR_PAGE_FAULT | EXCP_LOAD_PAGE_FAULT | EXCP_STORE_PAGE_FAULT => {
            if !handle_umode_page_fault(VirtAddr::new(stval)) {
                println!(
                    "access violation at {:#x} (scause {}, sepc {:#x})",
                    stval, scause, tfr.sepc
                );
                process::exit_current(-1);
            }
        }
        _ => panic!(
            "unhandled user trap: scause {:#x}, stval {:#x}, sepc {:#x}",
            scause, stval, tfr.sepc
        ),
    }
}

/// A trap taken while the kernel itself was running. Nothing here is
/// recoverable.
#[no_mangle]
pub extern "C" fn kernel_trap_panic(scause: usize, sepc: usize, stval: usize) -> ! {
    panic!(
        "trap in kernel mode: scause {:#x}, sepc {:#x}, stval {:#x}",
        scause, sepc, stval
    );
}

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text
    .globl __kernel_trap_vector
    .align 4
__kernel_trap_vector:
    csrr a0, scause
    csrr a1, sepc
    csrr a2, stval
    call kernel_trap_panic

    .globl __user_trap_vector
    .align 4
__user_trap_vector:
    # t6 <- trap frame, sscratch <- user t6 (recovered below)
    csrrw t6, sscratch, t6

    sd x1, 8(t6)
    sd x2, 16(t6)
    sd x3, 24(t6)
    sd x4, 32(t6)
    sd x5, 40(t6)
    sd x6, 48(t6)
    sd x7, 56(t6)
    sd x8, 64(t6)
    sd x9, 72(t6)
    sd x10, 80(t6)
    sd x11, 88(t6)
    sd x12, 96(t6)
    sd x13, 104(t6)
    sd x14, 112(t6)
    sd x15, 120(t6)
    sd x16, 128(t6)
    sd x17, 136(t6)
    sd x18, 144(t6)
    sd x19, 152(t6)
    sd x20, 160(t6)
    sd x21, 168(t6)
    sd x22, 176(t6)
    sd x23, 184(t6)
    sd x24, 192(t6)
    sd x25, 200(t6)
    sd x26, 208(t6)
    sd x27, 216(t6)
    sd x28, 224(t6)
    sd x29, 232(t6)
    sd x30, 240(t6)
    # user t6 parks in sscratch; stash it and point sscratch back at
    # the frame for the next trap
    csrrw t0, sscratch, t6
    sd t0, 248(t6)

    csrr t0, sstatus
    sd t0, 256(t6)
    csrr t0, sepc
    sd t0, 264(t6)

    # traps from the handler itself are kernel traps
    la t0, __kernel_trap_vector
    csrw stvec, t0

    ld sp, 272(t6)
    # the user's s0 is already in the frame; park the frame pointer in a
    # register trap_handler must preserve
    mv s0, t6
    mv a0, t6
    call trap_handler

    # fall through: return to user with the (possibly updated) frame
    mv t6, s0
    j __restore_user

    # First entry to user mode for a process: record the kernel stack
    # for the next trap, then run the ordinary restore path.
    .globl __enter_user
    .align 2
__enter_user:
    sd sp, 272(a0)
    mv t6, a0
    j __restore_user

    .globl __restore_user
    .align 4
__restore_user:
    # t6 = trap frame; re-arm the user vector and sscratch
    la t0, __user_trap_vector
    csrw stvec, t0
    csrw sscratch, t6

    ld t0, 256(t6)
    csrw sstatus, t0
    ld t0, 264(t6)
    csrw sepc, t0

    ld x1, 8(t6)
    ld x2, 16(t6)
    ld x3, 24(t6)
    ld x4, 32(t6)
    ld x5, 40(t6)
    ld x6, 48(t6)
    ld x7, 56(t6)
    ld x8, 64(t6)
    ld x9, 72(t6)
    ld x10, 80(t6)
    ld x11, 88(t6)
    ld x12, 96(t6)
    ld x13, 104(t6)
    ld x14, 112(t6)
    ld x15, 120(t6)
    ld x16, 128(t6)
    ld x17, 136(t6)
    ld x18, 144(t6)
    ld x19, 152(t6)
    ld x20, 160(t6)
    ld x21, 168(t6)
    ld x22, 176(t6)
    ld x23, 184(t6)
    ld x24, 192(t6)
    ld x25, 200(t6)
    ld x26, 208(t6)
    ld x27, 216(t6)
    ld x28, 224(t6)
    ld x29, 232(t6)
    ld x30, 240(t6)
    ld x31, 248(t6)
    sret
"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_register_accessors() {
        let mut tfr = TrapFrame::zeroed();
        tfr.x[10] = 1;
        tfr.x[12] = 3;
        tfr.x[17] = 42;
        assert_eq!(tfr.arg(0), 1);
        assert_eq!(tfr.arg(2), 3);
        assert_eq!(tfr.syscall_number(), 42);
        tfr.set_return(-7);
        assert_eq!(tfr.arg(0) as i64, -7);
    }

    #[test]
    fn trap_frame_layout_matches_the_vectors() {
        // The assembly spills sstatus/sepc/kernel_sp at fixed offsets;
        // the struct must agree.
        let tfr = TrapFrame::zeroed();
        let base = &tfr as *const TrapFrame as usize;
        assert_eq!(&tfr.sstatus as *const usize as usize - base, 256);
        assert_eq!(&tfr.sepc as *const usize as usize - base, 264);
        assert_eq!(&tfr.kernel_sp as *const usize as usize - base, 272);
    }
}
