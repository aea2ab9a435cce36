//! Boot entry for the Rowan kernel.
//!
//! QEMU (`-machine virt -bios none -kernel rowan`) drops us at the start
//! of RAM with nothing set up. The boot shim parks the stack, zeroes
//! BSS, and calls `kmain`, which brings the subsystems up in dependency
//! order and hands control to the first user process.
//!
//! Build for the board with:
//!
//! ```text
//! RUSTFLAGS="-C link-arg=-Trowan/kernel.ld" \
//!     cargo build --release --target riscv64gc-unknown-none-elf
//! ```
//!
//! A filesystem image can be appended into the `.fsimg` section with
//! objcopy; without one the kernel idles after boot.

#![cfg_attr(target_arch = "riscv64", no_std)]
#![cfg_attr(target_arch = "riscv64", no_main)]

#[cfg(target_arch = "riscv64")]
mod boot {
    use core::ptr::addr_of;

    use rowan::fs::ramdisk::Ramdisk;
    use rowan::{arch, console, fs, memory, process, println, thread, trap};

    core::arch::global_asm!(
        r#"
        .section .text.init
        .globl _start
_start:
        # Paging off until memory::init builds the kernel tables.
        csrw satp, zero
        la sp, __boot_stack_top

        # Zero BSS before any Rust code can read it.
        la t0, __bss_start
        la t1, __bss_end
0:      bgeu t0, t1, 1f
        sd zero, 0(t0)
        addi t0, t0, 8
        j 0b
1:      call kmain

        # kmain never returns; if it somehow does, halt here.
2:      wfi
        j 2b

        .section .bss
        .align 4
__boot_stack:
        .space 16384
        .globl __boot_stack_top
__boot_stack_top:
"#
    );

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        console::init();
        println!();
        println!("rowan {} starting", env!("CARGO_PKG_VERSION"));

        unsafe {
            memory::init();
        }
        trap::init();
        thread::init();
        println!(
            "memory up: {} KB heap free, {} pages in the pool",
            rowan::heap_free_bytes() / 1024,
            memory::free_phys_page_count()
        );

        mount_ramdisk();

        match process::spawn_init("init") {
            Ok(tid) => match process::wait(tid) {
                Ok(code) => println!("init exited with {}", code),
                Err(err) => println!("wait on init failed: {}", err),
            },
            Err(err) => println!("could not start init: {}", err),
        }

        println!("nothing left to run; idling");
        loop {
            arch::wait_for_interrupt();
            thread::yield_now();
        }
    }

    /// Mount the filesystem image linked into `.fsimg`, if there is one.
    fn mount_ramdisk() {
        extern "C" {
            static _fsimg_start: u8;
            static _fsimg_end: u8;
        }
        let (start, end) = unsafe { (addr_of!(_fsimg_start) as usize, addr_of!(_fsimg_end) as usize) };
        if end <= start {
            println!("no filesystem image");
            return;
        }
        let disk = unsafe { Ramdisk::from_raw(start, end - start) };
        match fs::mount_root(disk) {
            Ok(()) => println!("root filesystem mounted ({} KB)", (end - start) / 1024),
            Err(err) => println!("bad filesystem image: {}", err),
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!();
        println!("KERNEL PANIC: {}", info);
        loop {
            arch::wait_for_interrupt();
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn main() {
    eprintln!("rowan targets riscv64; see src/main.rs for build instructions");
}
