//! Console driver (UART 16550)
//!
//! Thread-safe output to the virt board's first UART, plus the kernel's
//! `print!`/`println!` macros. The UART is memory-mapped at
//! `UART0_BASE`; `uart_16550` handles the register-level protocol.
//!
//! Until `init` runs (and always on non-RISC-V hosts) the writer is
//! detached and output goes nowhere, so early code and unit tests can
//! print without faulting on MMIO.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::MmioSerialPort;

/// The kernel console: a 16550 UART once attached.
pub struct Console {
    port: Option<MmioSerialPort>,
}

impl Console {
    const fn new() -> Self {
        Self { port: None }
    }

    /// Attach and initialize the UART hardware.
    ///
    /// # Safety
    ///
    /// `UART0_BASE` must be the MMIO base of a 16550 and must be mapped.
    #[cfg(target_arch = "riscv64")]
    unsafe fn attach(&mut self) {
        let mut port = MmioSerialPort::new(crate::conf::UART0_BASE);
        port.init();
        self.port = Some(port);
    }

    fn put_byte(&mut self, byte: u8) {
        if let Some(port) = self.port.as_mut() {
            port.send(byte);
        }
    }

    /// Block until a byte arrives on the UART. Returns 0 when detached.
    fn get_byte(&mut self) -> u8 {
        match self.port.as_mut() {
            Some(port) => port.receive(),
            None => 0,
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}

lazy_static! {
    static ref CONSOLE: Mutex<Console> = Mutex::new(Console::new());
}

/// Attach the console to the UART (call once during boot).
pub fn init() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        CONSOLE.lock().attach();
    }
}

/// Read one byte from the console, blocking.
pub fn read_byte() -> u8 {
    CONSOLE.lock().get_byte()
}

/// Write one byte to the console.
pub fn write_byte(byte: u8) {
    CONSOLE.lock().put_byte(byte);
}

/// Macro for console output (like print!)
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

/// Macro for console output with newline (like println!)
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Internal print function for the macros.
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    CONSOLE.lock().write_fmt(args).unwrap();
}
