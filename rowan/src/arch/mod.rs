//! Hardware access seam.
//!
//! Everything the kernel wants from the privileged architecture funnels
//! through this module: the `satp` translation-control register, the
//! translation-cache fences, the supervisor interrupt-enable bit, and a
//! handful of trap CSRs. On RISC-V these touch the real CSRs. On any
//! other target a mock register file stands in, which is what lets the
//! whole memory manager run under `cargo test` on the build host.

#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use riscv64::*;

#[cfg(not(target_arch = "riscv64"))]
mod host;
#[cfg(not(target_arch = "riscv64"))]
pub use host::*;
