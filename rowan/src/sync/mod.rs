//! Kernel synchronization primitives.

pub mod interrupt_lock;

pub use interrupt_lock::{InterruptSafeLock, InterruptSafeLockGuard};
