//! # Interrupt-Safe Locking
//!
//! A spinlock that disables interrupts while held. This prevents the
//! classic single-hart deadlock:
//!
//! 1. Thread acquires lock
//! 2. Interrupt fires
//! 3. Interrupt handler tries to acquire the same lock
//! 4. Deadlock!
//!
//! With interrupts disabled for the lifetime of the guard, nothing can
//! preempt a critical section. The previous interrupt-enable state is
//! restored when the guard drops, so nesting is safe.
//!
//! On the single-hart target the spin loop should never actually spin;
//! contention there means reentrancy, which the spin limit turns into a
//! named panic instead of a silent hang. Host unit tests run threaded and
//! may contend for real, so the limit is generous.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

/// Spins before declaring the lock deadlocked.
const MAX_SPINS: usize = 100_000_000;

/// A spinlock that disables interrupts while held.
pub struct InterruptSafeLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    /// Names the lock in deadlock panics.
    name: &'static str,
}

unsafe impl<T: Send> Sync for InterruptSafeLock<T> {}
unsafe impl<T: Send> Send for InterruptSafeLock<T> {}

impl<T> InterruptSafeLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            name,
        }
    }

    /// Acquire the lock, returning a guard that restores the interrupt
    /// state on drop.
    pub fn lock(&self) -> InterruptSafeLockGuard<'_, T> {
        // Interrupts must go off before the acquire attempt, otherwise a
        // handler can fire between the two and take this same lock.
        let restore_interrupts = arch::interrupts_enabled();
        arch::disable_interrupts();

        let mut spins = 0;
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
            spins += 1;
            if spins == MAX_SPINS {
                panic!("deadlock on lock '{}'", self.name);
            }
        }

        InterruptSafeLockGuard {
            lock: self,
            restore_interrupts,
        }
    }
}

pub struct InterruptSafeLockGuard<'a, T> {
    lock: &'a InterruptSafeLock<T>,
    restore_interrupts: bool,
}

impl<'a, T> Drop for InterruptSafeLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.restore_interrupts {
            arch::enable_interrupts();
        }
    }
}

impl<'a, T> core::ops::Deref for InterruptSafeLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> core::ops::DerefMut for InterruptSafeLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_data() {
        let lock = InterruptSafeLock::new(42, "test");
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 42);
            *guard = 7;
        }
        assert_eq!(*lock.lock(), 7);
    }

    #[test]
    fn lock_releases_on_drop() {
        let lock = InterruptSafeLock::new((), "test");
        drop(lock.lock());
        // A second acquisition must not spin forever.
        drop(lock.lock());
    }
}
