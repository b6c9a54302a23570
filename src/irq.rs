//! Mutual exclusion between the controller's interrupt handler and the rest
//! of the program.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Masking of the interrupt that delivers control events.
pub trait InterruptControl: Send + Sync {
    /// Mask the interrupt. Returns whether it was unmasked beforehand.
    fn mask(&self) -> bool;

    fn unmask(&self);
}

/// For hosts where control events never arrive in interrupt context.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    fn mask(&self) -> bool {
        false
    }

    fn unmask(&self) {}
}

/// A value that is only touched with the control interrupt masked.
pub struct IrqLock<T, I> {
    interrupts: I,
    value: Mutex<T>,
}

impl<T, I: InterruptControl> IrqLock<T, I> {
    pub fn new(value: T, interrupts: I) -> Self {
        IrqLock {
            interrupts,
            value: Mutex::new(value),
        }
    }

    /// Mask the interrupt and take the lock. Both are released when the
    /// guard is dropped, the lock first.
    pub fn lock(&self) -> IrqGuard<'_, T, I> {
        let masked = Masked {
            interrupts: &self.interrupts,
            was_unmasked: self.interrupts.mask(),
        };
        // Every update completes inside one guard, so a panic elsewhere
        // cannot leave the value half-written.
        let guard = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        IrqGuard {
            guard,
            _masked: masked,
        }
    }

    pub fn interrupts(&self) -> &I {
        &self.interrupts
    }
}

struct Masked<'l, I: InterruptControl> {
    interrupts: &'l I,
    was_unmasked: bool,
}

impl<I: InterruptControl> Drop for Masked<'_, I> {
    fn drop(&mut self) {
        if self.was_unmasked {
            self.interrupts.unmask();
        }
    }
}

// Fields drop in declaration order: the mutex is released before the
// interrupt is unmasked.
pub struct IrqGuard<'l, T, I: InterruptControl> {
    guard: MutexGuard<'l, T>,
    _masked: Masked<'l, I>,
}

impl<T, I: InterruptControl> Deref for IrqGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, I: InterruptControl> DerefMut for IrqGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
