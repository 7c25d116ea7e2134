// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Wait queues.
//!
//! A [`WaitQ`] is a place for threads to park while holding a lock.  Parking releases the lock
//! for the duration of the wait and re-acquires it before returning, so the waiter sees a
//! consistent state when it wakes.  All waits on a given `WaitQ` must use the same lock.
//!
//! Wake-ups may be spurious.  Callers always re-check their condition after a wait returns.

use core::fmt;

use parking_lot::{Condvar, MutexGuard};

/// A wait queue tied to whatever lock the waiters hold.
pub struct WaitQ {
    cond: Condvar,
}

impl WaitQ {
    /// Construct an empty wait queue.
    pub const fn new() -> Self {
        WaitQ {
            cond: Condvar::new(),
        }
    }

    /// Park the current thread until woken, releasing `guard` while parked.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.cond.wait(guard);
    }

    /// Park until woken or until `deadline` passes.  Returns true on timeout.
    ///
    /// A `None` deadline waits forever.
    pub fn wait_until<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<std::time::Instant>,
    ) -> bool {
        match deadline {
            None => {
                self.cond.wait(guard);
                false
            }
            Some(deadline) => self.cond.wait_until(guard, deadline).timed_out(),
        }
    }

    /// Wake one waiter.  Returns whether a thread was woken.
    pub fn wake_one(&self) -> bool {
        self.cond.notify_one()
    }

    /// Wake every waiter.  Returns the number of threads woken.
    pub fn wake_all(&self) -> usize {
        self.cond.notify_all()
    }
}

impl Default for WaitQ {
    fn default() -> Self {
        WaitQ::new()
    }
}

impl fmt::Debug for WaitQ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sys::WaitQ")
    }
}
