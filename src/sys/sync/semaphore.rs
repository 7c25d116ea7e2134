// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Counting semaphore.
//!
//! This is the `k_sem` the work engine blocks on while waiting for a flush or a cancellation to
//! complete.  It has both a lower and an upper bound on the count.  Note that calling `give` on a
//! semaphore that is at the maximum count will discard the `give` operation.

use core::fmt;

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Error, Result},
    sync::Arc,
    time::Timeout,
};

/// The largest permitted count.
pub const K_SEM_MAX_LIMIT: u32 = u32::MAX;

struct SemInner {
    count: Mutex<u32>,
    limit: u32,
    available: Condvar,
}

/// A counting semaphore.
///
/// Clones refer to the same semaphore.
#[derive(Clone)]
pub struct Semaphore {
    item: Arc<SemInner>,
}

impl Semaphore {
    /// Create a new semaphore with the given initial count and limit.
    ///
    /// A limit of zero is raised to one, and the initial count is clamped to the limit.
    pub fn new(initial_count: u32, limit: u32) -> Semaphore {
        let limit = limit.max(1);
        Semaphore {
            item: Arc::new(SemInner {
                count: Mutex::new(initial_count.min(limit)),
                limit,
                available: Condvar::new(),
            }),
        }
    }

    /// Take a semaphore.
    ///
    /// Does not block when called with [`NoWait`].  Returns [`Error::TimedOut`] if the count did
    /// not become available within the timeout.
    ///
    /// [`NoWait`]: crate::time::NoWait
    pub fn take<T>(&self, timeout: T) -> Result<()>
    where
        T: Into<Timeout>,
    {
        let timeout: Timeout = timeout.into();
        let deadline = timeout.deadline();
        let mut count = self.item.count.lock();
        while *count == 0 {
            match deadline {
                None => self.item.available.wait(&mut count),
                Some(deadline) => {
                    if self.item.available.wait_until(&mut count, deadline).timed_out() && *count == 0
                    {
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
        *count -= 1;
        Ok(())
    }

    /// Give a semaphore.
    ///
    /// This routine gives to the semaphore, unless the semaphore is already at its maximum
    /// permitted count.
    pub fn give(&self) {
        let mut count = self.item.count.lock();
        if *count < self.item.limit {
            *count += 1;
            self.item.available.notify_one();
        }
    }

    /// Resets a semaphore's count to zero.
    pub fn reset(&self) {
        *self.item.count.lock() = 0;
    }

    /// Get a semaphore's count.
    pub fn count_get(&self) -> usize {
        *self.item.count.lock() as usize
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sys::Semaphore")
    }
}
