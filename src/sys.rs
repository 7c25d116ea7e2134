// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Kernel services the work engine is built on.
//!
//! These are host implementations of the primitives a kernel would normally provide: a counting
//! semaphore, wait queues that park a thread while releasing a lock, thread creation, and a
//! timeout service that runs callbacks from its own thread.  They are all safe to use directly,
//! and none of them depend on the work engine.

pub mod sync;
pub mod thread;
pub mod timeout;
pub mod wait_q;

pub use crate::time::uptime_get;

/// Busy wait.
///
/// Spin, without sleeping, for the given number of microseconds.
pub fn busy_wait(usec: u32) {
    let end = std::time::Instant::now() + core::time::Duration::from_micros(usec as u64);
    while std::time::Instant::now() < end {
        core::hint::spin_loop();
    }
}
