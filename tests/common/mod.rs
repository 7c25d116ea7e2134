// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use kwork::{
    sys::sync::Semaphore,
    time::{Duration, Forever},
    work::{Kernel, Work, WorkQueue, WorkQueueConfig},
};

/// A kernel with one started queue.
pub fn setup() -> (Kernel, WorkQueue) {
    let _ = kwork::set_logger();
    let kernel = Kernel::new().unwrap();
    let queue = kernel.new_queue();
    let config = WorkQueueConfig {
        name: Some("test-workq".to_owned()),
        ..Default::default()
    };
    queue.start(0, 0, &config).unwrap();
    (kernel, queue)
}

/// A work item that holds its worker until opened.
///
/// Used to keep items observably `QUEUED` behind it.
pub struct Gate {
    started: Semaphore,
    release: Semaphore,
    pub work: Work,
}

impl Gate {
    pub fn new(kernel: &Kernel) -> Gate {
        let started = Semaphore::new(0, 1);
        let release = Semaphore::new(0, 1);
        let work = {
            let started = started.clone();
            let release = release.clone();
            kernel.new_work(move |_| {
                started.give();
                release.take(Forever).unwrap();
            })
        };
        Gate {
            started,
            release,
            work,
        }
    }

    /// Submit the gate, and wait until the worker is held by it.
    pub fn close(&self, queue: &WorkQueue) {
        queue.submit(&self.work).unwrap();
        self.started.take(Forever).unwrap();
    }

    pub fn open(&self) {
        self.release.give();
    }
}

/// Poll until `cond` holds, for at most `limit`.
pub fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = std::time::Instant::now() + std::time::Duration::from_micros(limit.to_micros());
    while std::time::Instant::now() < end {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    cond()
}

pub fn sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}
