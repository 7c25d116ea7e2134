// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Flag words for work items and work queues.
//!
//! Both words are only ever changed with the kernel lock held, so they are plain integers and not
//! atomics.  The bit positions follow `K_WORK_*_BIT` and `K_WORK_QUEUE_*_BIT`.

bitflags::bitflags! {
    /// The state of a work item.
    ///
    /// The busy part of the word is what [`Work::busy_get`] reports.  Combinations are
    /// meaningful: a delayable item can be `DELAYED` while it is still `RUNNING`, and a running
    /// item can be `QUEUED` again by its own handler.
    ///
    /// [`Work::busy_get`]: crate::work::Work::busy_get
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct WorkFlags: u32 {
        /// The handler is executing on a worker.
        const RUNNING = 1 << 0;
        /// A cancellation is waiting for the running handler to return.
        const CANCELING = 1 << 1;
        /// The item is in a queue's pending list.
        const QUEUED = 1 << 2;
        /// A timeout is armed that will submit the item.
        const DELAYED = 1 << 3;
        /// Static marker for delayable items.  Not part of the busy state.
        const DELAYABLE = 1 << 8;
    }
}

impl WorkFlags {
    /// The dynamic flags that make an item busy.
    pub const BUSY_MASK: Self = Self::RUNNING
        .union(Self::CANCELING)
        .union(Self::QUEUED)
        .union(Self::DELAYED);

    /// Just the busy part of the word.
    pub fn busy(self) -> Self {
        self & Self::BUSY_MASK
    }

    /// Clear `flag`, returning whether it was set.
    pub(crate) fn test_and_clear(&mut self, flag: Self) -> bool {
        let was = self.intersects(flag);
        self.remove(flag);
        was
    }
}

bitflags::bitflags! {
    /// The state of a work queue.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct QueueFlags: u32 {
        /// The worker thread has been started.
        const STARTED = 1 << 0;
        /// The worker is running a handler.
        const BUSY = 1 << 1;
        /// Drainers are waiting for the pending list to empty.
        const DRAIN = 1 << 2;
        /// Reject new submissions, even after a drain completes.
        const PLUGGED = 1 << 3;
        /// Do not yield after each handler.
        const NO_YIELD = 1 << 4;
        /// The worker should exit once it has nothing to do.
        const STOP = 1 << 5;
    }
}

impl QueueFlags {
    /// Clear `flag`, returning whether it was set.
    pub(crate) fn test_and_clear(&mut self, flag: Self) -> bool {
        let was = self.intersects(flag);
        self.remove(flag);
        was
    }
}
