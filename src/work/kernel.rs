// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! The engine context.
//!
//! A [`Kernel`] is one lock domain: every work item and work queue created from it is tracked
//! under a single lock, together with the list of pending synchronous cancellations and the
//! timeout service that drives delayable work.  There is no global state, so independent kernels
//! never interact.

use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::Result,
    sync::{Arc, Weak},
    sys::timeout::Timeouts,
};

use super::{state::WorkState, DelayableWork, WorkContext, Work, WorkQueue};

/// Handle of a work item within its kernel.
///
/// Handles are generational, so a handle whose item has been freed never refers to a later item
/// that reuses the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkId {
    pub(crate) key: usize,
    pub(crate) gen: u64,
}

/// Handle of a work queue within its kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub(crate) key: usize,
    pub(crate) gen: u64,
}

pub(crate) struct KernelInner {
    pub(crate) lock: Mutex<WorkState>,
    pub(crate) timeouts: Timeouts,
}

/// A work engine instance.
///
/// Clones refer to the same engine.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) inner: Arc<KernelInner>,
}

impl Kernel {
    /// Create a new engine.  This starts its timer thread.
    pub fn new() -> Result<Kernel> {
        Ok(Kernel {
            inner: Arc::new(KernelInner {
                lock: Mutex::new(WorkState::new()),
                timeouts: Timeouts::new()?,
            }),
        })
    }

    /// Create a work item running the given closure.
    pub fn new_work<F>(&self, handler: F) -> Work
    where
        F: Fn(&WorkContext<'_>) + Send + Sync + 'static,
    {
        Work::new(self, handler)
    }

    /// Create a delayable work item running the given closure.
    pub fn new_delayable<F>(&self, handler: F) -> DelayableWork
    where
        F: Fn(&WorkContext<'_>) + Send + Sync + 'static,
    {
        DelayableWork::new(self, handler)
    }

    /// Create a work queue.  It must be started before anything can be submitted to it.
    pub fn new_queue(&self) -> WorkQueue {
        WorkQueue::new(self)
    }

    /// Are these two handles for the same engine.
    pub fn same(&self, other: &Kernel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WorkState> {
        self.inner.lock.lock()
    }

    pub(crate) fn timeouts(&self) -> &Timeouts {
        &self.inner.timeouts
    }

    pub(crate) fn downgrade(&self) -> Weak<KernelInner> {
        Arc::downgrade(&self.inner)
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Kernel")
    }
}
