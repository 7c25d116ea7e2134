// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Plain work items.

use crate::{
    error::{Error, Result},
    sync::Arc,
    time::Forever,
};

use super::{
    flags::WorkFlags,
    kernel::{Kernel, WorkId},
    state::{DelaySlot, Handler},
    Origin, SimpleAction, SubmitResult, WorkQueue,
};

/// A work item.
///
/// Holds the handler that a worker calls each time the item comes up in its queue.  The item
/// lives in its kernel until this handle is dropped.  Dropping the handle dequeues the item;
/// if the handler is running at that point it runs to completion, but can no longer resubmit.
pub struct Work {
    kernel: Kernel,
    id: WorkId,
}

impl Work {
    /// Construct a new work item from the given action.
    ///
    /// The action is only called by workers.  If shared data is needed, normal inter-thread
    /// sharing mechanisms are needed.
    pub fn new<H: SimpleAction>(kernel: &Kernel, handler: H) -> Work {
        Self::with_flags(kernel, handler, WorkFlags::empty(), None)
    }

    pub(crate) fn with_flags<H: SimpleAction>(
        kernel: &Kernel,
        handler: H,
        flags: WorkFlags,
        delay: Option<DelaySlot>,
    ) -> Work {
        let handler: Box<dyn SimpleAction> = Box::new(handler);
        let handler: Handler = Arc::new(handler);
        let id = kernel.lock().insert_work(handler, flags, delay);
        Work {
            kernel: kernel.clone(),
            id,
        }
    }

    /// The item's handle in its kernel.
    pub fn id(&self) -> WorkId {
        self.id
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Submit this work to the queue it was last submitted to.
    ///
    /// This can return several possible `Ok` results.  See the docs on [`SubmitResult`] for an
    /// explanation of them.  An item that has never been submitted has no queue, and this returns
    /// [`Error::InvalidQueue`].
    pub fn submit(&self) -> Result<SubmitResult> {
        self.submit_from(Origin::External, None)
    }

    /// Submit this work to the given work queue.
    ///
    /// If the handler is currently running, the item is queued to the queue that is running it
    /// instead, and the result is [`SubmitResult::WasRunning`].
    pub fn submit_to_queue(&self, queue: &WorkQueue) -> Result<SubmitResult> {
        self.submit_from(Origin::External, Some(queue))
    }

    /// Submit with an explicit origin.
    ///
    /// Only the worker of the target queue can make chained submissions, which get through a
    /// drain.  Handlers would normally use [`WorkContext::submit`] instead.
    ///
    /// [`WorkContext::submit`]: crate::work::WorkContext::submit
    pub fn submit_from(&self, origin: Origin, queue: Option<&WorkQueue>) -> Result<SubmitResult> {
        let queue = match queue {
            Some(queue) if !self.kernel.same(queue.kernel()) => return Err(Error::InvalidQueue),
            Some(queue) => Some(queue.id()),
            None => None,
        };
        self.kernel.lock().submit_locked(self.id, queue, origin)
    }

    /// Cancel this work, without waiting.
    ///
    /// A pending item is removed from its queue, and its handler will not be called for that
    /// submission.  A running handler is not interrupted: the item stays `CANCELING`, and can't be
    /// submitted, until it returns.  Returns the busy flags after the attempt, empty if the item
    /// is now idle.
    pub fn cancel(&self) -> WorkFlags {
        self.kernel.lock().cancel_async_locked(self.id)
    }

    /// Cancel this work, and wait for a running handler to return.
    ///
    /// Returns whether the item was pending or running when called.  Must not be called from the
    /// item's own handler, which would wait for itself.
    pub fn cancel_sync(&self) -> bool {
        let wait = {
            let mut state = self.kernel.lock();
            if state.busy_get(self.id).is_empty() {
                return false;
            }
            state.cancel_async_locked(self.id);
            state.cancel_sync_locked(self.id)
        };
        if let Some(sem) = wait {
            let _ = sem.take(Forever);
        }
        true
    }

    /// Wait for the last submission of this work to complete.
    ///
    /// Returns false right away if the item is neither pending nor running.  Otherwise returns
    /// true once the handler has returned.  Must not be called from the item's own queue.
    pub fn flush(&self) -> bool {
        let Some(sem) = self.kernel.lock().flush_locked(self.id) else {
            return false;
        };
        let _ = sem.take(Forever);
        true
    }

    /// The busy flags of this item: any of `RUNNING`, `CANCELING`, `QUEUED` and `DELAYED`.
    pub fn busy_get(&self) -> WorkFlags {
        self.kernel.lock().busy_get(self.id)
    }

    /// Is the item busy at all.
    pub fn is_pending(&self) -> bool {
        !self.busy_get().is_empty()
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        let kernel = &self.kernel;
        let freed = kernel.lock().release_locked(kernel.timeouts(), self.id);
        drop(freed);
    }
}

impl core::fmt::Debug for Work {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Work({:?})", self.id)
    }
}
