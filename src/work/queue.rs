// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Work queues and their worker threads.

use std::thread::ThreadId;

use log::{debug, trace};
use parking_lot::MutexGuard;

use crate::{
    error::{Error, Result},
    sys::thread::Thread,
    time::{Forever, Timeout},
};

use super::{
    flags::{QueueFlags, WorkFlags},
    kernel::{Kernel, QueueId},
    state::WorkState,
    SubmitResult, Work, WorkContext,
};

/// Configuration for starting a work queue.
#[derive(Clone, Debug, Default)]
pub struct WorkQueueConfig {
    /// Name of the worker thread.  Diagnostic only.
    pub name: Option<String>,
    /// Do not yield after each handler.
    ///
    /// By default the worker yields once per item, to let other threads at the same priority
    /// run.
    pub no_yield: bool,
    /// Mark the worker thread essential.  A panic in one of its handlers aborts the process.
    pub essential: bool,
}

/// A work queue.
///
/// A queue accepts no work until it has been [started](WorkQueue::start).  Dropping a started
/// queue drains and plugs it, then stops its worker.
pub struct WorkQueue {
    kernel: Kernel,
    id: QueueId,
}

impl WorkQueue {
    /// Create a work queue in the given kernel.
    pub fn new(kernel: &Kernel) -> WorkQueue {
        let id = kernel.lock().insert_queue();
        WorkQueue {
            kernel: kernel.clone(),
            id,
        }
    }

    /// The queue's handle in its kernel.
    pub fn id(&self) -> QueueId {
        self.id
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Start the worker thread.
    ///
    /// A `stack_size` of zero uses the platform default.  Returns [`Error::Already`] if the queue
    /// is already running.
    pub fn start(&self, stack_size: usize, priority: i32, config: &WorkQueueConfig) -> Result<()> {
        let mut state = self.kernel.lock();
        let Some(q) = state.queue_mut(self.id) else {
            return Err(Error::InvalidQueue);
        };
        if q.flags.contains(QueueFlags::STARTED) {
            return Err(Error::Already);
        }

        let mut thread = Thread::new();
        thread.set_stack_size(stack_size);
        thread.set_priority(priority);
        thread.set_essential(config.essential);
        if let Some(name) = &config.name {
            thread.set_name(name);
        }

        let kernel = self.kernel.clone();
        let id = self.id;
        // The worker blocks on the lock we hold until its slot is filled in.
        let running = thread.spawn(move || work_queue_main(kernel, id))?;

        q.flags = QueueFlags::STARTED;
        if config.no_yield {
            q.flags.insert(QueueFlags::NO_YIELD);
        }
        q.name = config.name.clone();
        q.thread_id = Some(running.id());
        q.thread = Some(running);
        debug!("started work queue {:?} ({:?})", self.id, config.name);
        Ok(())
    }

    /// Submit a work item to this queue.
    pub fn submit(&self, work: &Work) -> Result<SubmitResult> {
        work.submit_to_queue(self)
    }

    /// Wait for the queue to empty.
    ///
    /// While draining, only chained submissions from the worker itself are accepted.  With `plug`,
    /// the queue keeps rejecting submissions after the drain completes, until
    /// [`unplug`](WorkQueue::unplug).  Returns whether there was anything to wait for.
    ///
    /// The worker can't wait for itself: called from one of this queue's handlers, this returns
    /// [`Error::Busy`].
    pub fn drain(&self, plug: bool) -> Result<bool> {
        let mut state = self.kernel.lock();
        let Some(q) = state.queue_mut(self.id) else {
            return Err(Error::InvalidQueue);
        };
        if !q.flags.contains(QueueFlags::STARTED) {
            return Err(Error::QueueNotStarted);
        }
        if on_worker(q.thread_id) {
            return Err(Error::Busy);
        }

        let busy = q.flags.intersects(QueueFlags::BUSY | QueueFlags::DRAIN);
        if !(busy || plug || !q.pending.is_empty()) {
            return Ok(false);
        }

        q.flags.insert(QueueFlags::DRAIN);
        if plug {
            q.flags.insert(QueueFlags::PLUGGED);
        }
        q.waits.notifyq.wake_one();
        let epoch = q.drain_epoch;
        let waits = q.waits.clone();
        trace!("drain {:?} (plug {})", self.id, plug);

        loop {
            waits.drainq.wait(&mut state);
            match state.queue(self.id) {
                Some(q) if q.drain_epoch == epoch => (),
                _ => break,
            }
        }
        Ok(true)
    }

    /// Release a plugged queue.
    ///
    /// Returns [`Error::Already`] if the queue was not plugged.
    pub fn unplug(&self) -> Result<()> {
        let mut state = self.kernel.lock();
        let Some(q) = state.queue_mut(self.id) else {
            return Err(Error::InvalidQueue);
        };
        if q.flags.test_and_clear(QueueFlags::PLUGGED) {
            Ok(())
        } else {
            Err(Error::Already)
        }
    }

    /// Stop the worker thread.
    ///
    /// The queue must be plugged, normally by [`drain(true)`](WorkQueue::drain).  The worker
    /// exits once it has nothing left to do, and this waits up to `timeout` for it.  On success
    /// the queue is back in its unstarted state, and can be started again.
    ///
    /// Returns [`Error::Already`] if the queue is not running, [`Error::Busy`] if it is not
    /// plugged or this is the worker itself, and [`Error::TimedOut`] if the worker did not exit in
    /// time.
    pub fn stop<T: Into<Timeout>>(&self, timeout: T) -> Result<()> {
        let mut thread = {
            let mut state = self.kernel.lock();
            let Some(q) = state.queue_mut(self.id) else {
                return Err(Error::InvalidQueue);
            };
            if !q.flags.contains(QueueFlags::STARTED) {
                return Err(Error::Already);
            }
            if !q.flags.contains(QueueFlags::PLUGGED) || on_worker(q.thread_id) {
                return Err(Error::Busy);
            }
            let Some(thread) = q.thread.take() else {
                // Someone else is already joining.
                return Err(Error::Busy);
            };
            q.flags.insert(QueueFlags::STOP);
            q.waits.notifyq.wake_one();
            thread
        };

        match thread.join(timeout) {
            Ok(()) => {
                debug!("stopped work queue {:?}", self.id);
                Ok(())
            }
            Err(err) => {
                let mut state = self.kernel.lock();
                if let Some(q) = state.queue_mut(self.id) {
                    q.flags.remove(QueueFlags::STOP);
                    q.thread = Some(thread);
                }
                Err(err)
            }
        }
    }

    /// The id of the worker thread, while the queue is running.
    pub fn thread_id(&self) -> Option<ThreadId> {
        let state = self.kernel.lock();
        state.queue(self.id).and_then(|q| q.thread_id)
    }

    /// The current flags of the queue.
    pub fn flags(&self) -> QueueFlags {
        let state = self.kernel.lock();
        state
            .queue(self.id)
            .map(|q| q.flags)
            .unwrap_or_default()
    }

    /// Has the queue been started.
    pub fn is_started(&self) -> bool {
        self.flags().contains(QueueFlags::STARTED)
    }

    /// The number of items waiting in the pending list.
    pub fn pending_count(&self) -> usize {
        let state = self.kernel.lock();
        state.queue(self.id).map_or(0, |q| q.pending.len())
    }

    /// The name the queue was started with.
    pub fn name(&self) -> Option<String> {
        let state = self.kernel.lock();
        state.queue(self.id).and_then(|q| q.name.clone())
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        let mut state = self.kernel.lock();
        let Some(q) = state.queue_mut(self.id) else {
            return;
        };
        if !q.flags.contains(QueueFlags::STARTED) {
            state.free_queue(self.id);
            return;
        }
        if on_worker(q.thread_id) {
            // Can't wait for ourselves.  The worker frees the queue when it exits.
            q.flags.insert(QueueFlags::PLUGGED | QueueFlags::STOP);
            q.orphaned = true;
            q.waits.notifyq.wake_one();
            return;
        }
        drop(state);

        let _ = self.drain(true);
        if let Err(err) = self.stop(Forever) {
            debug!("work queue {:?} not stopped on drop: {}", self.id, err);
        }
        self.kernel.lock().free_queue(self.id);
    }
}

impl core::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "WorkQueue({:?})", self.id)
    }
}

fn on_worker(worker: Option<ThreadId>) -> bool {
    worker == Some(std::thread::current().id())
}

/// The worker thread.
fn work_queue_main(kernel: Kernel, id: QueueId) {
    let mut state = kernel.lock();
    loop {
        let Some(q) = state.queue_mut(id) else {
            return;
        };
        let waits = q.waits.clone();

        if let Some(work) = q.pending.pop_front() {
            let no_yield = q.flags.contains(QueueFlags::NO_YIELD);
            let Some(slot) = state.work_mut(work) else {
                debug_assert!(false, "freed work {:?} found pending", work);
                continue;
            };
            slot.flags.insert(WorkFlags::RUNNING);
            slot.flags.remove(WorkFlags::QUEUED);
            let handler = slot.handler.clone();
            let delayable = slot.flags.contains(WorkFlags::DELAYABLE);
            if let Some(q) = state.queue_mut(id) {
                q.flags.insert(QueueFlags::BUSY);
            }
            trace!("run {:?} on {:?}", work, id);

            let kernel = &kernel;
            MutexGuard::unlocked(&mut state, move || {
                handler.act(&WorkContext::new(kernel, work, id, delayable));
            });

            let freed = state.finish_locked(work);
            if let Some(q) = state.queue_mut(id) {
                q.flags.remove(QueueFlags::BUSY);
            }
            if freed.is_some() || !no_yield {
                MutexGuard::unlocked(&mut state, move || {
                    drop(freed);
                    if !no_yield {
                        std::thread::yield_now();
                    }
                });
            }
        } else if q.flags.test_and_clear(QueueFlags::DRAIN) {
            q.drain_epoch += 1;
            waits.drainq.wake_all();
        } else if q.flags.contains(QueueFlags::STOP) {
            exit_locked(&mut state, id);
            return;
        } else {
            waits.notifyq.wait(&mut state);
        }
    }
}

/// The worker is exiting.
fn exit_locked(state: &mut MutexGuard<'_, WorkState>, id: QueueId) {
    let Some(q) = state.queue_mut(id) else {
        return;
    };
    // The queue may be restarted as soon as the lock is released.
    q.flags = QueueFlags::empty();
    q.thread_id = None;
    if q.orphaned {
        // Detaches our own join handle.
        state.free_queue(id);
    }
    debug!("work queue {:?} exiting", id);
}
