// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! The lock-protected state of a kernel, and the state machine that runs on it.
//!
//! Every method here is called with the kernel lock held, and none of them block.  Anything that
//! has to wait (a flush, a synchronous cancel, a drain) does its bookkeeping here, drops the lock,
//! and then waits on the semaphore or wait queue it was handed back.

use std::collections::VecDeque;
use std::thread::ThreadId;

use log::trace;
use slab::Slab;

use crate::{
    error::{Error, Result},
    sync::Arc,
    sys::{
        sync::Semaphore,
        thread::RunningThread,
        timeout::{TimeoutHandle, Timeouts},
        wait_q::WaitQ,
    },
    time::Timeout,
};

use super::{
    delayable,
    flags::{QueueFlags, WorkFlags},
    kernel::{Kernel, QueueId, WorkId},
    Origin, ScheduleResult, SimpleAction, SubmitResult,
};

/// A handler, shared with the worker while it runs.
pub(crate) type Handler = Arc<Box<dyn SimpleAction>>;

/// The timer part of a delayable item.
pub(crate) struct DelaySlot {
    /// Queue the timeout will submit to.
    pub(crate) queue: Option<QueueId>,
    pub(crate) timeout: Option<TimeoutHandle>,
    /// Counts arming operations.  A timeout callback only acts if nothing re-armed since.
    pub(crate) arm: u64,
}

pub(crate) struct WorkSlot {
    gen: u64,
    pub(crate) handler: Handler,
    pub(crate) flags: WorkFlags,
    /// The queue the item was last submitted to.
    pub(crate) queue: Option<QueueId>,
    pub(crate) delay: Option<DelaySlot>,
    /// The owning handle was dropped while the handler was running.
    pub(crate) orphaned: bool,
    /// A flusher, freed as soon as it has run.
    pub(crate) transient: bool,
}

pub(crate) struct QueueWaits {
    /// The worker parks here when it has nothing to do.
    pub(crate) notifyq: WaitQ,
    /// Drainers park here until the worker empties the pending list.
    pub(crate) drainq: WaitQ,
}

pub(crate) struct QueueSlot {
    gen: u64,
    pub(crate) name: Option<String>,
    pub(crate) flags: QueueFlags,
    pub(crate) pending: VecDeque<WorkId>,
    pub(crate) waits: Arc<QueueWaits>,
    /// Bumped each time the worker releases the drainers.
    pub(crate) drain_epoch: u64,
    pub(crate) thread_id: Option<ThreadId>,
    pub(crate) thread: Option<RunningThread>,
    /// The owning handle was dropped on the worker itself, which frees the slot when it exits.
    pub(crate) orphaned: bool,
}

impl QueueSlot {
    fn notify(&self) {
        self.waits.notifyq.wake_one();
    }
}

/// A synchronous canceller waiting for a running handler to return.
struct Canceller {
    work: WorkId,
    sem: Semaphore,
}

pub(crate) struct WorkState {
    works: Slab<WorkSlot>,
    queues: Slab<QueueSlot>,
    pending_cancels: Vec<Canceller>,
    next_gen: u64,
}

impl WorkState {
    pub(crate) fn new() -> WorkState {
        WorkState {
            works: Slab::new(),
            queues: Slab::new(),
            pending_cancels: Vec::new(),
            next_gen: 0,
        }
    }

    fn next_gen(&mut self) -> u64 {
        self.next_gen += 1;
        self.next_gen
    }

    pub(crate) fn insert_work(
        &mut self,
        handler: Handler,
        flags: WorkFlags,
        delay: Option<DelaySlot>,
    ) -> WorkId {
        let gen = self.next_gen();
        let key = self.works.insert(WorkSlot {
            gen,
            handler,
            flags,
            queue: None,
            delay,
            orphaned: false,
            transient: false,
        });
        WorkId { key, gen }
    }

    pub(crate) fn work(&self, id: WorkId) -> Option<&WorkSlot> {
        self.works.get(id.key).filter(|slot| slot.gen == id.gen)
    }

    pub(crate) fn work_mut(&mut self, id: WorkId) -> Option<&mut WorkSlot> {
        self.works.get_mut(id.key).filter(|slot| slot.gen == id.gen)
    }

    /// Remove an item.  The slot is handed back so that the handler, which may own arbitrary
    /// user data, can be dropped after the lock is released.
    fn free_work(&mut self, id: WorkId) -> Option<WorkSlot> {
        self.work(id)?;
        Some(self.works.remove(id.key))
    }

    pub(crate) fn insert_queue(&mut self) -> QueueId {
        let gen = self.next_gen();
        let key = self.queues.insert(QueueSlot {
            gen,
            name: None,
            flags: QueueFlags::empty(),
            pending: VecDeque::new(),
            waits: Arc::new(QueueWaits {
                notifyq: WaitQ::new(),
                drainq: WaitQ::new(),
            }),
            drain_epoch: 0,
            thread_id: None,
            thread: None,
            orphaned: false,
        });
        QueueId { key, gen }
    }

    pub(crate) fn queue(&self, id: QueueId) -> Option<&QueueSlot> {
        self.queues.get(id.key).filter(|slot| slot.gen == id.gen)
    }

    pub(crate) fn queue_mut(&mut self, id: QueueId) -> Option<&mut QueueSlot> {
        self.queues.get_mut(id.key).filter(|slot| slot.gen == id.gen)
    }

    pub(crate) fn free_queue(&mut self, id: QueueId) -> Option<QueueSlot> {
        self.queue(id)?;
        Some(self.queues.remove(id.key))
    }

    /// The busy part of an item's flags.  A freed item is idle.
    pub(crate) fn busy_get(&self, work: WorkId) -> WorkFlags {
        self.work(work)
            .map(|slot| slot.flags.busy())
            .unwrap_or_default()
    }

    /// Submit an item.
    ///
    /// With no `queue`, the item goes back to the queue it was last submitted to.  An item whose
    /// handler is running always goes to the queue it is running on.
    pub(crate) fn submit_locked(
        &mut self,
        work: WorkId,
        queue: Option<QueueId>,
        origin: Origin,
    ) -> Result<SubmitResult> {
        let Some(slot) = self.work(work) else {
            return Err(Error::Busy);
        };
        if slot.orphaned || slot.flags.contains(WorkFlags::CANCELING) {
            return Err(Error::Busy);
        }
        if slot.flags.contains(WorkFlags::QUEUED) {
            return Ok(SubmitResult::AlreadySubmitted);
        }

        let (target, result) = if slot.flags.contains(WorkFlags::RUNNING) {
            (slot.queue, SubmitResult::WasRunning)
        } else {
            (queue.or(slot.queue), SubmitResult::Enqueued)
        };

        let res = self.queue_submit_locked(target, work, origin);
        trace!("submit {:?} to {:?} from {:?}: {:?}", work, target, origin, res);
        res?;

        if let Some(slot) = self.work_mut(work) {
            slot.flags.insert(WorkFlags::QUEUED);
            slot.queue = target;
        }
        Ok(result)
    }

    /// Append an item to a queue's pending list, if the queue is accepting work.
    ///
    /// A draining queue only accepts chained submissions.  A plugged queue rejects everything
    /// once its drain has completed, chained submissions included.
    fn queue_submit_locked(
        &mut self,
        queue: Option<QueueId>,
        work: WorkId,
        origin: Origin,
    ) -> Result<()> {
        let Some(qid) = queue else {
            return Err(Error::InvalidQueue);
        };
        let Some(q) = self.queue_mut(qid) else {
            return Err(Error::InvalidQueue);
        };

        let chained = origin.is_chained_to(qid);
        let draining = q.flags.contains(QueueFlags::DRAIN);
        let plugged = q.flags.contains(QueueFlags::PLUGGED);

        if !q.flags.contains(QueueFlags::STARTED) {
            Err(Error::QueueNotStarted)
        } else if draining && !chained {
            Err(Error::Busy)
        } else if plugged && !draining {
            Err(Error::Busy)
        } else {
            q.pending.push_back(work);
            q.notify();
            Ok(())
        }
    }

    /// Take an item out of its queue's pending list, if it is there.
    fn remove_from_queue_locked(&mut self, work: WorkId) -> bool {
        let Some(slot) = self.work_mut(work) else {
            return false;
        };
        if !slot.flags.test_and_clear(WorkFlags::QUEUED) {
            return false;
        }
        let Some(qid) = slot.queue else {
            return false;
        };
        let Some(q) = self.queue_mut(qid) else {
            return false;
        };
        match q.pending.iter().position(|id| *id == work) {
            Some(pos) => {
                q.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Start cancelling an item, without waiting.
    ///
    /// A queued item is removed from its queue.  If the item is still busy after that, it is
    /// marked `CANCELING` until its handler returns.  Returns the resulting busy flags.
    pub(crate) fn cancel_async_locked(&mut self, work: WorkId) -> WorkFlags {
        let canceling = self
            .work(work)
            .is_some_and(|slot| slot.flags.contains(WorkFlags::CANCELING));
        if !canceling {
            self.remove_from_queue_locked(work);
        }

        if let Some(slot) = self.work_mut(work) {
            if !slot.flags.busy().is_empty() {
                slot.flags.insert(WorkFlags::CANCELING);
            }
        }
        let busy = self.busy_get(work);
        trace!("cancel {:?}: {:?}", work, busy);
        busy
    }

    /// Register a synchronous canceller, if the item is being cancelled.
    ///
    /// The returned semaphore is given once the running handler has returned.
    pub(crate) fn cancel_sync_locked(&mut self, work: WorkId) -> Option<Semaphore> {
        if !self.busy_get(work).contains(WorkFlags::CANCELING) {
            return None;
        }
        let sem = Semaphore::new(0, 1);
        self.pending_cancels.push(Canceller {
            work,
            sem: sem.clone(),
        });
        Some(sem)
    }

    /// Complete a cancellation, releasing every canceller waiting on this item.
    fn finalize_cancel_locked(&mut self, work: WorkId) {
        if let Some(slot) = self.work_mut(work) {
            slot.flags.remove(WorkFlags::CANCELING);
        }
        self.pending_cancels.retain(|wc| {
            if wc.work == work {
                wc.sem.give();
                false
            } else {
                true
            }
        });
    }

    /// Queue a flusher behind an item.
    ///
    /// The flusher goes right after the item if it is still pending, or at the head of the list if
    /// the item is already running.  Returns the semaphore the flusher gives once it has run, or
    /// `None` if the item is idle.
    pub(crate) fn flush_locked(&mut self, work: WorkId) -> Option<Semaphore> {
        let slot = self.work(work)?;
        if !slot
            .flags
            .intersects(WorkFlags::QUEUED | WorkFlags::RUNNING)
        {
            return None;
        }
        let qid = slot.queue?;
        self.queue(qid)?;

        let sem = Semaphore::new(0, 1);
        let done = sem.clone();
        let handler: Box<dyn SimpleAction> = Box::new(move |_: &super::WorkContext<'_>| done.give());
        let flusher = self.insert_work(Arc::new(handler), WorkFlags::QUEUED, None);
        if let Some(fslot) = self.work_mut(flusher) {
            fslot.queue = Some(qid);
            fslot.transient = true;
        }

        let q = self.queue_mut(qid)?;
        match q.pending.iter().position(|id| *id == work) {
            Some(pos) => q.pending.insert(pos + 1, flusher),
            None => q.pending.push_front(flusher),
        }
        q.notify();
        trace!("flush {:?} with {:?}", work, flusher);
        Some(sem)
    }

    /// The worker has returned from an item's handler.
    ///
    /// Returns the slot if the item is done with, to be dropped without the lock held.
    #[must_use]
    pub(crate) fn finish_locked(&mut self, work: WorkId) -> Option<WorkSlot> {
        let slot = self.work_mut(work)?;
        slot.flags.remove(WorkFlags::RUNNING);
        if slot.flags.contains(WorkFlags::CANCELING) {
            self.finalize_cancel_locked(work);
        }
        let slot = self.work(work)?;
        if slot.transient || (slot.orphaned && slot.flags.busy().is_empty()) {
            self.free_work(work)
        } else {
            None
        }
    }

    /// Disarm a delayed item's timeout.
    ///
    /// Returns true if the item was `DELAYED` and the timeout had not already been taken by the
    /// timer.  Either way, once `DELAYED` is clear a late timeout callback does nothing.
    pub(crate) fn unschedule_locked(&mut self, timeouts: &Timeouts, work: WorkId) -> bool {
        let Some(slot) = self.work_mut(work) else {
            return false;
        };
        if !slot.flags.test_and_clear(WorkFlags::DELAYED) {
            return false;
        }
        match slot.delay.as_mut().and_then(|delay| delay.timeout.take()) {
            Some(handle) => timeouts.abort(handle),
            // Scheduled with an unbounded delay, there was never a timeout to lose to.
            None => true,
        }
    }

    /// Schedule a delayable item.
    ///
    /// A zero delay submits right away.  Otherwise the item becomes `DELAYED` and a timeout is
    /// armed to submit it to `queue` later.  The caller decides whether the item is allowed to be
    /// scheduled in its current state.
    pub(crate) fn schedule_locked(
        &mut self,
        kernel: &Kernel,
        work: WorkId,
        queue: Option<QueueId>,
        delay: Timeout,
        origin: Origin,
    ) -> Result<ScheduleResult> {
        let Some(slot) = self.work_mut(work) else {
            return Err(Error::Busy);
        };
        if slot.orphaned {
            return Err(Error::Busy);
        }
        let Some(dslot) = slot.delay.as_mut() else {
            return Err(Error::NotDelayable);
        };
        let queue = queue.or(dslot.queue).or(slot.queue);

        if delay.is_no_wait() {
            return self
                .submit_locked(work, queue, origin)
                .map(ScheduleResult::Submitted);
        }
        if queue.is_none() {
            return Err(Error::InvalidQueue);
        }

        slot.flags.insert(WorkFlags::DELAYED);
        dslot.queue = queue;
        dslot.arm += 1;
        let arm = dslot.arm;
        dslot.timeout = delay.0.map(|ticks| {
            let weak = kernel.downgrade();
            kernel
                .timeouts()
                .add(ticks, move || delayable::timeout_fired(weak, work, arm))
        });
        trace!("schedule {:?} on {:?} after {:?}", work, queue, delay);
        Ok(ScheduleResult::Scheduled)
    }

    /// The owning handle of an item has been dropped.
    ///
    /// The item is unscheduled and dequeued.  If its handler is running, the slot stays until the
    /// worker is done with it.  Otherwise the slot is returned, to be dropped without the lock.
    #[must_use]
    pub(crate) fn release_locked(&mut self, timeouts: &Timeouts, work: WorkId) -> Option<WorkSlot> {
        self.unschedule_locked(timeouts, work);
        self.remove_from_queue_locked(work);
        let slot = self.work_mut(work)?;
        if slot.flags.contains(WorkFlags::RUNNING) {
            slot.orphaned = true;
            None
        } else {
            self.free_work(work)
        }
    }

    #[cfg(test)]
    pub(crate) fn work_count(&self) -> usize {
        self.works.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        let handler: Box<dyn SimpleAction> = Box::new(|_: &super::super::WorkContext<'_>| {});
        Arc::new(handler)
    }

    /// A state with one queue marked started, without a worker behind it.
    fn started() -> (WorkState, QueueId) {
        let mut state = WorkState::new();
        let q = state.insert_queue();
        state
            .queue_mut(q)
            .unwrap()
            .flags
            .insert(QueueFlags::STARTED);
        (state, q)
    }

    #[test]
    fn stale_handles_miss() {
        let mut state = WorkState::new();
        let a = state.insert_work(noop(), WorkFlags::empty(), None);
        assert!(state.free_work(a).is_some());
        let b = state.insert_work(noop(), WorkFlags::empty(), None);
        assert_eq!(a.key, b.key);
        assert!(state.work(a).is_none());
        assert!(state.work(b).is_some());
        assert_eq!(state.submit_locked(a, None, Origin::External), Err(Error::Busy));
    }

    #[test]
    fn submit_checks_queue_state() {
        let mut state = WorkState::new();
        let q = state.insert_queue();
        let w = state.insert_work(noop(), WorkFlags::empty(), None);

        assert_eq!(
            state.submit_locked(w, None, Origin::External),
            Err(Error::InvalidQueue)
        );
        assert_eq!(
            state.submit_locked(w, Some(q), Origin::External),
            Err(Error::QueueNotStarted)
        );
        assert!(state.busy_get(w).is_empty());

        state.queue_mut(q).unwrap().flags.insert(QueueFlags::STARTED);
        assert_eq!(
            state.submit_locked(w, Some(q), Origin::External),
            Ok(SubmitResult::Enqueued)
        );
        for _ in 0..3 {
            assert_eq!(
                state.submit_locked(w, None, Origin::External),
                Ok(SubmitResult::AlreadySubmitted)
            );
        }
        assert_eq!(state.queue(q).unwrap().pending.len(), 1);
        assert_eq!(state.busy_get(w), WorkFlags::QUEUED);
    }

    #[test]
    fn drain_and_plug_precedence() {
        let (mut state, q) = started();
        let w = state.insert_work(noop(), WorkFlags::empty(), None);
        let chained = Origin::Worker(q);

        state.queue_mut(q).unwrap().flags.insert(QueueFlags::DRAIN);
        assert_eq!(state.submit_locked(w, Some(q), Origin::External), Err(Error::Busy));
        let elsewhere = Origin::Worker(QueueId { key: 99, gen: 0 });
        assert_eq!(state.submit_locked(w, Some(q), elsewhere), Err(Error::Busy));
        assert_eq!(state.submit_locked(w, Some(q), chained), Ok(SubmitResult::Enqueued));
        state.cancel_async_locked(w);

        // Draining and plugged: chained submissions still get in until the drain completes.
        state.queue_mut(q).unwrap().flags.insert(QueueFlags::PLUGGED);
        assert_eq!(state.submit_locked(w, Some(q), chained), Ok(SubmitResult::Enqueued));
        state.cancel_async_locked(w);

        // Plugged after the drain: nothing gets in.
        state.queue_mut(q).unwrap().flags.remove(QueueFlags::DRAIN);
        assert_eq!(state.submit_locked(w, Some(q), chained), Err(Error::Busy));
        assert_eq!(state.submit_locked(w, Some(q), Origin::External), Err(Error::Busy));
    }

    #[test]
    fn running_item_goes_back_to_its_queue() {
        let (mut state, q1) = started();
        let q2 = state.insert_queue();
        state.queue_mut(q2).unwrap().flags.insert(QueueFlags::STARTED);
        let w = state.insert_work(noop(), WorkFlags::empty(), None);

        state.submit_locked(w, Some(q1), Origin::External).unwrap();
        // What the worker does when it picks the item up.
        state.queue_mut(q1).unwrap().pending.pop_front();
        let slot = state.work_mut(w).unwrap();
        slot.flags.remove(WorkFlags::QUEUED);
        slot.flags.insert(WorkFlags::RUNNING);

        assert_eq!(
            state.submit_locked(w, Some(q2), Origin::External),
            Ok(SubmitResult::WasRunning)
        );
        assert_eq!(state.queue(q1).unwrap().pending.len(), 1);
        assert!(state.queue(q2).unwrap().pending.is_empty());
    }

    #[test]
    fn cancel_queued_item() {
        let (mut state, q) = started();
        let w = state.insert_work(noop(), WorkFlags::empty(), None);
        state.submit_locked(w, Some(q), Origin::External).unwrap();
        assert!(state.cancel_async_locked(w).is_empty());
        assert!(state.queue(q).unwrap().pending.is_empty());
        assert!(state.cancel_sync_locked(w).is_none());
    }

    #[test]
    fn cancel_running_item_releases_all_cancellers() {
        let (mut state, _q) = started();
        let w = state.insert_work(noop(), WorkFlags::RUNNING, None);

        assert_eq!(
            state.cancel_async_locked(w),
            WorkFlags::RUNNING | WorkFlags::CANCELING
        );
        assert_eq!(state.submit_locked(w, None, Origin::External), Err(Error::Busy));
        let a = state.cancel_sync_locked(w).unwrap();
        let b = state.cancel_sync_locked(w).unwrap();
        assert_eq!(a.count_get(), 0);

        assert!(state.finish_locked(w).is_none());
        assert_eq!(a.count_get(), 1);
        assert_eq!(b.count_get(), 1);
        assert!(state.busy_get(w).is_empty());
        assert!(state.pending_cancels.is_empty());
    }

    #[test]
    fn flusher_placement() {
        let (mut state, q) = started();
        let a = state.insert_work(noop(), WorkFlags::empty(), None);
        let b = state.insert_work(noop(), WorkFlags::empty(), None);
        state.submit_locked(a, Some(q), Origin::External).unwrap();
        state.submit_locked(b, Some(q), Origin::External).unwrap();

        assert!(state.flush_locked(a).is_some());
        let pending: Vec<_> = state.queue(q).unwrap().pending.iter().copied().collect();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0], a);
        assert_eq!(pending[2], b);
        assert!(state.work(pending[1]).unwrap().transient);

        // Once the worker has freed the flusher, only the two items remain.
        assert!(state.finish_locked(pending[1]).is_some());
        assert_eq!(state.work_count(), 2);

        let idle = state.insert_work(noop(), WorkFlags::empty(), None);
        assert!(state.flush_locked(idle).is_none());
    }

    #[test]
    fn release_running_item_defers_free() {
        let (mut state, _q) = started();
        let timeouts = Timeouts::new().unwrap();
        let w = state.insert_work(noop(), WorkFlags::RUNNING, None);
        assert!(state.release_locked(&timeouts, w).is_none());
        assert!(state.work(w).is_some());
        assert_eq!(state.submit_locked(w, None, Origin::External), Err(Error::Busy));
        assert!(state.finish_locked(w).is_some());
        assert!(state.work(w).is_none());
    }
}
