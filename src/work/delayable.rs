// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Delayable work.
//!
//! A delayable item is a work item plus a timeout.  Scheduling it marks it `DELAYED` and arms the
//! timeout; when the timeout fires, the item is submitted to the queue recorded at schedule time.
//! Whoever clears `DELAYED` under the kernel lock owns the outcome: a timeout that fires after
//! the item was unscheduled, cancelled or rescheduled does nothing.

use log::{trace, warn};

use crate::{
    error::{Error, Result},
    sync::Weak,
    time::{self, Duration, Forever, Instant, Timeout},
};

use super::{
    flags::WorkFlags,
    kernel::{Kernel, KernelInner, QueueId, WorkId},
    state::DelaySlot,
    Origin, ScheduleResult, SimpleAction, Work, WorkQueue,
};

/// A work item that can be submitted after a delay.
pub struct DelayableWork {
    work: Work,
}

impl DelayableWork {
    /// Construct a new delayable work item from the given action.
    pub fn new<H: SimpleAction>(kernel: &Kernel, handler: H) -> DelayableWork {
        let delay = DelaySlot {
            queue: None,
            timeout: None,
            arm: 0,
        };
        DelayableWork {
            work: Work::with_flags(kernel, handler, WorkFlags::DELAYABLE, Some(delay)),
        }
    }

    /// The item's handle in its kernel.
    pub fn id(&self) -> WorkId {
        self.work.id()
    }

    fn kernel(&self) -> &Kernel {
        self.work.kernel()
    }

    fn queue_id(&self, queue: &WorkQueue) -> Result<QueueId> {
        if self.kernel().same(queue.kernel()) {
            Ok(queue.id())
        } else {
            Err(Error::InvalidQueue)
        }
    }

    /// Schedule the item on the queue it was last scheduled or submitted to.
    ///
    /// See [`schedule_for_queue`](DelayableWork::schedule_for_queue).
    pub fn schedule<T: Into<Timeout>>(&self, delay: T) -> Result<ScheduleResult> {
        self.schedule_inner(None, delay.into())
    }

    /// Schedule the item to be submitted to `queue` after `delay`.
    ///
    /// Only an idle item, or one whose handler is running, can be scheduled.  An item that is
    /// already delayed or queued is left alone, and this returns [`Error::Busy`]; use
    /// [`reschedule`](DelayableWork::reschedule) to move its deadline.
    ///
    /// A zero delay ([`NoWait`](crate::time::NoWait)) submits the item right away, exactly as
    /// [`Work::submit_to_queue`] would.  A delay of [`Forever`] leaves the item delayed until it
    /// is rescheduled, flushed or cancelled.
    pub fn schedule_for_queue<T: Into<Timeout>>(
        &self,
        queue: &WorkQueue,
        delay: T,
    ) -> Result<ScheduleResult> {
        self.schedule_inner(Some(self.queue_id(queue)?), delay.into())
    }

    fn schedule_inner(&self, queue: Option<QueueId>, delay: Timeout) -> Result<ScheduleResult> {
        let kernel = self.kernel();
        let mut state = kernel.lock();
        if !(state.busy_get(self.id()) & !WorkFlags::RUNNING).is_empty() {
            return Err(Error::Busy);
        }
        state.schedule_locked(kernel, self.id(), queue, delay, Origin::External)
    }

    /// Move the deadline of the item, on the queue it was last scheduled or submitted to.
    pub fn reschedule<T: Into<Timeout>>(&self, delay: T) -> Result<ScheduleResult> {
        reschedule(self.kernel(), self.id(), None, delay.into(), Origin::External)
    }

    /// Unschedule the item, and schedule it again on `queue` after `delay`.
    ///
    /// Unlike [`schedule_for_queue`](DelayableWork::schedule_for_queue), this works whatever state
    /// the item is in.  An item that is already queued stays queued, and will be queued again
    /// when the new delay expires if it has run by then.
    pub fn reschedule_for_queue<T: Into<Timeout>>(
        &self,
        queue: &WorkQueue,
        delay: T,
    ) -> Result<ScheduleResult> {
        reschedule(
            self.kernel(),
            self.id(),
            Some(self.queue_id(queue)?),
            delay.into(),
            Origin::External,
        )
    }

    /// Cancel the item, without waiting.
    ///
    /// The timeout is disarmed, and then the item is cancelled as [`Work::cancel`] does.
    pub fn cancel(&self) -> WorkFlags {
        let kernel = self.kernel();
        let mut state = kernel.lock();
        state.unschedule_locked(kernel.timeouts(), self.id());
        state.cancel_async_locked(self.id())
    }

    /// Cancel the item, and wait for a running handler to return.
    ///
    /// Once this returns the item is idle, and no late timeout can submit it.  Returns whether it
    /// was busy when called.
    pub fn cancel_sync(&self) -> bool {
        let kernel = self.kernel();
        let wait = {
            let mut state = kernel.lock();
            if state.busy_get(self.id()).is_empty() {
                return false;
            }
            state.unschedule_locked(kernel.timeouts(), self.id());
            state.cancel_async_locked(self.id());
            state.cancel_sync_locked(self.id())
        };
        if let Some(sem) = wait {
            let _ = sem.take(Forever);
        }
        true
    }

    /// Run the item now if it is delayed, and wait for it to complete.
    ///
    /// Returns false right away if the item is idle.
    pub fn flush(&self) -> bool {
        let kernel = self.kernel();
        let sem = {
            let mut state = kernel.lock();
            let id = self.id();
            if state.busy_get(id).is_empty() {
                return false;
            }
            if state.unschedule_locked(kernel.timeouts(), id) {
                let queue = state
                    .work(id)
                    .and_then(|slot| slot.delay.as_ref())
                    .and_then(|delay| delay.queue);
                if let Err(err) = state.submit_locked(id, queue, Origin::External) {
                    trace!("flush of {:?} could not submit: {}", id, err);
                }
            }
            state.flush_locked(id)
        };
        match sem {
            Some(sem) => {
                let _ = sem.take(Forever);
                true
            }
            None => false,
        }
    }

    /// The busy flags of this item: any of `RUNNING`, `CANCELING`, `QUEUED` and `DELAYED`.
    pub fn busy_get(&self) -> WorkFlags {
        self.work.busy_get()
    }

    /// Is the item busy at all.
    pub fn is_pending(&self) -> bool {
        self.work.is_pending()
    }

    /// When the timeout will submit the item.
    ///
    /// Returns the current time if the item is not waiting on a timeout.
    pub fn expires_get(&self) -> Instant {
        let kernel = self.kernel();
        let state = kernel.lock();
        state
            .work(self.id())
            .filter(|slot| slot.flags.contains(WorkFlags::DELAYED))
            .and_then(|slot| slot.delay.as_ref())
            .and_then(|delay| delay.timeout)
            .and_then(|handle| kernel.timeouts().expires(handle))
            .unwrap_or_else(time::now)
    }

    /// How long until the timeout submits the item.  Zero if it is not waiting on a timeout.
    pub fn remaining_get(&self) -> Duration {
        let kernel = self.kernel();
        let state = kernel.lock();
        state
            .work(self.id())
            .filter(|slot| slot.flags.contains(WorkFlags::DELAYED))
            .and_then(|slot| slot.delay.as_ref())
            .and_then(|delay| delay.timeout)
            .and_then(|handle| kernel.timeouts().remaining(handle))
            .unwrap_or(Duration::from_ticks(0))
    }
}

impl core::fmt::Debug for DelayableWork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "DelayableWork({:?})", self.id())
    }
}

/// Unschedule, then schedule again, whatever the item's state.
pub(crate) fn reschedule(
    kernel: &Kernel,
    work: WorkId,
    queue: Option<QueueId>,
    delay: Timeout,
    origin: Origin,
) -> Result<ScheduleResult> {
    let mut state = kernel.lock();
    state.unschedule_locked(kernel.timeouts(), work);
    state.schedule_locked(kernel, work, queue, delay, origin)
}

/// A delayed item's timeout has expired.
///
/// `arm` identifies the scheduling this timeout belongs to.  If the item has been unscheduled or
/// re-armed since, this timeout lost the race and does nothing.
pub(crate) fn timeout_fired(kernel: Weak<KernelInner>, work: WorkId, arm: u64) {
    let Some(inner) = kernel.upgrade() else {
        return;
    };
    let kernel = Kernel { inner };

    let (queue, res) = {
        let mut state = kernel.lock();
        let Some(slot) = state.work_mut(work) else {
            return;
        };
        let Some(delay) = slot.delay.as_mut() else {
            return;
        };
        if delay.arm != arm || !slot.flags.test_and_clear(WorkFlags::DELAYED) {
            trace!("stale timeout for {:?}", work);
            return;
        }
        delay.timeout = None;
        let queue = delay.queue;
        (queue, state.submit_locked(work, queue, Origin::External))
    };

    if let Err(err) = res {
        warn!("delayed {:?} not submitted to {:?}: {}", work, queue, err);
    }
}
