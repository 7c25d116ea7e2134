// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Work Queues
//!
//! # Work Queues and Work
//!
//! A work queue is a single thread that runs a FIFO of work items, one after another.  Producers
//! on any thread submit [`Work`] items to a [`WorkQueue`], and the queue's worker calls each item's
//! handler in submission order.  Handlers on the same queue never run concurrently, and a given
//! item never runs on two workers at once: an item that is resubmitted while its handler is
//! running goes back to the queue it is running on.
//!
//! In addition to plain work, there is [`DelayableWork`], which is submitted by a timeout once a
//! delay has elapsed.  The delay can be re-armed with [`DelayableWork::reschedule`], which is the
//! usual way of building a periodic action.
//!
//! All of the items and queues created from one [`Kernel`] share one lock.  It is never held while
//! a handler runs, or while anything waits.
//!
//! Submission, cancellation and flushing follow the classic kernel work API:
//!
//! - [`Work::cancel`] removes a pending item, and [`Work::cancel_sync`] additionally waits for a
//!   running handler to return.
//! - [`Work::flush`] waits for a pending or running item to complete, without cancelling it.
//! - [`WorkQueue::drain`] waits until the queue is empty, rejecting outside submissions while it
//!   waits, and can leave the queue plugged until [`WorkQueue::unplug`].
//!
//! A handler gets a [`WorkContext`], which is how it resubmits itself or submits other work as
//! the worker of its queue.  Such "chained" submissions are still accepted while the queue drains.
//!
//! ```
//! use kwork::work::{Kernel, WorkQueueConfig};
//!
//! let kernel = Kernel::new().unwrap();
//! let queue = kernel.new_queue();
//! queue.start(0, 0, &WorkQueueConfig::default()).unwrap();
//!
//! let work = kernel.new_work(|_ctx| println!("hello from the worker"));
//! work.submit_to_queue(&queue).unwrap();
//! work.flush();
//! ```
//!
//! Work Queues can also be declared statically with the `define_work_queue!` macro, this macro
//! requires the name of the symbol for the work queue, the stack size, and then zero or more
//! optional arguments, defined by the fields in the [`WorkQueueDeclArgs`] struct.  For example:
//!
//! ```
//! use kwork::{define_work_queue, work::Kernel};
//!
//! define_work_queue!(MY_WORKQ, 65536, no_yield = true, priority = 2);
//!
//! let kernel = Kernel::new().unwrap();
//! let my_workq = MY_WORKQ.start(&kernel).unwrap();
//! let action = kernel.new_work(|_| {});
//! action.submit_to_queue(my_workq).unwrap();
//! ```

use core::{cell::UnsafeCell, sync::atomic::Ordering};

use crate::{
    error::{Error, Result},
    sync::atomic::AtomicBool,
    time::Timeout,
};

mod delayable;
mod flags;
mod item;
mod kernel;
mod queue;
mod state;

pub use delayable::DelayableWork;
pub use flags::{QueueFlags, WorkFlags};
pub use item::Work;
pub use kernel::{Kernel, QueueId, WorkId};
pub use queue::{WorkQueue, WorkQueueConfig};

/// Possible returns from work queue submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    /// This work was already in a queue.
    AlreadySubmitted,
    /// The work has been added to the specified queue.
    Enqueued,
    /// The work was running, and has been queued to the queue that was running it.
    WasRunning,
}

impl SubmitResult {
    /// Does this result indicate that the work was enqueued?
    pub fn enqueued(self) -> bool {
        matches!(self, Self::Enqueued | Self::WasRunning)
    }

    /// The classic non-negative result code: 0, 1 or 2.
    pub fn code(self) -> i32 {
        match self {
            Self::AlreadySubmitted => 0,
            Self::Enqueued => 1,
            Self::WasRunning => 2,
        }
    }
}

/// Possible returns from scheduling delayable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    /// A timeout has been armed that will submit the work.
    Scheduled,
    /// The delay was zero, and the work was submitted directly.
    Submitted(SubmitResult),
}

/// Where a submission comes from.
///
/// Submissions made by a queue's own worker (from inside a handler) are "chained", and are
/// accepted while that queue is draining.  Handlers normally get this right by submitting through
/// their [`WorkContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Any thread other than a worker, or a timer.
    External,
    /// The worker of the given queue.
    Worker(QueueId),
}

impl Origin {
    pub(crate) fn is_chained_to(self, queue: QueueId) -> bool {
        matches!(self, Origin::Worker(q) if q == queue)
    }
}

/// A simple action that just does something with its data.
///
/// It manages its associated data however it wishes, and is responsible for re-queuing as needed.
///
/// Note, specifically, that the act does not take a mutable reference.  Handlers are shared
/// between the item's owner and the worker, so any mutable state needs interior mutability.
/// Closures taking a `&WorkContext` implement this trait.
pub trait SimpleAction: Send + Sync + 'static {
    /// Perform the action.
    fn act(&self, ctx: &WorkContext<'_>);
}

impl<F> SimpleAction for F
where
    F: Fn(&WorkContext<'_>) + Send + Sync + 'static,
{
    fn act(&self, ctx: &WorkContext<'_>) {
        self(ctx)
    }
}

/// What a handler knows about the item it is running for.
pub struct WorkContext<'a> {
    kernel: &'a Kernel,
    work: WorkId,
    queue: QueueId,
    delayable: bool,
}

impl<'a> WorkContext<'a> {
    pub(crate) fn new(kernel: &'a Kernel, work: WorkId, queue: QueueId, delayable: bool) -> Self {
        WorkContext {
            kernel,
            work,
            queue,
            delayable,
        }
    }

    /// The item being run.
    pub fn work_id(&self) -> WorkId {
        self.work
    }

    /// The queue running it.
    pub fn queue_id(&self) -> QueueId {
        self.queue
    }

    /// Submissions made through this context come from the worker.
    pub fn origin(&self) -> Origin {
        Origin::Worker(self.queue)
    }

    /// Is the running item a [`DelayableWork`].
    pub fn is_delayable(&self) -> bool {
        self.delayable
    }

    /// Submit the running item again.
    ///
    /// It is appended behind whatever is already pending on this queue.
    pub fn resubmit(&self) -> Result<SubmitResult> {
        self.kernel
            .lock()
            .submit_locked(self.work, Some(self.queue), self.origin())
    }

    /// Submit another item to this queue, as its worker.
    pub fn submit(&self, work: &Work) -> Result<SubmitResult> {
        if !self.kernel.same(work.kernel()) {
            return Err(Error::InvalidQueue);
        }
        self.kernel
            .lock()
            .submit_locked(work.id(), Some(self.queue), self.origin())
    }

    /// Re-arm the running delayable item to run again on this queue after `delay`.
    ///
    /// Returns [`Error::NotDelayable`] for plain work.
    pub fn reschedule<T: Into<Timeout>>(&self, delay: T) -> Result<ScheduleResult> {
        if !self.delayable {
            return Err(Error::NotDelayable);
        }
        delayable::reschedule(self.kernel, self.work, Some(self.queue), delay.into(), self.origin())
    }
}

/// The WorkQueue decl args as a struct, so we can have a default, and the macro can fill in those
/// specified by the user.
pub struct WorkQueueDeclArgs {
    /// Should this work queue call yield after each queued item.
    pub no_yield: bool,
    /// Is this work queue thread "essential".
    ///
    /// If an essential worker dies from a panic, the process is aborted.
    pub essential: bool,
    /// Thread priority for the work queue thread.
    pub priority: i32,
}

impl WorkQueueDeclArgs {
    /// Like `Default::default`, but const.
    pub const fn default_values() -> Self {
        Self {
            no_yield: false,
            essential: false,
            priority: 0,
        }
    }
}

/// A static declaration of a work-queue.  This associates a work queue, with a stack size, and an
/// atomic to determine if it has been started.
pub struct WorkQueueDecl<const SIZE: usize> {
    queue: UnsafeCell<Option<WorkQueue>>,
    name: &'static str,
    args: WorkQueueDeclArgs,
    started: AtomicBool,
}

// SAFETY: The queue is only written once, inside a critical section, before `started` is set.
// After that it is only read.
unsafe impl<const SIZE: usize> Sync for WorkQueueDecl<SIZE> {}

impl<const SIZE: usize> WorkQueueDecl<SIZE> {
    /// Static constructor.  Mostly for use by the macro.
    pub const fn new(name: &'static str, args: WorkQueueDeclArgs) -> Self {
        Self {
            queue: UnsafeCell::new(None),
            name,
            args,
            started: AtomicBool::new(false),
        }
    }

    /// Start the work queue thread, if needed, and return a reference to it.
    ///
    /// Only the first call starts a queue, in the given kernel.  Later calls return that same
    /// queue, whatever kernel they pass.
    pub fn start(&'static self, kernel: &Kernel) -> Result<&'static WorkQueue> {
        critical_section::with(|_cs| {
            if !self.started.load(Ordering::Acquire) {
                let queue = WorkQueue::new(kernel);
                let config = WorkQueueConfig {
                    name: Some(self.name.to_owned()),
                    no_yield: self.args.no_yield,
                    essential: self.args.essential,
                };
                queue.start(SIZE, self.args.priority, &config)?;

                // SAFETY: Starting is coordinated by the atomic, as well as being protected in a
                // critical section.  No reference to the contents exists before `started` is set.
                unsafe {
                    *self.queue.get() = Some(queue);
                }
                self.started.store(true, Ordering::Release);
            }

            // SAFETY: `started` is only set once the queue has been written, and it is never
            // written again.
            match unsafe { &*self.queue.get() } {
                Some(queue) => Ok(queue),
                None => Err(Error::InvalidQueue),
            }
        })
    }
}

/// Declare a static work queue.
///
/// This declares a static work queue (of type [`WorkQueueDecl`]).  This will have a single method
/// `.start(&kernel)` which can be used to start the work queue, as well as return the persistent
/// handle that can be used to enqueue to it.
#[macro_export]
macro_rules! define_work_queue {
    ($name:ident, $stack_size:expr) => {
        $crate::define_work_queue!($name, $stack_size,);
    };
    ($name:ident, $stack_size:expr, $($key:ident = $value:expr),* $(,)?) => {
        static $name: $crate::work::WorkQueueDecl<$stack_size> = {
            const _KWORK_ARGS: $crate::work::WorkQueueDeclArgs = $crate::work::WorkQueueDeclArgs {
                $($key: $value,)*
                ..$crate::work::WorkQueueDeclArgs::default_values()
            };
            $crate::work::WorkQueueDecl::new(stringify!($name), _KWORK_ARGS)
        };
    };
}
