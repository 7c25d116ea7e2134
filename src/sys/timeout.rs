// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Timeout service.
//!
//! A [`Timeouts`] owns a timer thread that runs one-shot callbacks once their deadline has
//! passed.  Callbacks run on the timer thread, with no lock of this service held, so a callback
//! is free to take other locks.  The converse is also allowed: code holding another lock may
//! arm or abort timeouts.
//!
//! A callback that has already been picked up by the timer thread can no longer be aborted, and
//! [`Timeouts::abort`] reports this by returning `false`.  Anyone who needs to know whether a
//! late callback is still "theirs" has to check under their own lock.

use std::collections::{BTreeMap, HashMap};

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::Result,
    sync::Arc,
    sys::{thread::RunningThread, thread::Thread, wait_q::WaitQ},
    time::{self, Duration, Instant, Tick},
};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A reference to an armed timeout.
///
/// Handles are never reused within one [`Timeouts`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(u64);

struct TimerState {
    /// Armed callbacks, ordered by deadline and then by arming order.
    armed: BTreeMap<(Tick, u64), Callback>,
    /// Deadline of each armed handle.
    index: HashMap<u64, Tick>,
    next_id: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wake: WaitQ,
}

/// The timeout service.
pub struct Timeouts {
    inner: Arc<TimerInner>,
    thread: Option<RunningThread>,
}

impl Timeouts {
    /// Start a new timeout service, with its own timer thread.
    pub fn new() -> Result<Timeouts> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                armed: BTreeMap::new(),
                index: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            wake: WaitQ::new(),
        });

        let mut thread = Thread::new();
        thread.set_name("kwork-timer");
        let timer = inner.clone();
        let thread = thread.spawn(move || timer.run())?;

        Ok(Timeouts {
            inner,
            thread: Some(thread),
        })
    }

    /// Arm a callback to run once `delay` has elapsed.
    ///
    /// The deadline is rounded up by one tick, as the current tick is already partly over.  The
    /// callback therefore never runs early.
    pub fn add<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let at = time::now()
            .ticks()
            .saturating_add(delay.ticks())
            .saturating_add(1);
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.armed.insert((at, id), Box::new(callback));
        state.index.insert(id, at);
        self.inner.wake.wake_one();
        TimeoutHandle(id)
    }

    /// Abort an armed timeout.
    ///
    /// Returns true if the callback was removed before the timer thread took it.
    pub fn abort(&self, handle: TimeoutHandle) -> bool {
        let mut state = self.inner.state.lock();
        match state.index.remove(&handle.0) {
            Some(at) => state.armed.remove(&(at, handle.0)).is_some(),
            None => false,
        }
    }

    /// The tick at which an armed timeout will fire.  `None` if it is no longer armed.
    pub fn expires(&self, handle: TimeoutHandle) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .index
            .get(&handle.0)
            .map(|at| Instant::from_ticks(*at))
    }

    /// How long until an armed timeout fires.  `None` if it is no longer armed.
    pub fn remaining(&self, handle: TimeoutHandle) -> Option<Duration> {
        let at = self.expires(handle)?;
        let now = time::now();
        Some(Duration::from_ticks(at.ticks().saturating_sub(now.ticks())))
    }

    /// The number of armed timeouts.
    pub fn armed_count(&self) -> usize {
        self.inner.state.lock().index.len()
    }
}

impl TimerInner {
    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                debug!("timer thread exiting");
                return;
            }
            let now = time::now().ticks();
            match state.armed.first_key_value().map(|(key, _)| *key) {
                Some((at, id)) if at <= now => {
                    state.index.remove(&id);
                    if let Some(callback) = state.armed.remove(&(at, id)) {
                        MutexGuard::unlocked(&mut state, callback);
                    }
                }
                Some((at, _)) => {
                    // Past what the host clock can represent, this waits until woken.
                    let deadline = time::std_instant(Instant::from_ticks(at));
                    self.wake.wait_until(&mut state, deadline);
                }
                None => self.wake.wait(&mut state),
            }
        }
    }
}

impl Drop for Timeouts {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.wake.wake_all();
        if let Some(mut thread) = self.thread.take() {
            // A callback can hold the last reference to whatever owns us.
            if !thread.is_current() {
                let _ = thread.join(time::Forever);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::sync::Semaphore;
    use crate::time::Forever;

    #[test]
    fn fires_after_delay() {
        let timeouts = Timeouts::new().unwrap();
        let sem = Semaphore::new(0, 1);
        let fired = sem.clone();
        let start = time::now();
        timeouts.add(Duration::millis(20), move || fired.give());
        sem.take(Forever).unwrap();
        assert!((time::now() - start) >= Duration::millis(20));
        assert_eq!(timeouts.armed_count(), 0);
    }

    #[test]
    fn fires_in_deadline_order() {
        let timeouts = Timeouts::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Semaphore::new(0, 3);
        for (tag, ms) in [(2, 30), (0, 10), (1, 20)] {
            let order = order.clone();
            let done = done.clone();
            timeouts.add(Duration::millis(ms), move || {
                order.lock().push(tag);
                done.give();
            });
        }
        for _ in 0..3 {
            done.take(Forever).unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn abort_preempts_callback() {
        let timeouts = Timeouts::new().unwrap();
        let sem = Semaphore::new(0, 1);
        let fired = sem.clone();
        let handle = timeouts.add(Duration::millis(50), move || fired.give());
        assert!(timeouts.expires(handle).is_some());
        assert!(timeouts.remaining(handle).unwrap() <= Duration::millis(50) + Duration::from_ticks(1));
        assert!(timeouts.abort(handle));
        assert!(!timeouts.abort(handle));
        assert_eq!(timeouts.expires(handle), None);
        assert!(sem.take(Duration::millis(100)).is_err());
    }

    #[test]
    fn abort_after_fire_is_false() {
        let timeouts = Timeouts::new().unwrap();
        let sem = Semaphore::new(0, 1);
        let fired = sem.clone();
        let handle = timeouts.add(Duration::from_ticks(0), move || fired.give());
        sem.take(Forever).unwrap();
        assert!(!timeouts.abort(handle));
        assert_eq!(timeouts.remaining(handle), None);
    }

    #[test]
    fn far_deadline_does_not_block_near_one() {
        let timeouts = Timeouts::new().unwrap();
        let far = timeouts.add(Duration::from_ticks(Tick::MAX - 5), || {});
        assert!(timeouts.remaining(far).unwrap() > Duration::secs(3600));

        let sem = Semaphore::new(0, 1);
        let fired = sem.clone();
        timeouts.add(Duration::millis(5), move || fired.give());
        assert_eq!(sem.take(Duration::secs(5)), Ok(()));
        assert!(timeouts.abort(far));
    }
}
