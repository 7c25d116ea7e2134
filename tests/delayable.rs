// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Delayable work: scheduling, rescheduling, cancellation and flush.

mod common;

use core::sync::atomic::Ordering;

use kwork::{
    error::Error,
    sync::{atomic::AtomicUsize, Arc},
    sys::sync::Semaphore,
    time::{self, Duration, Forever, NoWait},
    work::{ScheduleResult, SubmitResult, WorkFlags},
};
use parking_lot::Mutex;
use rand::Rng;
use rand_pcg::Pcg32;

use common::{setup, sleep_ms, wait_for, Gate};

fn counting(kernel: &kwork::Kernel) -> (kwork::DelayableWork, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let work = {
        let count = count.clone();
        kernel.new_delayable(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    (work, count)
}

#[test]
fn zero_delay_submits_immediately() {
    let (kernel, queue) = setup();
    let gate = Gate::new(&kernel);
    let (work, count) = counting(&kernel);

    gate.close(&queue);
    assert_eq!(
        work.schedule_for_queue(&queue, NoWait),
        Ok(ScheduleResult::Submitted(SubmitResult::Enqueued))
    );
    assert_eq!(work.busy_get(), WorkFlags::QUEUED);
    assert_eq!(queue.pending_count(), 1);

    gate.open();
    assert!(work.flush());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn delay_is_respected() {
    let (kernel, queue) = setup();
    let ran_at = Arc::new(Mutex::new(None));
    let done = Semaphore::new(0, 1);
    let work = {
        let ran_at = ran_at.clone();
        let done = done.clone();
        kernel.new_delayable(move |ctx| {
            assert!(ctx.is_delayable());
            *ran_at.lock() = Some(time::now());
            done.give();
        })
    };

    let start = time::now();
    assert_eq!(
        work.schedule_for_queue(&queue, Duration::millis(30)),
        Ok(ScheduleResult::Scheduled)
    );
    assert_eq!(work.busy_get(), WorkFlags::DELAYED);
    done.take(Forever).unwrap();

    let elapsed = ran_at.lock().unwrap() - start;
    assert!(elapsed >= Duration::millis(30));
    assert!(elapsed < Duration::millis(1030));
}

#[test]
fn schedule_leaves_pending_work_alone() {
    let (kernel, queue) = setup();
    let (work, count) = counting(&kernel);

    work.schedule_for_queue(&queue, Duration::secs(10)).unwrap();
    let expires = work.expires_get();
    assert_eq!(
        work.schedule_for_queue(&queue, Duration::millis(1)),
        Err(Error::Busy)
    );
    assert_eq!(work.expires_get(), expires);

    assert!(work.cancel().is_empty());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn reschedule_moves_the_deadline() {
    let (kernel, queue) = setup();
    let (work, count) = counting(&kernel);

    work.schedule_for_queue(&queue, Duration::secs(10)).unwrap();
    assert_eq!(
        work.reschedule_for_queue(&queue, Duration::millis(10)),
        Ok(ScheduleResult::Scheduled)
    );
    assert!(wait_for(Duration::secs(5), || count.load(Ordering::SeqCst) == 1));
    sleep_ms(100);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!work.is_pending());
}

#[test]
fn schedule_reuses_recorded_queue() {
    let (kernel, queue) = setup();
    let (work, count) = counting(&kernel);

    assert_eq!(work.schedule(Duration::millis(5)), Err(Error::InvalidQueue));
    work.schedule_for_queue(&queue, NoWait).unwrap();
    work.flush();
    assert_eq!(work.schedule(Duration::millis(5)), Ok(ScheduleResult::Scheduled));
    assert!(wait_for(Duration::secs(5), || count.load(Ordering::SeqCst) == 2));
    assert_eq!(work.reschedule(NoWait), Ok(ScheduleResult::Submitted(SubmitResult::Enqueued)));
    work.flush();
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn cancel_disarms_timeout() {
    let (kernel, queue) = setup();
    let (work, count) = counting(&kernel);

    work.schedule_for_queue(&queue, Duration::millis(30)).unwrap();
    assert!(work.cancel().is_empty());
    assert!(!work.is_pending());
    sleep_ms(80);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    work.schedule_for_queue(&queue, Duration::millis(30)).unwrap();
    assert!(work.cancel_sync());
    sleep_ms(80);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(!work.cancel_sync());
}

#[test]
fn cancel_sync_waits_for_running_handler() {
    let (kernel, queue) = setup();
    let started = Semaphore::new(0, 1);
    let finished = Arc::new(AtomicUsize::new(0));
    let work = {
        let started = started.clone();
        let finished = finished.clone();
        kernel.new_delayable(move |ctx| {
            started.give();
            sleep_ms(50);
            // Re-arming is still allowed while the cancel waits.
            assert_eq!(
                ctx.reschedule(Duration::secs(10)),
                Ok(ScheduleResult::Scheduled)
            );
            finished.fetch_add(1, Ordering::SeqCst);
        })
    };

    work.schedule_for_queue(&queue, NoWait).unwrap();
    started.take(Forever).unwrap();
    assert!(work.cancel_sync());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(work.busy_get(), WorkFlags::DELAYED);

    assert!(work.cancel_sync());
    assert!(work.busy_get().is_empty());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn flush_runs_delayed_work_now() {
    let (kernel, queue) = setup();
    let (work, count) = counting(&kernel);

    work.schedule_for_queue(&queue, Forever).unwrap();
    assert_eq!(work.busy_get(), WorkFlags::DELAYED);
    assert_eq!(work.remaining_get(), Duration::from_ticks(0));

    let start = time::now();
    assert!(work.flush());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(time::now() - start < Duration::secs(1));
    assert!(!work.flush());
}

#[test]
fn expiry_introspection() {
    let (kernel, queue) = setup();
    let (work, _count) = counting(&kernel);

    assert_eq!(work.remaining_get(), Duration::from_ticks(0));
    work.schedule_for_queue(&queue, Duration::secs(1)).unwrap();

    let remaining = work.remaining_get();
    assert!(remaining <= Duration::secs(1) + Duration::from_ticks(1));
    assert!(remaining > Duration::millis(500));
    assert!(work.expires_get() > time::now());

    work.cancel();
    assert_eq!(work.remaining_get(), Duration::from_ticks(0));
}

#[test]
fn handler_reschedules_itself_periodically() {
    let (kernel, queue) = setup();
    let count = Arc::new(AtomicUsize::new(0));
    let done = Semaphore::new(0, 1);
    let work = {
        let count = count.clone();
        let done = done.clone();
        kernel.new_delayable(move |ctx| {
            if count.fetch_add(1, Ordering::SeqCst) + 1 < 5 {
                assert_eq!(
                    ctx.reschedule(Duration::millis(5)),
                    Ok(ScheduleResult::Scheduled)
                );
            } else {
                done.give();
            }
        })
    };

    work.schedule_for_queue(&queue, Duration::millis(5)).unwrap();
    done.take(Forever).unwrap();
    assert!(wait_for(Duration::secs(5), || !work.is_pending()));
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn reschedule_racing_timeout_queues_once() {
    let (kernel, queue) = setup();
    let gate = Gate::new(&kernel);
    let (work, count) = counting(&kernel);
    let mut rng = Pcg32::new(1, 1);

    // With the worker held, every expiry can only submit; none of them may add a second entry.
    gate.close(&queue);
    for _ in 0..50 {
        for _ in 0..rng.gen_range(1..6) {
            let ticks = rng.gen_range(1..4);
            work.reschedule_for_queue(&queue, Duration::from_ticks(ticks))
                .unwrap();
            if rng.gen_range(0..4) == 0 {
                std::thread::sleep(std::time::Duration::from_micros(300));
            }
            assert!(queue.pending_count() <= 1);
        }
        assert!(wait_for(Duration::secs(5), || work.busy_get() == WorkFlags::QUEUED));
        assert_eq!(queue.pending_count(), 1);
    }

    // Superseded timeouts that fire late leave the item alone.
    sleep_ms(5);
    assert_eq!(work.busy_get(), WorkFlags::QUEUED);
    assert_eq!(queue.pending_count(), 1);

    gate.open();
    assert!(work.flush());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!work.is_pending());
}

#[test]
fn reschedule_racing_timeout_never_overlaps() {
    let (kernel, queue) = setup();
    let mut rng = Pcg32::new(1, 1);
    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let work = {
        let active = active.clone();
        let overlap = overlap.clone();
        let runs = runs.clone();
        kernel.new_delayable(move |_| {
            if active.fetch_add(1, Ordering::SeqCst) != 0 {
                overlap.fetch_add(1, Ordering::SeqCst);
            }
            runs.fetch_add(1, Ordering::SeqCst);
            active.fetch_sub(1, Ordering::SeqCst);
        })
    };

    for _ in 0..300 {
        let ticks = rng.gen_range(1..4);
        work.reschedule_for_queue(&queue, Duration::from_ticks(ticks))
            .unwrap();
        if rng.gen_range(0..4) == 0 {
            std::thread::sleep(std::time::Duration::from_micros(300));
        }
        assert!(queue.pending_count() <= 1);
    }
    work.flush();

    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    assert!(runs.load(Ordering::SeqCst) >= 1);
}

#[test]
fn far_delay_leaves_timer_running() {
    let (kernel, queue) = setup();
    let (far, far_count) = counting(&kernel);
    let (near, near_count) = counting(&kernel);

    assert_eq!(
        far.schedule_for_queue(&queue, Duration::from_ticks(u64::MAX - 5)),
        Ok(ScheduleResult::Scheduled)
    );
    assert!(far.remaining_get() > Duration::secs(3600));

    near.schedule_for_queue(&queue, Duration::millis(5)).unwrap();
    assert!(wait_for(Duration::secs(5), || near_count.load(Ordering::SeqCst) == 1));

    assert_eq!(far.busy_get(), WorkFlags::DELAYED);
    assert!(far.cancel().is_empty());
    assert_eq!(far_count.load(Ordering::SeqCst), 0);
}

#[test]
fn dropping_delayed_work_disarms_it() {
    let (kernel, queue) = setup();
    let (work, count) = counting(&kernel);
    work.schedule_for_queue(&queue, Duration::millis(20)).unwrap();
    drop(work);
    sleep_ms(60);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}
