// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Time types for the work engine.
//!
//! Time is counted in ticks of a fixed system clock, [`SYS_FREQUENCY`] ticks per second, starting
//! from the first time the clock is read.  The [`Duration`] and [`Instant`] types are the ones
//! from the [`fugit`] crate over a `u64` tick count, so conversions such as
//! `Duration::millis(10)` or `Duration::millis_at_least(10)` are available.
//!
//! Blocking operations take a [`Timeout`], which can be built from a [`Duration`], or from the
//! markers [`Forever`] and [`NoWait`].

use core::time::Duration as StdDuration;
use std::sync::OnceLock;

/// The underlying tick count.
pub type Tick = u64;

/// Ticks per second of the system clock.
pub const SYS_FREQUENCY: u32 = 10_000;

/// A span of time, in system ticks.
pub type Duration = fugit::Duration<Tick, 1, SYS_FREQUENCY>;

/// An absolute point in time, in system ticks since the clock was first read.
pub type Instant = fugit::Instant<Tick, 1, SYS_FREQUENCY>;

/// Wait as long as necessary.
#[derive(Clone, Copy, Debug)]
pub struct Forever;

/// Do not wait at all.
#[derive(Clone, Copy, Debug)]
pub struct NoWait;

/// How long a blocking operation may wait, or how far in the future a delayed item should run.
///
/// `None` inside is "forever".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeout(pub(crate) Option<Duration>);

impl Timeout {
    /// Is this the zero timeout.
    pub fn is_no_wait(&self) -> bool {
        matches!(self.0, Some(d) if d.ticks() == 0)
    }

    /// Is this an unbounded timeout.
    pub fn is_forever(&self) -> bool {
        self.0.is_none()
    }

    /// The wall-clock point at which a wait with this timeout, started now, gives up.
    ///
    /// `None` for [`Forever`], and for a delay too long for the host clock to represent.
    pub(crate) fn deadline(&self) -> Option<std::time::Instant> {
        self.0
            .and_then(|d| std::time::Instant::now().checked_add(to_std(d)))
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Timeout(Some(value))
    }
}

impl From<Forever> for Timeout {
    fn from(_value: Forever) -> Self {
        Timeout(None)
    }
}

impl From<NoWait> for Timeout {
    fn from(_value: NoWait) -> Self {
        Timeout(Some(Duration::from_ticks(0)))
    }
}

/// Round up to whole ticks, so that a converted delay is never shorter than requested.
impl From<StdDuration> for Timeout {
    fn from(value: StdDuration) -> Self {
        let per_tick = 1_000_000_000u128 / SYS_FREQUENCY as u128;
        let ticks = value.as_nanos().div_ceil(per_tick);
        Timeout(Some(Duration::from_ticks(
            Tick::try_from(ticks).unwrap_or(Tick::MAX),
        )))
    }
}

fn boot() -> std::time::Instant {
    static BOOT: OnceLock<std::time::Instant> = OnceLock::new();
    *BOOT.get_or_init(std::time::Instant::now)
}

/// Current uptime in ticks.
pub fn now() -> Instant {
    let elapsed = boot().elapsed().as_micros();
    let ticks = elapsed * SYS_FREQUENCY as u128 / 1_000_000;
    Instant::from_ticks(Tick::try_from(ticks).unwrap_or(Tick::MAX))
}

/// Return the current uptime of the system in ms.
pub fn uptime_get() -> i64 {
    boot().elapsed().as_millis() as i64
}

/// Convert a tick duration to a `core::time::Duration`, saturating.
pub(crate) fn to_std(d: Duration) -> StdDuration {
    const MICROS_PER_TICK: u64 = 1_000_000 / SYS_FREQUENCY as u64;
    StdDuration::from_micros(d.ticks().saturating_mul(MICROS_PER_TICK))
}

/// The wall-clock moment at which the tick clock reaches `at`.
///
/// `None` if that moment is beyond what the host clock can represent.
pub(crate) fn std_instant(at: Instant) -> Option<std::time::Instant> {
    boot().checked_add(to_std(Duration::from_ticks(at.ticks())))
}
