// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! # Work engine errors
//!
//! This module contains an `Error` and `Result` type for the work engine.  The kernel work
//! module reports rejections as negative errno values.  Here those are kinds of an enum, and
//! [`Error::errno`] gives back the errno view for code that still wants to compare against the
//! classic numbers.
//!
//! Only state machine rejections are errors.  Submitting an item that is already queued is not
//! an error, see [`SubmitResult::AlreadySubmitted`].
//!
//! [`SubmitResult::AlreadySubmitted`]: crate::work::SubmitResult::AlreadySubmitted

use core::fmt;

/// errno values used by the work engine.
pub mod errno {
    #![allow(missing_docs)]

    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EALREADY: i32 = 114;
    pub const ETIMEDOUT: i32 = 116;
}

/// A work engine error.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// No queue was given and the item has never been submitted, or the queue no longer exists.
    InvalidQueue,
    /// The target queue's worker has not been started.
    QueueNotStarted,
    /// Rejected because the item is canceling or already pending, or the queue is draining or
    /// plugged.
    Busy,
    /// The requested state change has already happened (queue not plugged, not started).
    Already,
    /// A bounded wait expired.
    TimedOut,
    /// A delayable operation was requested on a plain work item.
    NotDelayable,
    /// The host refused to create a thread.
    ThreadSpawn,
}

impl Error {
    /// The negative errno the kernel work module would return for this error.
    pub const fn errno(self) -> i32 {
        -(match self {
            Error::InvalidQueue | Error::NotDelayable => errno::EINVAL,
            Error::QueueNotStarted => errno::ENODEV,
            Error::Busy => errno::EBUSY,
            Error::Already => errno::EALREADY,
            Error::TimedOut => errno::ETIMEDOUT,
            Error::ThreadSpawn => errno::EAGAIN,
        })
    }

    fn describe(self) -> &'static str {
        match self {
            Error::InvalidQueue => "no queue to submit to",
            Error::QueueNotStarted => "queue not started",
            Error::Busy => "busy",
            Error::Already => "already in requested state",
            Error::TimedOut => "timed out",
            Error::NotDelayable => "work item is not delayable",
            Error::ThreadSpawn => "unable to spawn thread",
        }
    }
}

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work error errno:{} ({})", -self.errno(), self.describe())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work error errno:{} ({})", -self.errno(), self.describe())
    }
}

/// Wraps a value with a possible work engine error.
pub type Result<T> = core::result::Result<T, Error>;
