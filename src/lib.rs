// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Deferred work for Rust
//!
//! This crate provides work queues: threads that run a FIFO of work items on behalf of other
//! threads, along with delayable work driven by timeouts, synchronous cancellation, flushing, and
//! draining and plugging of queues.  See the [`work`] module for an overview.
//!
//! The kernel services the engine needs (semaphores, wait queues, threads and a timeout service)
//! are in [`sys`], and usable on their own.

#![deny(missing_docs)]

pub mod error;
pub mod logging;
pub mod printk;
pub mod sync;
pub mod sys;
pub mod time;
pub mod work;

pub use error::{Error, Result};

pub use logging::set_logger;

pub use work::{
    DelayableWork, Kernel, SimpleAction, SubmitResult, Work, WorkContext, WorkQueue,
    WorkQueueConfig,
};
