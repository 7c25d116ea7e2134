// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! # Low-level synchronization primitives.
//!
//! These are the blocking primitives the work engine is built on.  They are usable without any
//! reference to the engine itself, and are safe to share between threads.

pub mod semaphore;

pub use semaphore::{Semaphore, K_SEM_MAX_LIMIT};
