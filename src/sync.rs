// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Shared ownership and atomics.
//!
//! The engine takes these from [`portable-atomic`](https://crates.io/crates/portable-atomic) and
//! its `util` crate rather than from `core`/`std`, so the same code builds on targets without
//! native atomic instructions.

pub mod atomic {
    //! Re-export portable atomic.
    //!
    //! On targets with atomic instructions these are just the types from `core`.  Elsewhere,
    //! `portable-atomic` provides them with a critical section.

    pub use portable_atomic::*;
}

pub use portable_atomic_util::Arc;
pub use portable_atomic_util::Weak;
