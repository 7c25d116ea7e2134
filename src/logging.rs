// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Logging
//!
//! The engine logs through the `log` crate: `trace!` for submissions and state changes, `debug!`
//! for queue lifecycle, `warn!` for timer-driven submissions that were rejected, and `error!`
//! when an essential worker dies.  Nothing is printed unless a logger is installed.
//!
//! [`set_logger`] installs a minimal logger that sends every message, as one line, through
//! [`printkln!`](crate::printkln).  Applications that already have a logger need not call it.

use log::{LevelFilter, Log, SetLoggerError};

mod impl_printk;

/// The level filter installed by [`set_logger`].
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

// The log crate has different entry points based on whether the target has atomic pointers.  Only
// the racy ones are unsafe, and only when called while other threads may be logging.
cfg_if::cfg_if! {
    if #[cfg(target_has_atomic = "ptr")] {
        /// Install the printk logger, with the [`DEFAULT_LEVEL`] filter.
        pub fn set_logger() -> Result<(), SetLoggerError> {
            set_logger_level(DEFAULT_LEVEL)
        }

        /// Install the printk logger, with the given level filter.
        pub fn set_logger_level(level: LevelFilter) -> Result<(), SetLoggerError> {
            set_logger_internal(impl_printk::logger(), level)
        }

        fn set_logger_internal(
            logger: &'static dyn Log,
            level: LevelFilter,
        ) -> Result<(), SetLoggerError> {
            log::set_logger(logger)?;
            log::set_max_level(level);
            Ok(())
        }
    } else {
        /// Install the printk logger, with the [`DEFAULT_LEVEL`] filter.
        ///
        /// # Safety
        ///
        /// Must be called before any other thread is started.
        pub unsafe fn set_logger() -> Result<(), SetLoggerError> {
            set_logger_level(DEFAULT_LEVEL)
        }

        /// Install the printk logger, with the given level filter.
        ///
        /// # Safety
        ///
        /// Must be called before any other thread is started.
        pub unsafe fn set_logger_level(level: LevelFilter) -> Result<(), SetLoggerError> {
            log::set_logger_racy(impl_printk::logger())?;
            log::set_max_level_racy(level);
            Ok(())
        }
    }
}
