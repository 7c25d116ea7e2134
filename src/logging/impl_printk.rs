// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Logging through printk
//!
//! Filtering is global, through the `log` crate's max level.

use log::{Log, Metadata, Record};

use crate::printkln;

/// A simple log handler, built around printk.
struct PrintkLogger;

impl Log for PrintkLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        printkln!("{}:{}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static PRINTK_LOGGER: PrintkLogger = PrintkLogger;

pub(super) fn logger() -> &'static dyn Log {
    &PRINTK_LOGGER
}
