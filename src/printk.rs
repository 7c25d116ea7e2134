// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Printk implementation for Rust.
//!
//! On a host the console is standard error.  Each call formats its whole message first and then
//! writes it with the console locked, so lines from different threads never interleave.

use core::fmt::{write, Arguments};
use std::io::Write;

/// Print to the console, without a newline.
///
/// This macro uses the same syntax as std's [`format!`], but writes to the console instead.
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => {{
        $crate::printk::printk(format_args!($($arg)*));
    }};
}

/// Print to the console, with a newline.
///
/// This macro uses the same syntax as std's [`format!`], but writes to the console instead.
#[macro_export]
macro_rules! printkln {
    ($($arg:tt)*) => {{
        $crate::printk::printkln(format_args!($($arg)*));
    }};
}

fn output(args: Arguments<'_>, newline: bool) {
    let mut line = String::new();
    // Formatting into a String only fails if a Display impl does.
    if write(&mut line, args).is_err() {
        line.push_str("<format error>");
    }
    if newline {
        line.push('\n');
    }
    // There is nowhere left to report a console failure.
    let _ = std::io::stderr().lock().write_all(line.as_bytes());
}

#[doc(hidden)]
pub fn printk(args: Arguments<'_>) {
    output(args, false);
}

#[doc(hidden)]
pub fn printkln(args: Arguments<'_>) {
    output(args, true);
}
