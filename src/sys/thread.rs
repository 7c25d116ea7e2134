// Copyright (c) 2024 Linaro LTD
// SPDX-License-Identifier: Apache-2.0

//! Low level threads
//!
//! This is a fairly low level (but still safe) interface for creating the threads that animate
//! work queues and the timeout service.  A [`Thread`] collects the creation parameters (name,
//! stack size, priority, whether the thread is essential), and [`Thread::spawn`] starts it,
//! returning a [`RunningThread`] that can be joined with a timeout.
//!
//! ```
//! use kwork::{sys::thread::Thread, time::Forever};
//!
//! let mut thread = Thread::new();
//! thread.set_name("worker");
//! thread.set_priority(5);
//! let mut child = thread.spawn(move || {
//!     // thread code...
//! }).unwrap();
//! child.join(Forever).unwrap();
//! ```
//!
//! Priorities are recorded but a host scheduler does not honor them.

use std::thread::{JoinHandle, ThreadId};

use log::{error, warn};

use crate::{
    error::{Error, Result},
    sys::sync::Semaphore,
    time::Timeout,
};

/// A thread that has not been started yet.
#[derive(Debug, Default)]
pub struct Thread {
    name: Option<String>,
    stack_size: Option<usize>,
    /// The initial priority of this thread.
    priority: i32,
    essential: bool,
}

impl Thread {
    /// Construct the parameters for a new thread, with defaults for everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority the thread will be created at.
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    /// Set the name of the thread.
    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_owned());
    }

    /// Set the stack size, in bytes.  Zero keeps the platform default.
    pub fn set_stack_size(&mut self, size: usize) {
        self.stack_size = (size > 0).then_some(size);
    }

    /// Mark the thread as essential.
    ///
    /// An essential thread that dies from a panic takes the whole process down with it.
    pub fn set_essential(&mut self, essential: bool) {
        self.essential = essential;
    }

    /// Spawn a thread, running the given closure.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, child: F) -> Result<RunningThread> {
        let exited = Semaphore::new(0, 1);
        let guard = ExitGuard {
            exited: exited.clone(),
            essential: self.essential,
        };

        let mut builder = std::thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let handle = builder
            .spawn(move || {
                let _guard = guard;
                child();
            })
            .map_err(|err| {
                warn!("unable to spawn thread {:?}: {}", self.name, err);
                Error::ThreadSpawn
            })?;

        Ok(RunningThread {
            id: handle.thread().id(),
            priority: self.priority,
            handle: Some(handle),
            exited,
        })
    }
}

/// Signals thread exit, and enforces the essential flag.
struct ExitGuard {
    exited: Semaphore,
    essential: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.essential && std::thread::panicking() {
            error!(
                "essential thread {:?} panicked, aborting",
                std::thread::current().name()
            );
            std::process::abort();
        }
        self.exited.give();
    }
}

/// A thread that has been started.
#[derive(Debug)]
pub struct RunningThread {
    id: ThreadId,
    priority: i32,
    handle: Option<JoinHandle<()>>,
    exited: Semaphore,
}

impl RunningThread {
    /// The id of the running thread.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The priority the thread was created with.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Is the calling code running on this thread.
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.id
    }

    /// Wait for this thread to finish executing.
    ///
    /// Returns [`Error::TimedOut`] if the thread is still running when the timeout expires.
    /// Joining a thread that has already been joined returns immediately.
    pub fn join<T: Into<Timeout>>(&mut self, timeout: T) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Err(err) = self.exited.take(timeout) {
            self.handle = Some(handle);
            return Err(err);
        }
        if handle.join().is_err() {
            warn!("joined thread {:?} had panicked", self.id);
        }
        Ok(())
    }
}
