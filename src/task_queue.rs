// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! FIFO microtask queue shared by the promise engine and the loader.
//!
//! The queue does not run callbacks by itself; a host drains it. A waker
//! supplied at construction is invoked at most once per idle period so the
//! host knows a drain is due. Callbacks scheduled while draining run in the
//! same drain pass, which keeps logically-related work in one turn.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Removal token for a scheduled callback or a registered observer.
///
/// There is no way to pull a callback back out of the queue once scheduled;
/// removal flips a flag that is checked at dispatch time instead.
#[derive(Clone)]
pub struct Handle {
    removed: Arc<AtomicBool>,
}

impl Handle {
    pub(crate) fn new() -> Handle {
        Handle {
            removed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the associated callback as removed. Idempotent.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Relaxed);
    }

    /// Whether `remove` has been called.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Relaxed)
    }
}

struct ScheduledTask {
    callback: Box<dyn FnOnce()>,
    handle: Handle,
}

struct QueueInner {
    queue: VecDeque<ScheduledTask>,
    // true between the first add of an idle period and the next drain
    armed: bool,
    draining: bool,
    waker: Option<Arc<dyn Fn()>>,
}

/// Shared FIFO callback queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl TaskQueue {
    /// Create a queue with no waker; the host polls `is_empty` or drains
    /// unconditionally.
    pub fn new() -> TaskQueue {
        Self::build(None)
    }

    /// Create a queue that invokes `waker` once per idle period when work
    /// first arrives.
    pub fn with_waker<F>(waker: F) -> TaskQueue
    where
        F: Fn() + 'static,
    {
        Self::build(Some(Arc::new(waker)))
    }

    fn build(waker: Option<Arc<dyn Fn()>>) -> TaskQueue {
        TaskQueue {
            inner: Arc::new(Mutex::new(QueueInner {
                queue: VecDeque::new(),
                armed: false,
                draining: false,
                waker,
            })),
        }
    }

    /// Append a callback, returning a removal token.
    pub fn add<F>(&self, callback: F) -> Handle
    where
        F: FnOnce() + 'static,
    {
        let handle = Handle::new();
        let waker = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(ScheduledTask {
                callback: Box::new(callback),
                handle: handle.clone(),
            });
            if !inner.armed && !inner.draining {
                inner.armed = true;
                inner.waker.clone()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker();
        }
        handle
    }

    /// Run queued callbacks in insertion order until the queue is empty.
    ///
    /// Callbacks added during the drain run in this same pass. Removed
    /// callbacks are skipped.
    pub fn drain(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }
        loop {
            let task = {
                let mut inner = self.inner.lock();
                match inner.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        inner.draining = false;
                        inner.armed = false;
                        return;
                    }
                }
            };
            if !task.handle.is_removed() {
                (task.callback)();
            }
        }
    }

    /// Drain repeatedly until nothing remains, including callbacks
    /// scheduled by earlier drains.
    pub fn run_until_idle(&self) {
        while !self.is_empty() {
            self.drain();
        }
    }

    /// Whether no callbacks are waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Number of waiting callbacks.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
