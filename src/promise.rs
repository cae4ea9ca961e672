// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Promise engine with cancellation and progress reporting.
//!
//! Promises settle at most once and run every reaction through the shared
//! [`TaskQueue`], so a handler is never invoked on the call stack that
//! registered it, even when the promise was already settled at registration
//! time. Failures inside user-supplied closures are signalled by returning
//! `Err(Value)` and become rejections of the relevant promise; the engine
//! never unwinds through them.

use crate::task_queue::TaskQueue;
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// The state of a promise.
///
/// `Pending` is the only non-terminal state; once `Fulfilled` or `Rejected`
/// the state and value never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Neither fulfilled nor rejected yet
    Pending,
    /// Settled with a value
    Fulfilled,
    /// Settled with a rejection reason
    Rejected,
}

/// What a handler or initializer resolves with: a plain value, or another
/// promise whose eventual outcome is adopted.
pub enum Completion {
    /// An immediate value
    Value(Value),
    /// Adopt the outcome of another promise
    Chain(Promise),
}

impl From<Value> for Completion {
    fn from(value: Value) -> Self {
        Completion::Value(value)
    }
}

impl From<Promise> for Completion {
    fn from(promise: Promise) -> Self {
        Completion::Chain(promise)
    }
}

/// Fulfillment or rejection handler registered via `then`.
pub type Handler = Box<dyn FnMut(Value) -> std::result::Result<Completion, Value>>;

/// Progress handler registered via `then` or `on_progress`.
pub type ProgressHandler = Box<dyn FnMut(Value)>;

/// Cancellation hook registered via [`Resolver::set_canceler`]. `Ok(v)`
/// resolves the owning promise with `v`; `Err(e)` rejects it.
pub type Canceler = Box<dyn FnMut(Value) -> std::result::Result<Value, Value>>;

type Reaction = Box<dyn FnOnce(Value)>;
type SharedProgress = Arc<Mutex<ProgressHandler>>;

struct PromiseInner {
    state: PromiseState,
    value: Option<Value>,
    on_fulfill: Vec<Reaction>,
    on_reject: Vec<Reaction>,
    on_progress: Vec<SharedProgress>,
    canceler: Option<Canceler>,
    // cancel requests forward upward through this link
    parent: Option<Weak<Mutex<PromiseInner>>>,
    canceled: bool,
    queue: TaskQueue,
}

type InnerHandle = Arc<Mutex<PromiseInner>>;

/// A value or error that becomes available asynchronously.
///
/// Clones share the same underlying state.
#[derive(Clone)]
pub struct Promise {
    inner: InnerHandle,
}

/// The resolution side of a promise, handed to the initializer of
/// [`Promise::new`] or obtained from [`Promise::with_resolvers`].
#[derive(Clone)]
pub struct Resolver {
    inner: InnerHandle,
}

fn settle(inner: &InnerHandle, state: PromiseState, value: Value) {
    debug_assert!(state != PromiseState::Pending);
    let (reactions, queue) = {
        let mut guard = inner.lock();
        if guard.state != PromiseState::Pending {
            tracing::debug!(?state, "settle after settlement ignored");
            return;
        }
        guard.state = state;
        guard.value = Some(value.clone());
        guard.canceler = None;
        guard.on_progress.clear();
        let reactions = if state == PromiseState::Fulfilled {
            guard.on_reject.clear();
            std::mem::take(&mut guard.on_fulfill)
        } else {
            guard.on_fulfill.clear();
            std::mem::take(&mut guard.on_reject)
        };
        (reactions, guard.queue.clone())
    };
    for reaction in reactions {
        let value = value.clone();
        queue.add(move || reaction(value));
    }
}

fn resolve_completion(inner: &InnerHandle, completion: Completion) {
    match completion {
        Completion::Value(value) => settle(inner, PromiseState::Fulfilled, value),
        Completion::Chain(other) => {
            if Arc::ptr_eq(&other.inner, inner) {
                settle(
                    inner,
                    PromiseState::Rejected,
                    Value::error("TypeError", "Tried to resolve a promise with itself"),
                );
                return;
            }
            let fulfill_target = inner.clone();
            let reject_target = inner.clone();
            other.on_settled(
                Box::new(move |value| settle(&fulfill_target, PromiseState::Fulfilled, value)),
                Box::new(move |reason| settle(&reject_target, PromiseState::Rejected, reason)),
            );
        }
    }
}

fn cancel_inner(inner: &InnerHandle, reason: Value) {
    let (canceler, parent) = {
        let mut guard = inner.lock();
        if guard.state != PromiseState::Pending {
            return;
        }
        guard.canceled = true;
        (guard.canceler.take(), guard.parent.clone())
    };
    if let Some(mut canceler) = canceler {
        match canceler(reason) {
            Ok(value) => settle(inner, PromiseState::Fulfilled, value),
            Err(error) => settle(inner, PromiseState::Rejected, error),
        }
    } else if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
        cancel_inner(&parent, reason);
    } else {
        tracing::debug!("cancel ignored: no canceler anywhere in the chain");
    }
}

impl Promise {
    fn pending(queue: TaskQueue, parent: Option<Weak<Mutex<PromiseInner>>>) -> Promise {
        Promise {
            inner: Arc::new(Mutex::new(PromiseInner {
                state: PromiseState::Pending,
                value: None,
                on_fulfill: Vec::new(),
                on_reject: Vec::new(),
                on_progress: Vec::new(),
                canceler: None,
                parent,
                canceled: false,
                queue,
            })),
        }
    }

    /// Create a promise, running `initializer` synchronously with its
    /// [`Resolver`]. An `Err` return rejects the promise.
    pub fn new<F>(queue: &TaskQueue, initializer: F) -> Promise
    where
        F: FnOnce(&Resolver) -> std::result::Result<(), Value>,
    {
        let promise = Promise::pending(queue.clone(), None);
        let resolver = Resolver {
            inner: promise.inner.clone(),
        };
        if let Err(error) = initializer(&resolver) {
            settle(&promise.inner, PromiseState::Rejected, error);
        }
        promise
    }

    /// Create a pending promise along with its external [`Resolver`].
    pub fn with_resolvers(queue: &TaskQueue) -> (Promise, Resolver) {
        let promise = Promise::pending(queue.clone(), None);
        let resolver = Resolver {
            inner: promise.inner.clone(),
        };
        (promise, resolver)
    }

    /// Create a promise already fulfilled with `value`.
    pub fn resolved(queue: &TaskQueue, value: Value) -> Promise {
        let promise = Promise::pending(queue.clone(), None);
        settle(&promise.inner, PromiseState::Fulfilled, value);
        promise
    }

    /// Create a promise already rejected with `reason`.
    pub fn rejected(queue: &TaskQueue, reason: Value) -> Promise {
        let promise = Promise::pending(queue.clone(), None);
        settle(&promise.inner, PromiseState::Rejected, reason);
        promise
    }

    /// Convert a completion into a promise. An existing promise passes
    /// through unchanged.
    pub fn from_completion(queue: &TaskQueue, completion: Completion) -> Promise {
        match completion {
            Completion::Chain(promise) => promise,
            Completion::Value(value) => Promise::resolved(queue, value),
        }
    }

    // Register raw settlement reactions. Reactions run on the task queue
    // even when the promise has already settled.
    fn on_settled(&self, on_fulfill: Reaction, on_reject: Reaction) {
        let mut guard = self.inner.lock();
        match guard.state {
            PromiseState::Pending => {
                guard.on_fulfill.push(on_fulfill);
                guard.on_reject.push(on_reject);
            }
            PromiseState::Fulfilled => {
                let value = guard.value.clone().unwrap_or(Value::Undefined);
                guard.queue.add(move || on_fulfill(value));
            }
            PromiseState::Rejected => {
                let reason = guard.value.clone().unwrap_or(Value::Undefined);
                guard.queue.add(move || on_reject(reason));
            }
        }
    }

    fn add_progress(&self, handler: ProgressHandler) {
        let mut guard = self.inner.lock();
        if guard.state == PromiseState::Pending {
            guard.on_progress.push(Arc::new(Mutex::new(handler)));
        }
    }

    fn emit_progress(&self, update: Value) {
        let (handlers, queue) = {
            let guard = self.inner.lock();
            if guard.state != PromiseState::Pending {
                tracing::debug!("progress after settlement ignored");
                return;
            }
            (guard.on_progress.clone(), guard.queue.clone())
        };
        // each reaction is scheduled individually
        for handler in handlers {
            let update = update.clone();
            queue.add(move || {
                let mut handler = handler.lock();
                (*handler)(update)
            });
        }
    }

    /// Register reactions, producing a derived promise.
    ///
    /// A missing handler passes the corresponding outcome through unchanged.
    /// A handler's `Ok` return resolves the derived promise (adopting a
    /// returned promise); an `Err` return rejects it.
    pub fn then(
        &self,
        on_fulfilled: Option<Handler>,
        on_rejected: Option<Handler>,
        on_progress: Option<ProgressHandler>,
    ) -> Promise {
        let queue = self.inner.lock().queue.clone();
        let derived = Promise::pending(queue, Some(Arc::downgrade(&self.inner)));

        let fulfill_target = derived.clone();
        let reject_target = derived.clone();
        let mut on_fulfilled = on_fulfilled;
        let mut on_rejected = on_rejected;
        self.on_settled(
            Box::new(move |value| match on_fulfilled.as_mut() {
                Some(handler) => match handler(value) {
                    Ok(completion) => resolve_completion(&fulfill_target.inner, completion),
                    Err(error) => settle(&fulfill_target.inner, PromiseState::Rejected, error),
                },
                None => settle(&fulfill_target.inner, PromiseState::Fulfilled, value),
            }),
            Box::new(move |reason| match on_rejected.as_mut() {
                Some(handler) => match handler(reason) {
                    Ok(completion) => resolve_completion(&reject_target.inner, completion),
                    Err(error) => settle(&reject_target.inner, PromiseState::Rejected, error),
                },
                None => settle(&reject_target.inner, PromiseState::Rejected, reason),
            }),
        );

        // progress flows down the chain; a handler observes but does not
        // replace the update
        let progress_target = derived.clone();
        let mut on_progress = on_progress;
        self.add_progress(Box::new(move |update| {
            if let Some(handler) = on_progress.as_mut() {
                handler(update.clone());
            }
            progress_target.emit_progress(update);
        }));

        derived
    }

    /// Register only a fulfillment handler.
    pub fn and_then<F>(&self, handler: F) -> Promise
    where
        F: FnMut(Value) -> std::result::Result<Completion, Value> + 'static,
    {
        self.then(Some(Box::new(handler)), None, None)
    }

    /// Register only a rejection handler.
    pub fn catch<F>(&self, handler: F) -> Promise
    where
        F: FnMut(Value) -> std::result::Result<Completion, Value> + 'static,
    {
        self.then(None, Some(Box::new(handler)), None)
    }

    /// Register only a progress handler.
    pub fn on_progress<F>(&self, handler: F) -> Promise
    where
        F: FnMut(Value) + 'static,
    {
        self.then(None, None, Some(Box::new(handler)))
    }

    /// Register a handler that runs regardless of how the promise settles.
    ///
    /// Returning `Ok(None)` passes the original outcome through,
    /// `Ok(Some(completion))` adopts the replacement, and `Err` becomes the
    /// new rejection.
    pub fn finally<F>(&self, handler: F) -> Promise
    where
        F: FnOnce(PromiseState, Value) -> std::result::Result<Option<Completion>, Value> + 'static,
    {
        let shared = Arc::new(Mutex::new(Some(handler)));
        let on_reject = Arc::clone(&shared);
        self.then(
            Some(Box::new(move |value: Value| {
                match shared.lock().take() {
                    Some(handler) => match handler(PromiseState::Fulfilled, value.clone())? {
                        Some(completion) => Ok(completion),
                        None => Ok(Completion::Value(value)),
                    },
                    None => Ok(Completion::Value(value)),
                }
            })),
            Some(Box::new(move |reason: Value| {
                match on_reject.lock().take() {
                    Some(handler) => match handler(PromiseState::Rejected, reason.clone()) {
                        Ok(Some(completion)) => Ok(completion),
                        Ok(None) => Err(reason),
                        Err(error) => Err(error),
                    },
                    None => Err(reason),
                }
            })),
            None,
        )
    }

    /// Request cancellation. Only meaningful while pending.
    ///
    /// The request travels up the `then` chain to the nearest ancestor that
    /// registered a canceler; that canceler's outcome settles its promise and
    /// flows back down the chain. With no canceler anywhere the request is
    /// silently ignored. The default reason is a `CancelError` value with
    /// message "Aborted".
    pub fn cancel(&self, reason: Option<Value>) {
        let reason = reason.unwrap_or_else(|| Value::error("CancelError", "Aborted"));
        cancel_inner(&self.inner, reason);
    }

    /// Current state.
    pub fn state(&self) -> PromiseState {
        self.inner.lock().state
    }

    /// Whether the promise has fulfilled.
    pub fn is_fulfilled(&self) -> bool {
        self.state() == PromiseState::Fulfilled
    }

    /// Whether the promise has rejected.
    pub fn is_rejected(&self) -> bool {
        self.state() == PromiseState::Rejected
    }

    /// Whether the promise is still pending.
    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// Whether a cancel request has touched this promise.
    pub fn is_canceled(&self) -> bool {
        self.inner.lock().canceled
    }

    /// Terminal value or rejection reason, once settled.
    pub fn settled_value(&self) -> Option<Value> {
        self.inner.lock().value.clone()
    }

    /// Resolve with a positional collection of results once every input
    /// fulfills, or reject with the first rejection.
    ///
    /// Plain values count as already fulfilled. An empty input resolves
    /// immediately with an empty array.
    pub fn all(queue: &TaskQueue, inputs: Vec<Completion>) -> Promise {
        let result = Promise::pending(queue.clone(), None);
        let total = inputs.len();
        if total == 0 {
            settle(&result.inner, PromiseState::Fulfilled, Value::array(Vec::new()));
            return result;
        }
        let state = Arc::new(Mutex::new(AllState {
            slots: vec![None; total],
            remaining: total,
            done: false,
        }));
        for (index, input) in inputs.into_iter().enumerate() {
            match input {
                Completion::Value(value) => {
                    all_fulfill(&state, &result.inner, index, value);
                }
                Completion::Chain(promise) => {
                    let fulfill_state = Arc::clone(&state);
                    let fulfill_target = result.inner.clone();
                    let reject_state = Arc::clone(&state);
                    let reject_target = result.inner.clone();
                    promise.on_settled(
                        Box::new(move |value| {
                            all_fulfill(&fulfill_state, &fulfill_target, index, value);
                        }),
                        Box::new(move |reason| {
                            let first = {
                                let mut guard = reject_state.lock();
                                if guard.done {
                                    false
                                } else {
                                    guard.done = true;
                                    true
                                }
                            };
                            if first {
                                settle(&reject_target, PromiseState::Rejected, reason);
                            }
                        }),
                    );
                }
            }
        }
        result
    }

    /// Keyed variant of [`Promise::all`]: resolves with an object mapping
    /// each key to its input's fulfillment value.
    pub fn all_keyed(queue: &TaskQueue, inputs: Vec<(String, Completion)>) -> Promise {
        let keys: Vec<String> = inputs.iter().map(|(k, _)| k.clone()).collect();
        let positional = Promise::all(queue, inputs.into_iter().map(|(_, c)| c).collect());
        positional.and_then(move |values| {
            let object = Value::object();
            if let Value::Array(items) = &values {
                for (key, value) in keys.iter().zip(items.read().iter()) {
                    object.set(key, value.clone());
                }
            }
            Ok(Completion::Value(object))
        })
    }

    /// Settle with the outcome of whichever input settles first. Plain
    /// values win immediately.
    pub fn race(queue: &TaskQueue, inputs: Vec<Completion>) -> Promise {
        let result = Promise::pending(queue.clone(), None);
        for input in inputs {
            match input {
                Completion::Value(value) => {
                    settle(&result.inner, PromiseState::Fulfilled, value);
                }
                Completion::Chain(promise) => {
                    let fulfill_target = result.inner.clone();
                    let reject_target = result.inner.clone();
                    promise.on_settled(
                        Box::new(move |value| {
                            settle(&fulfill_target, PromiseState::Fulfilled, value);
                        }),
                        Box::new(move |reason| {
                            settle(&reject_target, PromiseState::Rejected, reason);
                        }),
                    );
                }
            }
        }
        result
    }
}

struct AllState {
    slots: Vec<Option<Value>>,
    remaining: usize,
    done: bool,
}

fn all_fulfill(state: &Arc<Mutex<AllState>>, target: &InnerHandle, index: usize, value: Value) {
    let values = {
        let mut guard = state.lock();
        if guard.done {
            return;
        }
        guard.slots[index] = Some(value);
        guard.remaining -= 1;
        if guard.remaining > 0 {
            return;
        }
        guard.done = true;
        guard
            .slots
            .iter_mut()
            .map(|slot| slot.take().unwrap_or(Value::Undefined))
            .collect::<Vec<Value>>()
    };
    settle(target, PromiseState::Fulfilled, Value::array(values));
}

impl Resolver {
    /// Resolve the promise. A promise argument is adopted; resolving the
    /// promise with itself rejects with a type error.
    pub fn resolve(&self, completion: impl Into<Completion>) {
        resolve_completion(&self.inner, completion.into());
    }

    /// Reject the promise with `reason`. No-op once settled.
    pub fn reject(&self, reason: Value) {
        settle(&self.inner, PromiseState::Rejected, reason);
    }

    /// Deliver a progress update to registered progress reactions. No-op
    /// once the promise has settled.
    pub fn progress(&self, update: Value) {
        Promise {
            inner: self.inner.clone(),
        }
        .emit_progress(update);
    }

    /// Register the cancellation hook. Without one, cancel requests that
    /// reach this promise are ignored.
    pub fn set_canceler<F>(&self, canceler: F)
    where
        F: FnMut(Value) -> std::result::Result<Value, Value> + 'static,
    {
        let mut guard = self.inner.lock();
        if guard.state == PromiseState::Pending {
            guard.canceler = Some(Box::new(canceler));
        }
    }
}
