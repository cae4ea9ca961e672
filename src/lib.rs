// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Promise engine and asynchronous module loader for cooperative
//! single-threaded runtimes.
//!
//! Three pieces fit together:
//!
//! - [`task_queue::TaskQueue`] is a drainable queue of one-shot callbacks.
//!   The host drains it at the end of every event-loop turn; everything
//!   else in the crate schedules its callbacks there.
//! - [`promise::Promise`] is a settle-once asynchronous value with
//!   cancellation and progress reporting on top of the usual chaining.
//! - [`loader::Loader`] resolves module ids through declarative
//!   configuration, fetches sources through a host-supplied injector, and
//!   executes dependency graphs bottom-up, including `plugin!resource`
//!   dependencies serviced by loaded modules themselves.
//!
//! Nothing in the crate spawns threads or blocks; all progress happens on
//! the caller's thread, interleaved through the task queue.
//!
//! # Example
//!
//! ```
//! use strand::task_queue::TaskQueue;
//! use strand::promise::{Completion, Promise};
//! use strand::value::Value;
//!
//! let queue = TaskQueue::new();
//! let (promise, resolver) = Promise::with_resolvers(&queue);
//! let doubled = promise.and_then(|v| {
//!     let n = v.as_number().unwrap_or(0.0);
//!     Ok(Completion::Value(Value::Number(n * 2.0)))
//! });
//!
//! resolver.resolve(Value::Number(21.0));
//! while !queue.is_empty() {
//!     queue.drain();
//! }
//! assert_eq!(doubled.settled_value(), Some(Value::Number(42.0)));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod loader;
pub mod promise;
pub mod task_queue;
pub mod value;

pub use error::{LoaderError, Result};
pub use loader::config::LoaderConfig;
pub use loader::plugin::{LoaderPlugin, PluginCallback};
pub use loader::{ContextRequire, InjectDone, InjectRequest, Loader, SourceInjector, SourceThunk};
pub use promise::{Completion, Promise, PromiseState, Resolver};
pub use task_queue::TaskQueue;
pub use value::Value;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
