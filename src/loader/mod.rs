// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Asynchronous module loader.
//!
//! The loader tracks module records in a registry keyed by absolute module
//! id. A request for a module resolves its id, asks the installed
//! [`SourceInjector`] (or a seeded source cache) for its definition, walks
//! the resulting dependency graph the same way, and executes factories
//! bottom-up once every transitive dependency has arrived. Execution order
//! is dependency order; independent subgraphs execute in request order.
//!
//! All work happens on the caller's thread. Completion callbacks and idle
//! notifications run through the loader's [`TaskQueue`].

pub mod config;
mod engine;
pub mod module;
pub mod plugin;
pub mod resolver;

use crate::error::{LoaderError, Result};
use crate::task_queue::{Handle, TaskQueue};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use config::{CompiledConfig, LoaderConfig};
use engine::EngineState;
use module::{Factory, ModuleHandle};

/// What the loader needs fetched: a module id resolved to a url, with the
/// module that requested it for diagnostics.
#[derive(Debug, Clone)]
pub struct InjectRequest {
    /// Absolute module id
    pub mid: String,
    /// Resolved source url
    pub url: String,
    /// Module id of the requester, when the request came from a dependency
    /// list
    pub parent: Option<String>,
}

/// Completion callback handed to [`SourceInjector::inject`]. Call it exactly
/// once: `Ok(())` after the fetched source's `define` calls have run against
/// the loader, `Err(reason)` when the fetch failed.
pub type InjectDone = Box<dyn FnOnce(std::result::Result<(), String>) -> Result<()>>;

/// Fetches and evaluates module sources on the loader's behalf.
///
/// `inject` may complete synchronously (call `done` before returning) or
/// hold on to `done` and call it later from a scheduled task. Either way the
/// source's top-level `define` call must happen before `done(Ok(()))`.
pub trait SourceInjector {
    /// Fetch the source for `request` and report completion through `done`.
    fn inject(&self, request: InjectRequest, loader: &Loader, done: InjectDone) -> Result<()>;
}

/// Deferred definition thunk seeded through [`Loader::cache_sources`]. Runs
/// the module's `define` calls when the module is first demanded.
pub type SourceThunk = Box<dyn FnOnce(&Loader) -> Result<()>>;

pub(crate) struct IdleObserver {
    pub(crate) token: Handle,
    pub(crate) callback: Arc<dyn Fn()>,
}

pub(crate) struct LoaderInner {
    pub(crate) config: Mutex<CompiledConfig>,
    pub(crate) registry: Mutex<HashMap<String, ModuleHandle>>,
    pub(crate) sources: Mutex<HashMap<String, SourceThunk>>,
    pub(crate) engine: Mutex<EngineState>,
    pub(crate) injector: Mutex<Option<Arc<dyn SourceInjector>>>,
    pub(crate) idle: Mutex<Vec<IdleObserver>>,
    pub(crate) queue: TaskQueue,
}

/// The module loader. Clones share the same registry, configuration, and
/// task queue.
#[derive(Clone)]
pub struct Loader {
    pub(crate) inner: Arc<LoaderInner>,
}

impl Loader {
    /// Create a loader that schedules its callbacks on `queue`.
    pub fn new(queue: &TaskQueue) -> Loader {
        Loader {
            inner: Arc::new(LoaderInner {
                config: Mutex::new(CompiledConfig::default()),
                registry: Mutex::new(HashMap::new()),
                sources: Mutex::new(HashMap::new()),
                engine: Mutex::new(EngineState::default()),
                injector: Mutex::new(None),
                idle: Mutex::new(Vec::new()),
                queue: queue.clone(),
            }),
        }
    }

    /// The task queue completion callbacks are scheduled on.
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Merge `config` into the active configuration. Later calls win where
    /// keys collide; already-resolved module records are unaffected.
    pub fn configure(&self, config: &LoaderConfig) -> Result<()> {
        config.validate()?;
        self.inner.config.lock().apply(config);
        Ok(())
    }

    /// Install the source injector used for modules with no seeded source.
    pub fn set_injector(&self, injector: Arc<dyn SourceInjector>) {
        *self.inner.injector.lock() = Some(injector);
    }

    /// Seed definition thunks keyed by absolute module id. A seeded module
    /// never reaches the injector; its thunk runs (once) when the module is
    /// first demanded.
    pub fn cache_sources<I>(&self, sources: I)
    where
        I: IntoIterator<Item = (String, SourceThunk)>,
    {
        let mut cache = self.inner.sources.lock();
        for (mid, thunk) in sources {
            cache.insert(mid, thunk);
        }
    }

    /// The root context, from which ids resolve with no referrer.
    pub fn context(&self) -> ContextRequire {
        ContextRequire {
            loader: self.clone(),
            referrer: None,
        }
    }

    /// Synchronously look up an already-executed module's value.
    ///
    /// Fails with [`LoaderError::NotLoaded`] when the module has not
    /// executed yet; use [`Loader::require_list`] to demand it first.
    pub fn require(&self, mid: &str) -> Result<Value> {
        self.context().require(mid)
    }

    /// Demand `deps` and invoke `callback` with their values once every one
    /// of them (and its transitive dependencies) has executed.
    pub fn require_list<F>(&self, deps: &[&str], callback: F) -> Result<()>
    where
        F: FnOnce(Vec<Value>) -> std::result::Result<Value, Value> + 'static,
    {
        self.context().require_list(deps, callback)
    }

    /// Anonymous module definition, valid only while an injection is in
    /// flight. The pending injection claims the captured definition.
    pub fn define<F>(&self, deps: &[&str], factory: F)
    where
        F: FnOnce(Vec<Value>, &ContextRequire) -> std::result::Result<Value, Value> + 'static,
    {
        engine::capture_define(
            self,
            deps.iter().map(|d| d.to_string()).collect(),
            Some(Box::new(factory)),
            None,
        );
    }

    /// Anonymous definition of a dependency-free literal value.
    pub fn define_value(&self, value: Value) {
        engine::capture_define(self, Vec::new(), None, Some(value));
    }

    /// Anonymous commonjs-style definition. `source` is scanned for
    /// `require("...")` calls (comments ignored) and the found ids become
    /// dependencies, available to the factory through its context require.
    /// The factory's `exports` object is the module's value unless the
    /// factory returns something other than undefined.
    pub fn define_cjs<F>(&self, source: &str, factory: F)
    where
        F: FnOnce(Vec<Value>, &ContextRequire) -> std::result::Result<Value, Value> + 'static,
    {
        let mut deps = vec![
            "require".to_string(),
            "exports".to_string(),
            "module".to_string(),
        ];
        deps.extend(engine::scan_cjs_requires(source));
        engine::capture_define(self, deps, Some(Box::new(factory)), None);
    }

    /// Named module definition. Usable outside injection, e.g. from bundled
    /// sources; a second definition for the same id is ignored.
    pub fn define_named<F>(&self, mid: &str, deps: &[&str], factory: F) -> Result<()>
    where
        F: FnOnce(Vec<Value>, &ContextRequire) -> std::result::Result<Value, Value> + 'static,
    {
        engine::define_named(
            self,
            mid,
            deps.iter().map(|d| d.to_string()).collect(),
            Some(Box::new(factory)),
            None,
        )
    }

    /// Named definition of a dependency-free literal value.
    pub fn define_named_value(&self, mid: &str, value: Value) -> Result<()> {
        engine::define_named(self, mid, Vec::new(), None, Some(value))
    }

    /// Discard a module record so a later request reloads it. Modules that
    /// already captured the old value keep it.
    pub fn undef(&self, mid: &str) -> Result<()> {
        let abs = self.to_abs_mid(mid);
        let removed = self.inner.registry.lock().remove(&abs);
        match removed {
            Some(handle) => {
                let mut engine = self.inner.engine.lock();
                engine.exec_q.retain(|m| !Arc::ptr_eq(m, &handle));
                Ok(())
            }
            None => Err(LoaderError::resolution(abs)),
        }
    }

    /// Register an observer invoked (via the task queue) whenever the
    /// loader drains: no injections in flight and nothing left to execute.
    /// Dropping or removing the returned handle unregisters it.
    pub fn on_idle<F>(&self, observer: F) -> Handle
    where
        F: Fn() + 'static,
    {
        let token = Handle::new();
        self.inner.idle.lock().push(IdleObserver {
            token: token.clone(),
            callback: Arc::new(observer),
        });
        token
    }

    /// Resolve `mid` to its absolute module id from the root context.
    pub fn to_abs_mid(&self, mid: &str) -> String {
        self.context().to_abs_mid(mid)
    }

    /// Resolve a module-id-shaped path to a url, without assuming a `.js`
    /// module lives there.
    pub fn to_url(&self, id: &str) -> String {
        self.context().to_url(id)
    }
}

/// A require bound to a referrer module, so relative ids and map scopes
/// resolve the way that module sees them.
#[derive(Clone)]
pub struct ContextRequire {
    pub(crate) loader: Loader,
    pub(crate) referrer: Option<ModuleHandle>,
}

impl ContextRequire {
    /// The loader this context belongs to.
    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    fn referrer_mid(&self) -> Option<String> {
        self.referrer.as_ref().map(|m| m.read().mid.clone())
    }

    /// Synchronously look up an already-executed module's value.
    ///
    /// While the referrer itself is mid-execution, a circular reference
    /// back to it yields its commonjs exports object when one exists.
    pub fn require(&self, mid: &str) -> Result<Value> {
        engine::require_sync(&self.loader, mid, self.referrer.as_ref())
    }

    /// Demand `deps` relative to the referrer and invoke `callback` with
    /// their values once all of them have executed.
    pub fn require_list<F>(&self, deps: &[&str], callback: F) -> Result<()>
    where
        F: FnOnce(Vec<Value>) -> std::result::Result<Value, Value> + 'static,
    {
        let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
        let factory: Factory = Box::new(move |values, _ctx: &ContextRequire| callback(values));
        engine::require_list(&self.loader, deps, factory, self.referrer.as_ref())
    }

    /// Resolve `mid` to its absolute module id from this context.
    pub fn to_abs_mid(&self, mid: &str) -> String {
        let config = self.loader.inner.config.lock();
        resolver::module_info(&config, mid, self.referrer_mid().as_deref()).mid
    }

    /// Resolve a module-id-shaped path to a url from this context.
    pub fn to_url(&self, id: &str) -> String {
        let config = self.loader.inner.config.lock();
        resolver::to_url(&config, id, self.referrer_mid().as_deref())
    }
}
