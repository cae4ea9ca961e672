// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Dependency injection and bottom-up execution.
//!
//! Demanded modules enter the execution queue once defined. After every
//! completion event (an injection finishing, a plugin resource arriving, a
//! new top-level request) the engine rescans the queue: a module whose
//! transitive dependencies have all executed runs its factory, anything
//! else aborts and stays queued for the next pass. The scan restarts from
//! the front after every successful execution, so modules run as early as
//! dependency order allows.

use crate::error::{LoaderError, Result};
use crate::loader::module::{
    CjsContext, Dep, Exec, ExecState, Factory, Module, ModuleHandle, ModuleKind,
};
use crate::loader::{plugin, resolver, ContextRequire, Loader};
use crate::value::{NativeFunction, Value};
use parking_lot::RwLock;
use regex::Regex;
use std::sync::{Arc, LazyLock};

/// Anonymous definition parked between a `define` call and the injection
/// completion that claims it.
pub(crate) struct DefineCapture {
    pub(crate) deps: Vec<String>,
    pub(crate) factory: Option<Factory>,
    pub(crate) literal: Option<Value>,
}

/// Bookkeeping for the execution engine.
#[derive(Default)]
pub(crate) struct EngineState {
    /// Defined modules awaiting execution
    pub(crate) exec_q: Vec<ModuleHandle>,
    /// Parked anonymous definition
    pub(crate) def_capture: Option<DefineCapture>,
    /// Injections and plugin resources in flight
    pub(crate) waiting: usize,
    /// Nonzero while a completion scan is on the stack
    pub(crate) guard: u32,
    /// Module ids currently executing, outermost first
    pub(crate) trace: Vec<String>,
    /// Source for unique synthetic module ids
    pub(crate) uid: u64,
}

pub(crate) fn next_uid(loader: &Loader) -> u64 {
    let mut engine = loader.inner.engine.lock();
    engine.uid += 1;
    engine.uid
}

pub(crate) fn capture_define(
    loader: &Loader,
    deps: Vec<String>,
    factory: Option<Factory>,
    literal: Option<Value>,
) {
    let mut engine = loader.inner.engine.lock();
    if engine.def_capture.is_some() {
        tracing::warn!("anonymous definition replaced an unclaimed one");
    }
    engine.def_capture = Some(DefineCapture {
        deps,
        factory,
        literal,
    });
}

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)/\*[\s\S]*?\*/|//.*$").expect("comment pattern"));
static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"require\s*\(\s*["']([^"']+)["']\s*\)"#).expect("require pattern")
});

/// Extract the module ids named by `require("...")` calls in `source`,
/// ignoring commented-out code.
pub(crate) fn scan_cjs_requires(source: &str) -> Vec<String> {
    let stripped = COMMENT_RE.replace_all(source, "");
    let mut found = Vec::new();
    for capture in REQUIRE_RE.captures_iter(&stripped) {
        let mid = capture[1].to_string();
        if !found.contains(&mid) {
            found.push(mid);
        }
    }
    found
}

/// Look up or create the registry record for `mid` resolved against
/// `referrer`. Ids containing `!` denote plugin resources.
pub(crate) fn get_module(
    loader: &Loader,
    mid: &str,
    referrer: Option<&ModuleHandle>,
    fix: Option<crate::loader::module::FixSlot>,
) -> Result<ModuleHandle> {
    if mid.contains('!') {
        return plugin::get_plugin_resource(loader, mid, referrer, fix);
    }
    let referrer_mid = referrer.map(|m| m.read().mid.clone());
    let info = {
        let config = loader.inner.config.lock();
        resolver::module_info(&config, mid, referrer_mid.as_deref())
    };
    let mut registry = loader.inner.registry.lock();
    let handle = registry
        .entry(info.mid.clone())
        .or_insert_with(|| Arc::new(RwLock::new(Module::new(&info.mid, &info.pid, &info.url))));
    Ok(Arc::clone(handle))
}

/// Synchronous lookup of an executed module's value.
pub(crate) fn require_sync(
    loader: &Loader,
    mid: &str,
    referrer: Option<&ModuleHandle>,
) -> Result<Value> {
    let abs = if let Some((plugin_part, resource)) = mid.split_once('!') {
        // only a ready plugin can tell us the resource's true id
        let plugin_handle = get_module(loader, plugin_part, referrer, None)?;
        let plugin_mid = plugin_handle.read().mid.clone();
        let capability = match &plugin_handle.read().kind {
            ModuleKind::Plugin(p) => Arc::clone(p),
            ModuleKind::Plain => return Err(LoaderError::NotLoaded(mid.to_string())),
        };
        let referrer_mid = referrer.map(|m| m.read().mid.clone());
        let resolve = |id: &str| {
            let config = loader.inner.config.lock();
            resolver::module_info(&config, id, referrer_mid.as_deref()).mid
        };
        format!("{plugin_mid}!{}", capability.normalize(resource, &resolve))
    } else {
        let referrer_mid = referrer.map(|m| m.read().mid.clone());
        let config = loader.inner.config.lock();
        resolver::module_info(&config, mid, referrer_mid.as_deref()).mid
    };

    let handle = loader
        .inner
        .registry
        .lock()
        .get(&abs)
        .cloned()
        .ok_or_else(|| LoaderError::NotLoaded(abs.clone()))?;
    let module = handle.read();
    match module.state {
        ExecState::Executed => Ok(module.result.clone().unwrap_or(Value::Undefined)),
        // a circular reference back into an executing module observes its
        // exports so far
        ExecState::Executing => module
            .cjs
            .as_ref()
            .map(|cjs| cjs.exports.clone())
            .ok_or_else(|| LoaderError::NotLoaded(abs.clone())),
        ExecState::NotStarted => Err(LoaderError::NotLoaded(abs)),
    }
}

/// Demand `deps` and run `factory` with their values once all of them have
/// executed. Implemented as a synthetic one-shot module so the ordinary
/// queue machinery drives the callback.
pub(crate) fn require_list(
    loader: &Loader,
    deps: Vec<String>,
    factory: Factory,
    referrer: Option<&ModuleHandle>,
) -> Result<()> {
    let uid = next_uid(loader);
    let mid = format!("*{uid}");
    let handle = Arc::new(RwLock::new(Module::new(&mid, "", "")));
    {
        let mut module = handle.write();
        module.synthetic = true;
        module.injected = true;
    }
    loader
        .inner
        .registry
        .lock()
        .insert(mid, Arc::clone(&handle));
    apply_definition(loader, &handle, deps, Some(factory), None, referrer)?;
    check_complete(loader)
}

/// Named definition entry point. A repeated definition for an id is
/// ignored.
pub(crate) fn define_named(
    loader: &Loader,
    mid: &str,
    deps: Vec<String>,
    factory: Option<Factory>,
    literal: Option<Value>,
) -> Result<()> {
    let handle = get_module(loader, mid, None, None)?;
    if handle.read().is_defined() {
        tracing::warn!(mid, "module redefinition ignored");
        return Ok(());
    }
    apply_definition(loader, &handle, deps, factory, literal, Some(&handle))?;
    check_complete(loader)
}

/// Mark a module as needed: enqueue it for execution when already defined,
/// otherwise start its injection. `parent` names the requester for load
/// diagnostics.
pub(crate) fn demand(loader: &Loader, handle: &ModuleHandle, parent: Option<String>) -> Result<()> {
    let defined = {
        let mut module = handle.write();
        if module.injected || module.is_executed() {
            return Ok(());
        }
        module.injected = true;
        module.is_defined()
    };
    if defined {
        enqueue(loader, handle);
        let mid = handle.read().mid.clone();
        let deps = snapshot_record_deps(handle);
        for dep in deps {
            demand(loader, &dep, Some(mid.clone()))?;
        }
        Ok(())
    } else {
        inject_module(loader, handle, parent)
    }
}

fn enqueue(loader: &Loader, handle: &ModuleHandle) {
    let mut engine = loader.inner.engine.lock();
    if !engine.exec_q.iter().any(|m| Arc::ptr_eq(m, handle)) {
        engine.exec_q.push(Arc::clone(handle));
    }
}

/// Move a queued module to the front of the execution queue. Plugin
/// modules run ahead of anything waiting on their resources.
pub(crate) fn prioritize(loader: &Loader, handle: &ModuleHandle) {
    let mut engine = loader.inner.engine.lock();
    if let Some(pos) = engine.exec_q.iter().position(|m| Arc::ptr_eq(m, handle)) {
        let entry = engine.exec_q.remove(pos);
        engine.exec_q.insert(0, entry);
    }
}

fn snapshot_record_deps(handle: &ModuleHandle) -> Vec<ModuleHandle> {
    handle
        .read()
        .deps
        .iter()
        .flatten()
        .filter_map(|dep| match dep {
            Dep::Record(dep) => Some(Arc::clone(dep)),
            _ => None,
        })
        .collect()
}

/// Start fetching a module's definition, through the seeded source cache
/// when one exists, the installed injector otherwise.
fn inject_module(loader: &Loader, handle: &ModuleHandle, parent: Option<String>) -> Result<()> {
    if handle.read().plugin.is_some() {
        return plugin::inject_plugin(loader, handle);
    }
    let (mid, url) = {
        let module = handle.read();
        (module.mid.clone(), module.url.clone())
    };

    loader.inner.engine.lock().waiting += 1;

    let thunk = loader.inner.sources.lock().remove(&mid);
    if let Some(thunk) = thunk {
        match thunk(loader) {
            Ok(()) => return finish_injection(loader, handle),
            Err(error) => {
                // fall back to the injector for this module
                tracing::warn!(mid = %mid, error = %error, "seeded source failed");
                loader.inner.engine.lock().def_capture = None;
            }
        }
    }

    let injector = loader.inner.injector.lock().clone();
    let Some(injector) = injector else {
        loader.inner.engine.lock().waiting -= 1;
        return Err(LoaderError::load_failed(
            &mid,
            &url,
            parent,
            "no source injector installed",
        ));
    };

    let request = InjectRequestParts {
        loader: loader.clone(),
        handle: Arc::clone(handle),
        mid: mid.clone(),
        url: url.clone(),
        parent: parent.clone(),
    };
    let done: crate::loader::InjectDone = Box::new(move |outcome| match outcome {
        Ok(()) => finish_injection(&request.loader, &request.handle),
        Err(reason) => {
            request.loader.inner.engine.lock().waiting -= 1;
            Err(LoaderError::load_failed(
                &request.mid,
                &request.url,
                request.parent,
                reason,
            ))
        }
    });
    injector.inject(
        crate::loader::InjectRequest { mid, url, parent },
        loader,
        done,
    )
}

struct InjectRequestParts {
    loader: Loader,
    handle: ModuleHandle,
    mid: String,
    url: String,
    parent: Option<String>,
}

/// Claim the parked anonymous definition for a module whose injection just
/// completed, then rescan.
pub(crate) fn finish_injection(loader: &Loader, handle: &ModuleHandle) -> Result<()> {
    let capture = loader.inner.engine.lock().def_capture.take();
    let defined = handle.read().is_defined();
    let applied = match capture {
        Some(capture) if !defined => apply_definition(
            loader,
            handle,
            capture.deps,
            capture.factory,
            capture.literal,
            Some(handle),
        ),
        Some(_) => {
            // a named define inside the source already landed
            tracing::warn!(
                mid = %handle.read().mid,
                "anonymous definition ignored; module already defined"
            );
            Ok(())
        }
        None if defined => Ok(()),
        None => {
            // a source with no define still counts, with no value
            tracing::warn!(mid = %handle.read().mid, "source did not define a module");
            apply_definition(
                loader,
                handle,
                Vec::new(),
                None,
                Some(Value::Undefined),
                Some(handle),
            )
        }
    };
    loader.inner.engine.lock().waiting -= 1;
    applied?;
    check_complete(loader)
}

fn ensure_cjs(handle: &ModuleHandle) {
    let mut module = handle.write();
    if module.cjs.is_some() {
        return;
    }
    let exports = Value::object();
    let descriptor = Value::object();
    descriptor.set("id", Value::string(module.mid.clone()));
    descriptor.set("url", Value::string(module.url.clone()));
    descriptor.set("exports", exports.clone());
    module.cjs = Some(CjsContext {
        exports,
        descriptor,
    });
}

/// Attach a definition to a record: resolve dependency ids, store the
/// factory, enqueue when demanded, and demand the dependencies.
fn apply_definition(
    loader: &Loader,
    handle: &ModuleHandle,
    dep_ids: Vec<String>,
    factory: Option<Factory>,
    literal: Option<Value>,
    resolve_referrer: Option<&ModuleHandle>,
) -> Result<()> {
    let mut deps = Vec::with_capacity(dep_ids.len());
    for (index, dep_id) in dep_ids.iter().enumerate() {
        let dep = match dep_id.as_str() {
            "require" => Dep::Require,
            "exports" => {
                ensure_cjs(handle);
                Dep::Exports
            }
            "module" => {
                ensure_cjs(handle);
                Dep::ModuleObject
            }
            _ => {
                let fix = crate::loader::module::FixSlot {
                    dependent: Arc::downgrade(handle),
                    index,
                };
                Dep::Record(get_module(loader, dep_id, resolve_referrer, Some(fix))?)
            }
        };
        deps.push(dep);
    }

    let demanded = {
        let mut module = handle.write();
        module.deps = Some(deps);
        module.factory = factory;
        module.literal = literal;
        module.injected
    };
    if demanded {
        enqueue(loader, handle);
        let mid = handle.read().mid.clone();
        for dep in snapshot_record_deps(handle) {
            demand(loader, &dep, Some(mid.clone()))?;
        }
    }
    Ok(())
}

fn context_require_value(loader: &Loader, handle: &ModuleHandle) -> Value {
    if let Some(existing) = &handle.read().req_ref {
        return existing.clone();
    }
    let ctx = ContextRequire {
        loader: loader.clone(),
        referrer: Some(Arc::clone(handle)),
    };
    let value = Value::Function(NativeFunction::new(move |args: Vec<Value>| {
        let mid = args
            .first()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Value::error("TypeError", "require expects a module id"))?;
        ctx.require(&mid)
            .map_err(|error| Value::error("Error", error.to_string()))
    }));
    handle.write().req_ref = Some(value.clone());
    value
}

/// Try to execute a module: execute its dependencies depth-first, then run
/// its factory. Aborts (leaving the record queued) when a dependency has no
/// definition yet.
pub(crate) fn exec_module(loader: &Loader, handle: &ModuleHandle) -> Result<Exec> {
    {
        let module = handle.read();
        match module.state {
            ExecState::Executed => {
                return Ok(Exec::Done(module.result.clone().unwrap_or(Value::Undefined)));
            }
            ExecState::Executing => {
                // circular dependency; hand back the exports placeholder so
                // both sides of the cycle share one object identity. A
                // module that declared the exports pseudo-dependency opted
                // into circularity, so only bare cycles get the warning.
                let declared_exports = module.deps.as_ref().is_some_and(|deps| {
                    deps.iter()
                        .any(|dep| matches!(dep, Dep::Exports | Dep::ModuleObject))
                });
                if !declared_exports {
                    let cycle = loader.inner.engine.lock().trace.join(" -> ");
                    tracing::warn!(mid = %module.mid, cycle = %cycle, "circular dependency");
                }
                return Ok(Exec::Done(
                    module
                        .cjs
                        .as_ref()
                        .map(|cjs| cjs.exports.clone())
                        .unwrap_or(Value::Undefined),
                ));
            }
            ExecState::NotStarted => {}
        }
        if !module.is_defined() {
            return Ok(Exec::Abort);
        }
    }

    let mid = handle.read().mid.clone();
    {
        // every record carries an exports placeholder before its factory
        // runs; a circular dependent reads it through the live object
        ensure_cjs(handle);
        handle.write().state = ExecState::Executing;
        loader.inner.engine.lock().trace.push(mid.clone());
    }

    let deps = handle.read().deps.clone().unwrap_or_default();
    let mut args = Vec::with_capacity(deps.len());
    for dep in &deps {
        let value = match dep {
            Dep::Require => context_require_value(loader, handle),
            Dep::Exports => match &handle.read().cjs {
                Some(cjs) => cjs.exports.clone(),
                None => Value::Undefined,
            },
            Dep::ModuleObject => match &handle.read().cjs {
                Some(cjs) => cjs.descriptor.clone(),
                None => Value::Undefined,
            },
            Dep::Record(dep) => match exec_module(loader, dep) {
                Ok(Exec::Done(value)) => value,
                Ok(Exec::Abort) => {
                    handle.write().state = ExecState::NotStarted;
                    loader.inner.engine.lock().trace.pop();
                    return Ok(Exec::Abort);
                }
                Err(error) => {
                    // a failed dependency must not strand this record in
                    // the executing state; a later pass retries it and
                    // sees the dependency's settled error value
                    handle.write().state = ExecState::NotStarted;
                    loader.inner.engine.lock().trace.pop();
                    return Err(error);
                }
            },
        };
        args.push(value);
    }

    let (factory, literal) = {
        let mut module = handle.write();
        (module.factory.take(), module.literal.take())
    };
    let outcome = match factory {
        Some(factory) => {
            let ctx = ContextRequire {
                loader: loader.clone(),
                referrer: Some(Arc::clone(handle)),
            };
            factory(args, &ctx)
        }
        None => Ok(literal.unwrap_or(Value::Undefined)),
    };
    loader.inner.engine.lock().trace.pop();

    let value = match outcome {
        Ok(value) => value,
        Err(error) => {
            // the record settles with the error value so dependents see it
            {
                let mut module = handle.write();
                module.state = ExecState::Executed;
                module.result = Some(error.clone());
            }
            return Err(LoaderError::Factory {
                mid,
                message: error.to_string(),
            });
        }
    };

    // an undefined factory return adopts the commonjs exports object
    let result = {
        let mut module = handle.write();
        let result = if value.is_undefined() {
            module
                .cjs
                .as_ref()
                .map(|cjs| cjs.exports.clone())
                .unwrap_or(value)
        } else {
            value
        };
        module.state = ExecState::Executed;
        module.result = Some(result.clone());
        if let Value::Plugin(capability) = &result {
            module.kind = ModuleKind::Plugin(Arc::clone(capability));
        }
        result
    };

    let (synthetic, promote) = {
        let module = handle.read();
        (
            module.synthetic,
            !module.load_queue.is_empty() || matches!(module.kind, ModuleKind::Plugin(_)),
        )
    };
    if synthetic {
        loader.inner.registry.lock().remove(&mid);
    }
    if promote {
        plugin::promote(loader, handle)?;
    }
    Ok(Exec::Done(result))
}

/// Rescan the execution queue. Reentrant calls from inside a factory are
/// absorbed; the outermost scan keeps going until a full pass makes no
/// progress, then fires idle observers if nothing remains in flight.
pub(crate) fn check_complete(loader: &Loader) -> Result<()> {
    {
        let mut engine = loader.inner.engine.lock();
        if engine.guard > 0 {
            return Ok(());
        }
        engine.guard += 1;
    }
    let result = scan(loader);
    loader.inner.engine.lock().guard -= 1;
    if result.is_ok() {
        maybe_idle(loader);
    }
    result
}

fn scan(loader: &Loader) -> Result<()> {
    let mut index = 0;
    loop {
        let handle = {
            let engine = loader.inner.engine.lock();
            match engine.exec_q.get(index) {
                Some(handle) => Arc::clone(handle),
                None => break,
            }
        };
        match exec_module(loader, &handle)? {
            Exec::Done(_) => {
                let mut engine = loader.inner.engine.lock();
                if let Some(pos) = engine.exec_q.iter().position(|m| Arc::ptr_eq(m, &handle)) {
                    engine.exec_q.remove(pos);
                }
                // something ran; earlier aborts may succeed now
                index = 0;
            }
            Exec::Abort => index += 1,
        }
    }
    Ok(())
}

fn maybe_idle(loader: &Loader) {
    let drained = {
        let engine = loader.inner.engine.lock();
        engine.waiting == 0 && engine.exec_q.is_empty() && engine.def_capture.is_none()
    };
    if !drained {
        return;
    }
    let mut observers = loader.inner.idle.lock();
    observers.retain(|observer| !observer.token.is_removed());
    for observer in observers.iter() {
        let callback = Arc::clone(&observer.callback);
        loader.inner.queue.add(move || callback());
    }
}
