// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module records tracked by the loader registry.

use crate::loader::plugin::LoaderPlugin;
use crate::loader::ContextRequire;
use crate::value::Value;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Shared, mutable handle to a module record.
pub type ModuleHandle = Arc<RwLock<Module>>;

/// Factory invoked to produce a module's value, with the resolved values of
/// its dependencies as arguments. `Err` marks the module (and anything that
/// requested it) as failed.
pub type Factory =
    Box<dyn FnOnce(Vec<Value>, &ContextRequire) -> std::result::Result<Value, Value>>;

/// A dependency slot of a module.
///
/// The three pseudo dependencies are resolved from the dependent module
/// itself rather than from the registry.
pub enum Dep {
    /// The dependent's context-sensitive `require`
    Require,
    /// The dependent's commonjs-style `exports` object
    Exports,
    /// The dependent's module descriptor object
    ModuleObject,
    /// A real module record
    Record(ModuleHandle),
}

impl Clone for Dep {
    fn clone(&self) -> Dep {
        match self {
            Dep::Require => Dep::Require,
            Dep::Exports => Dep::Exports,
            Dep::ModuleObject => Dep::ModuleObject,
            Dep::Record(handle) => Dep::Record(Arc::clone(handle)),
        }
    }
}

/// Execution progress of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Factory not yet invoked
    NotStarted,
    /// Factory invocation in progress somewhere on the stack
    Executing,
    /// Factory complete; result is final
    Executed,
}

/// Outcome of attempting to execute a module.
#[derive(Clone)]
pub enum Exec {
    /// The module's value
    Done(Value),
    /// Execution could not proceed yet (missing definition or a circular
    /// dependency that is still executing)
    Abort,
}

/// How the module participates in plugin resolution.
#[derive(Clone)]
pub enum ModuleKind {
    /// An ordinary module
    Plain,
    /// A module whose value carries loader-plugin capability
    Plugin(Arc<dyn LoaderPlugin>),
}

/// Commonjs-style state lazily attached when a module's dependency list
/// names `exports` or `module`.
pub struct CjsContext {
    /// The shared exports object, created before execution so circular
    /// dependents can observe it
    pub exports: Value,
    /// The `module` descriptor (`id`, `uri`, `exports`)
    pub descriptor: Value,
}

/// Back-reference from a queued plugin resource to the dependency slot that
/// requested it, so the slot can be repointed once the plugin normalizes
/// the resource id.
pub struct FixSlot {
    /// The module whose dependency list holds the slot
    pub dependent: Weak<RwLock<Module>>,
    /// Index into that module's dependency list
    pub index: usize,
}

/// A request queued against a plugin module that has not finished loading.
pub struct PendingPluginRequest {
    /// Raw (pre-normalize) resource id
    pub resource_id: String,
    /// Reference module for relative normalization
    pub referrer: Option<ModuleHandle>,
    /// Slot to patch once the true resource record exists
    pub fix: Option<FixSlot>,
    /// Registry id of the placeholder record standing in for the resource
    pub placeholder_mid: String,
}

/// One entry in the loader registry.
pub struct Module {
    /// Absolute module id
    pub mid: String,
    /// Owning package name, empty when none matched
    pub pid: String,
    /// Resolved source url
    pub url: String,
    /// Dependency slots, present once the module is defined
    pub deps: Option<Vec<Dep>>,
    /// Factory, taken out of the record at execution time
    pub factory: Option<Factory>,
    /// Literal value given instead of a factory
    pub literal: Option<Value>,
    /// Execution progress
    pub state: ExecState,
    /// Result of execution
    pub result: Option<Value>,
    /// Whether injection has been requested for this record
    pub injected: bool,
    /// Records created for anonymous top-level requests; removed from the
    /// registry once executed
    pub synthetic: bool,
    /// Plugin capability detected on the executed value
    pub kind: ModuleKind,
    /// Commonjs context, when the dependency list asked for it
    pub cjs: Option<CjsContext>,
    /// For plugin resources: the plugin module that must produce the value
    pub plugin: Option<ModuleHandle>,
    /// For plugin resources: the resource id after the plugin's `!`
    pub resource_id: Option<String>,
    /// Requests parked on this record while it loads as a plugin
    pub load_queue: Vec<PendingPluginRequest>,
    /// Cached context-sensitive require value handed to factories
    pub req_ref: Option<Value>,
}

impl Module {
    /// Fresh, undefined record for `mid` resolved to `url` within `pid`.
    pub fn new(mid: &str, pid: &str, url: &str) -> Module {
        Module {
            mid: mid.to_string(),
            pid: pid.to_string(),
            url: url.to_string(),
            deps: None,
            factory: None,
            literal: None,
            state: ExecState::NotStarted,
            result: None,
            injected: false,
            synthetic: false,
            kind: ModuleKind::Plain,
            cjs: None,
            plugin: None,
            resource_id: None,
            load_queue: Vec::new(),
            req_ref: None,
        }
    }

    /// Whether the record has a definition (factory or literal value) or a
    /// dependency list.
    pub fn is_defined(&self) -> bool {
        self.factory.is_some() || self.literal.is_some() || self.deps.is_some()
    }

    /// Whether execution finished.
    pub fn is_executed(&self) -> bool {
        self.state == ExecState::Executed
    }
}
