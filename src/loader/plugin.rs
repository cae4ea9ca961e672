// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader plugins.
//!
//! A dependency id of the form `plugin!resource` hands the part after the
//! `!` to the module named before it, which must execute to a value
//! carrying [`LoaderPlugin`] capability. The plugin produces the resource's
//! value asynchronously through a one-shot callback. When a resource is
//! requested before its plugin has loaded, the request parks on the plugin
//! module under a placeholder record and is replayed once the plugin
//! executes.

use crate::error::{LoaderError, Result};
use crate::loader::module::{
    ExecState, FixSlot, Module, ModuleHandle, ModuleKind, PendingPluginRequest,
};
use crate::loader::{engine, resolver, ContextRequire, Loader};
use crate::value::Value;
use parking_lot::RwLock;
use std::sync::Arc;

/// One-shot completion callback handed to [`LoaderPlugin::load`].
pub type PluginCallback = Box<dyn FnOnce(Value)>;

/// Capability that lets a module value service `plugin!resource`
/// dependencies.
pub trait LoaderPlugin {
    /// Produce the value for `resource_id`, reporting it through `done`.
    /// May complete synchronously or from a later scheduled task.
    fn load(&self, resource_id: &str, require: &ContextRequire, done: PluginCallback);

    /// Rewrite a raw resource id into its canonical form. The default
    /// treats the id as a module id and resolves it with `resolve`.
    fn normalize(&self, resource_id: &str, resolve: &dyn Fn(&str) -> String) -> String {
        resolve(resource_id)
    }

    /// Whether every request must reach [`LoaderPlugin::load`], even for a
    /// resource id seen before. Dynamic resources are never cached.
    fn dynamic(&self) -> bool {
        false
    }
}

fn capability_of(handle: &ModuleHandle) -> Option<Arc<dyn LoaderPlugin>> {
    match &handle.read().kind {
        ModuleKind::Plugin(capability) => Some(Arc::clone(capability)),
        ModuleKind::Plain => None,
    }
}

fn normalize_resource(
    loader: &Loader,
    capability: &Arc<dyn LoaderPlugin>,
    resource_id: &str,
    referrer: Option<&ModuleHandle>,
) -> String {
    let referrer_mid = referrer.map(|m| m.read().mid.clone());
    let resolve = |id: &str| {
        let config = loader.inner.config.lock();
        resolver::module_info(&config, id, referrer_mid.as_deref()).mid
    };
    capability.normalize(resource_id, &resolve)
}

/// Look up or create the record for a ready plugin's resource.
fn resource_record(
    loader: &Loader,
    plugin_handle: &ModuleHandle,
    capability: &Arc<dyn LoaderPlugin>,
    resource_id: &str,
    referrer: Option<&ModuleHandle>,
) -> ModuleHandle {
    let plugin_mid = plugin_handle.read().mid.clone();
    let normalized = normalize_resource(loader, capability, resource_id, referrer);
    let mid = if capability.dynamic() {
        // unique record per request so the plugin is consulted every time
        format!("{plugin_mid}!{normalized}*{}", engine::next_uid(loader))
    } else {
        format!("{plugin_mid}!{normalized}")
    };
    let mut registry = loader.inner.registry.lock();
    let handle = registry.entry(mid.clone()).or_insert_with(|| {
        let mut record = Module::new(&mid, "", "");
        record.plugin = Some(Arc::clone(plugin_handle));
        record.resource_id = Some(normalized);
        Arc::new(RwLock::new(record))
    });
    Arc::clone(handle)
}

/// Resolve a `plugin!resource` dependency id to a module record.
///
/// When the plugin module has not executed yet, the returned record is a
/// placeholder; `fix` names the dependency slot to repoint at the real
/// record once the plugin arrives and normalizes the resource id.
pub(crate) fn get_plugin_resource(
    loader: &Loader,
    full_mid: &str,
    referrer: Option<&ModuleHandle>,
    fix: Option<FixSlot>,
) -> Result<ModuleHandle> {
    let (plugin_part, resource_id) = full_mid
        .split_once('!')
        .ok_or_else(|| LoaderError::resolution(full_mid))?;
    let plugin_handle = engine::get_module(loader, plugin_part, referrer, None)?;

    if let Some(capability) = capability_of(&plugin_handle) {
        return Ok(resource_record(
            loader,
            &plugin_handle,
            &capability,
            resource_id,
            referrer,
        ));
    }

    // plugin not ready; park the request on its record
    let plugin_mid = plugin_handle.read().mid.clone();
    let placeholder_mid = format!("{plugin_mid}!*{}", engine::next_uid(loader));
    let placeholder = {
        let mut record = Module::new(&placeholder_mid, "", "");
        record.plugin = Some(Arc::clone(&plugin_handle));
        record.resource_id = Some(resource_id.to_string());
        record.synthetic = true;
        // the parked request stands in for the injection; nothing must try
        // to inject the placeholder itself
        record.injected = true;
        Arc::new(RwLock::new(record))
    };
    loader
        .inner
        .registry
        .lock()
        .insert(placeholder_mid.clone(), Arc::clone(&placeholder));
    plugin_handle.write().load_queue.push(PendingPluginRequest {
        resource_id: resource_id.to_string(),
        referrer: referrer.map(Arc::clone),
        fix,
        placeholder_mid,
    });
    loader.inner.engine.lock().waiting += 1;
    engine::demand(loader, &plugin_handle, None)?;
    engine::prioritize(loader, &plugin_handle);
    Ok(placeholder)
}

/// Start loading a plugin resource whose plugin is ready.
pub(crate) fn inject_plugin(loader: &Loader, handle: &ModuleHandle) -> Result<()> {
    let (plugin_handle, resource_id, mid) = {
        let module = handle.read();
        let plugin_handle = module
            .plugin
            .clone()
            .ok_or_else(|| LoaderError::resolution(&module.mid))?;
        let resource_id = module.resource_id.clone().unwrap_or_default();
        (plugin_handle, resource_id, module.mid.clone())
    };
    let capability = capability_of(&plugin_handle).ok_or_else(|| {
        LoaderError::resolution(format!(
            "plugin for '{mid}' has not executed to a plugin capability"
        ))
    })?;

    loader.inner.engine.lock().waiting += 1;

    let done_loader = loader.clone();
    let done_handle = Arc::clone(handle);
    let done: PluginCallback = Box::new(move |value| {
        {
            let mut module = done_handle.write();
            module.state = ExecState::Executed;
            module.result = Some(value);
        }
        done_loader.inner.engine.lock().waiting -= 1;
        if let Err(error) = engine::check_complete(&done_loader) {
            tracing::error!(error = %error, "plugin resource completion failed");
        }
    });
    let ctx = loader.context();
    capability.load(&resource_id, &ctx, done);
    Ok(())
}

/// Replay requests that parked on a module while it loaded. Called after
/// the module executes; a module that collected requests but produced no
/// plugin capability is an error.
pub(crate) fn promote(loader: &Loader, plugin_handle: &ModuleHandle) -> Result<()> {
    let (capability, requests, plugin_mid) = {
        let mut module = plugin_handle.write();
        let requests = std::mem::take(&mut module.load_queue);
        let capability = match &module.kind {
            ModuleKind::Plugin(capability) => Some(Arc::clone(capability)),
            ModuleKind::Plain => None,
        };
        (capability, requests, module.mid.clone())
    };
    if requests.is_empty() {
        return Ok(());
    }
    let Some(capability) = capability else {
        return Err(LoaderError::resolution(format!(
            "module '{plugin_mid}' was used as a plugin but provides no plugin capability"
        )));
    };

    for request in requests {
        let real = resource_record(
            loader,
            plugin_handle,
            &capability,
            &request.resource_id,
            request.referrer.as_ref(),
        );
        if let Some(fix) = request.fix {
            if let Some(dependent) = fix.dependent.upgrade() {
                let mut module = dependent.write();
                if let Some(deps) = module.deps.as_mut() {
                    if let Some(slot) = deps.get_mut(fix.index) {
                        *slot = crate::loader::module::Dep::Record(Arc::clone(&real));
                    }
                }
            }
        }
        loader.inner.registry.lock().remove(&request.placeholder_mid);
        loader.inner.engine.lock().waiting -= 1;
        engine::demand(loader, &real, Some(plugin_mid.clone()))?;
    }
    Ok(())
}
