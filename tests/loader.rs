// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! End-to-end loader tests driven through scripted source injectors.

mod common;

use common::{drain, DeferredInjector, ScriptedInjector};
use parking_lot::Mutex;
use std::sync::Arc;
use strand::loader::plugin::{LoaderPlugin, PluginCallback};
use strand::task_queue::TaskQueue;
use strand::{ContextRequire, Loader, LoaderConfig, LoaderError, SourceThunk, Value};

fn loader_with_injector() -> (TaskQueue, Loader, Arc<ScriptedInjector>) {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    let injector = Arc::new(ScriptedInjector::new());
    loader.set_injector(injector.clone());
    (queue, loader, injector)
}

#[test]
fn test_require_list_executes_dependency_graph() {
    let (queue, loader, injector) = loader_with_injector();
    injector.script("app/main", |l| {
        l.define(&["app/dep"], |args, _| {
            let n = args[0].as_number().unwrap_or(0.0);
            Ok(Value::Number(n + 1.0))
        });
    });
    injector.script("app/dep", |l| l.define_value(Value::Number(41.0)));

    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    loader
        .require_list(&["app/main"], move |values| {
            *result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    assert_eq!(*result.lock(), Some(Value::Number(42.0)));
    assert_eq!(injector.requested(), vec!["app/main", "app/dep"]);
}

#[test]
fn test_diamond_executes_each_module_once() {
    let (queue, loader, injector) = loader_with_injector();
    let runs = Arc::new(Mutex::new(0u32));
    let runs2 = Arc::clone(&runs);
    injector.script("d/shared", move |l| {
        l.define(&[], move |_, _| {
            *runs2.lock() += 1;
            Ok(Value::Number(1.0))
        });
    });
    injector.script("d/left", |l| {
        l.define(&["d/shared"], |args, _| Ok(args[0].clone()))
    });
    injector.script("d/right", |l| {
        l.define(&["d/shared"], |args, _| Ok(args[0].clone()))
    });

    let seen = Arc::new(Mutex::new(None));
    let seen2 = Arc::clone(&seen);
    loader
        .require_list(&["d/left", "d/right"], move |values| {
            *seen2.lock() = Some(values.len());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    assert_eq!(*seen.lock(), Some(2));
    assert_eq!(*runs.lock(), 1);
}

#[test]
fn test_circular_dependency_observes_exports_placeholder() {
    let (queue, loader, injector) = loader_with_injector();
    let early = Arc::new(Mutex::new(None));
    let placeholder = Arc::new(Mutex::new(None));

    injector.script("pkg/a", |l| {
        l.define(&["exports", "pkg/b"], |args, _| {
            args[0].set("from_a", Value::Number(1.0));
            args[0].set("saw_b", args[1].get("from_b"));
            Ok(Value::Undefined)
        });
    });
    let early2 = Arc::clone(&early);
    let placeholder2 = Arc::clone(&placeholder);
    injector.script("pkg/b", move |l| {
        l.define(&["exports", "pkg/a"], move |args, _| {
            args[0].set("from_b", Value::Number(2.0));
            // the cycle hands back a's exports before a's factory ran
            *early2.lock() = Some(args[1].get("from_a"));
            *placeholder2.lock() = Some(args[1].clone());
            Ok(Value::Undefined)
        });
    });

    let a_result = Arc::new(Mutex::new(None));
    let a_result2 = Arc::clone(&a_result);
    loader
        .require_list(&["pkg/a"], move |values| {
            *a_result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    // b executed first and saw an empty placeholder
    assert_eq!(*early.lock(), Some(Value::Undefined));
    // a saw b's finished exports
    let a = a_result.lock().clone().unwrap();
    assert_eq!(a.get("saw_b"), Value::Number(2.0));
    // the placeholder b captured is a's real exports object
    let held = placeholder.lock().clone().unwrap();
    assert_eq!(held.get("from_a"), Value::Number(1.0));
    assert_eq!(held, a);
}

#[test]
fn test_bare_cycle_hands_back_live_exports_placeholder() {
    let (queue, loader, injector) = loader_with_injector();
    let edge = Arc::new(Mutex::new(None));
    let edge2 = Arc::clone(&edge);
    injector.script("loop/a", |l| {
        l.define(&["loop/b"], |_args, _| Ok(Value::Undefined))
    });
    injector.script("loop/b", move |l| {
        l.define(&["loop/a"], move |args, _| {
            // a's factory has not run yet; the edge must still be a's
            // live exports object, not undefined
            args[0].set("tag", Value::Number(7.0));
            *edge2.lock() = Some(args[0].clone());
            Ok(Value::string("b"))
        });
    });

    let a_result = Arc::new(Mutex::new(None));
    let a_result2 = Arc::clone(&a_result);
    loader
        .require_list(&["loop/a"], move |values| {
            *a_result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    let held = edge.lock().clone().unwrap();
    assert!(matches!(held, Value::Object(_)));
    // a's undefined return adopted the same placeholder b wrote through
    let a = a_result.lock().clone().unwrap();
    assert_eq!(a, held);
    assert_eq!(a.get("tag"), Value::Number(7.0));
}

#[test]
fn test_named_defines_need_no_injector() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader
        .define_named("lib/a", &[], |_, _| Ok(Value::Number(10.0)))
        .unwrap();
    loader
        .define_named("lib/b", &["lib/a"], |args, _| {
            Ok(Value::Number(args[0].as_number().unwrap_or(0.0) * 3.0))
        })
        .unwrap();

    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    loader
        .require_list(&["lib/b"], move |values| {
            *result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    assert_eq!(*result.lock(), Some(Value::Number(30.0)));
    assert_eq!(loader.require("lib/b").unwrap(), Value::Number(30.0));
}

#[test]
fn test_redefinition_is_ignored() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader.define_named_value("once", Value::Number(1.0)).unwrap();
    loader.define_named_value("once", Value::Number(2.0)).unwrap();

    loader.require_list(&["once"], |_| Ok(Value::Undefined)).unwrap();
    drain(&queue);
    assert_eq!(loader.require("once").unwrap(), Value::Number(1.0));
}

#[test]
fn test_cjs_definition_scans_requires_and_adopts_exports() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader.define_named_value("cjs/dep", Value::Number(20.0)).unwrap();
    loader.cache_sources(vec![(
        "cjs/consumer".to_string(),
        Box::new(|l: &Loader| {
            l.define_cjs(
                r#"
                // require("cjs/ignored")
                var dep = require("cjs/dep");
                exports.sum = dep + 1;
                "#,
                |args, ctx| {
                    let dep = ctx
                        .require("cjs/dep")
                        .map_err(|e| Value::error("Error", e.to_string()))?;
                    let sum = dep.as_number().unwrap_or(0.0) + 1.0;
                    args[1].set("sum", Value::Number(sum));
                    Ok(Value::Undefined)
                },
            );
            Ok(())
        }) as SourceThunk,
    )]);

    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    loader
        .require_list(&["cjs/consumer"], move |values| {
            *result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    let exports = result.lock().clone().unwrap();
    assert_eq!(exports.get("sum"), Value::Number(21.0));
    // the commented-out id was never requested
    assert!(loader.require("cjs/ignored").is_err());
}

#[test]
fn test_require_function_dependency_resolves_relative_ids() {
    let (queue, loader, injector) = loader_with_injector();
    injector.script("rel/main", |l| {
        l.define(&["require", "rel/sibling"], |args, _| {
            let Value::Function(require) = &args[0] else {
                return Err(Value::error("TypeError", "require was not a function"));
            };
            require.call(vec![Value::string("./sibling")])
        });
    });
    injector.script("rel/sibling", |l| l.define_value(Value::string("here")));

    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    loader
        .require_list(&["rel/main"], move |values| {
            *result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    assert_eq!(*result.lock(), Some(Value::string("here")));
}

struct TextPlugin {
    loads: Mutex<Vec<String>>,
    dynamic: bool,
}

impl TextPlugin {
    fn new(dynamic: bool) -> TextPlugin {
        TextPlugin {
            loads: Mutex::new(Vec::new()),
            dynamic,
        }
    }
}

impl LoaderPlugin for TextPlugin {
    fn load(&self, resource_id: &str, _require: &ContextRequire, done: PluginCallback) {
        self.loads.lock().push(resource_id.to_string());
        done(Value::string(format!("text:{resource_id}")));
    }

    fn dynamic(&self) -> bool {
        self.dynamic
    }
}

#[test]
fn test_plugin_resource_loaded_after_plugin_arrives() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    let injector = Arc::new(DeferredInjector::new());
    loader.set_injector(injector.clone());

    let plugin = Arc::new(TextPlugin::new(false));
    let plugin2 = Arc::clone(&plugin);
    injector.script("p/plug", move |l| {
        l.define_value(Value::Plugin(plugin2));
    });

    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    // requested before the plugin module has loaded; the request parks
    loader
        .require_list(&["p/plug!res/one"], move |values| {
            *result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    assert_eq!(*result.lock(), None);
    drain(&queue);

    assert_eq!(*result.lock(), Some(Value::string("text:res/one")));
    assert_eq!(*plugin.loads.lock(), vec!["res/one"]);
    assert!(injector.errors().is_empty());
}

#[test]
fn test_plugin_resources_are_cached_by_normalized_id() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    let plugin = Arc::new(TextPlugin::new(false));
    loader
        .define_named_value("plug", Value::Plugin(Arc::clone(&plugin) as Arc<dyn LoaderPlugin>))
        .unwrap();
    // execute the plugin module itself
    loader.require_list(&["plug"], |_| Ok(Value::Undefined)).unwrap();
    drain(&queue);

    for _ in 0..2 {
        loader
            .require_list(&["plug!res/shared"], |_| Ok(Value::Undefined))
            .unwrap();
        drain(&queue);
    }
    assert_eq!(plugin.loads.lock().len(), 1);

    assert_eq!(
        loader.require("plug!res/shared").unwrap(),
        Value::string("text:res/shared")
    );
}

#[test]
fn test_dynamic_plugin_is_consulted_every_time() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    let plugin = Arc::new(TextPlugin::new(true));
    loader
        .define_named_value("dyn", Value::Plugin(Arc::clone(&plugin) as Arc<dyn LoaderPlugin>))
        .unwrap();
    loader.require_list(&["dyn"], |_| Ok(Value::Undefined)).unwrap();
    drain(&queue);

    for _ in 0..2 {
        loader
            .require_list(&["dyn!res"], |_| Ok(Value::Undefined))
            .unwrap();
        drain(&queue);
    }
    assert_eq!(plugin.loads.lock().len(), 2);
}

#[test]
fn test_module_without_plugin_capability_errors() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader.define_named_value("notplug", Value::Number(3.0)).unwrap();

    let result = loader.require_list(&["notplug!x"], |_| Ok(Value::Undefined));
    let error = result.unwrap_err();
    assert!(error.to_string().contains("no plugin capability"));
}

#[test]
fn test_undef_forces_reload() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader.define_named_value("v/mod", Value::Number(1.0)).unwrap();
    loader.require_list(&["v/mod"], |_| Ok(Value::Undefined)).unwrap();
    drain(&queue);
    assert_eq!(loader.require("v/mod").unwrap(), Value::Number(1.0));

    loader.undef("v/mod").unwrap();
    assert!(matches!(
        loader.require("v/mod"),
        Err(LoaderError::NotLoaded(_))
    ));

    loader.define_named_value("v/mod", Value::Number(2.0)).unwrap();
    loader.require_list(&["v/mod"], |_| Ok(Value::Undefined)).unwrap();
    drain(&queue);
    assert_eq!(loader.require("v/mod").unwrap(), Value::Number(2.0));
}

#[test]
fn test_load_failure_carries_context() {
    let (_queue, loader, _injector) = loader_with_injector();
    let error = loader
        .require_list(&["ghost/mod"], |_| Ok(Value::Undefined))
        .unwrap_err();
    match error {
        LoaderError::Load { mid, url, .. } => {
            assert_eq!(mid, "ghost/mod");
            assert_eq!(url, "ghost/mod.js");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_idle_observers_fire_and_can_be_removed() {
    let (queue, loader, injector) = loader_with_injector();
    injector.script("i/a", |l| l.define_value(Value::Number(1.0)));
    injector.script("i/b", |l| l.define_value(Value::Number(2.0)));

    let kept_count = Arc::new(Mutex::new(0u32));
    let removed_count = Arc::new(Mutex::new(0u32));
    let kept2 = Arc::clone(&kept_count);
    let removed2 = Arc::clone(&removed_count);
    let _kept = loader.on_idle(move || *kept2.lock() += 1);
    let removable = loader.on_idle(move || *removed2.lock() += 1);

    loader.require_list(&["i/a"], |_| Ok(Value::Undefined)).unwrap();
    drain(&queue);
    assert!(*kept_count.lock() >= 1);
    assert!(*removed_count.lock() >= 1);

    let kept_before = *kept_count.lock();
    let removed_before = *removed_count.lock();
    removable.remove();
    loader.require_list(&["i/b"], |_| Ok(Value::Undefined)).unwrap();
    drain(&queue);
    assert!(*kept_count.lock() > kept_before);
    assert_eq!(*removed_count.lock(), removed_before);
}

#[test]
fn test_configuration_drives_resolution() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader
        .configure(
            &LoaderConfig::from_json(
                r#"{
                    "baseUrl": "/srv",
                    "packages": [{"name": "app", "location": "lib/app", "main": "index"}],
                    "map": {"*": {"old": "app"}}
                }"#,
            )
            .unwrap(),
        )
        .unwrap();

    assert_eq!(loader.to_abs_mid("app"), "app/index");
    assert_eq!(loader.to_abs_mid("old/thing"), "app/thing");
    assert_eq!(loader.to_url("app/styles"), "/srv/lib/app/styles");
}

#[test]
fn test_mapped_ids_share_one_record() {
    let (queue, loader, injector) = loader_with_injector();
    loader
        .configure(&LoaderConfig::from_json(r#"{"map": {"*": {"alias": "real"}}}"#).unwrap())
        .unwrap();
    injector.script("real/mod", |l| l.define_value(Value::Number(5.0)));

    loader
        .require_list(&["alias/mod"], |_| Ok(Value::Undefined))
        .unwrap();
    drain(&queue);

    assert_eq!(loader.require("real/mod").unwrap(), Value::Number(5.0));
    assert_eq!(loader.require("alias/mod").unwrap(), Value::Number(5.0));
    assert_eq!(injector.requested(), vec!["real/mod"]);
}

#[test]
fn test_deferred_injection_completes_on_later_drains() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    let injector = Arc::new(DeferredInjector::new());
    loader.set_injector(injector.clone());
    injector.script("slow/dep", |l| l.define_value(Value::string("late")));
    injector.script("slow/main", |l| {
        l.define(&["slow/dep"], |args, _| Ok(args[0].clone()))
    });

    let result = Arc::new(Mutex::new(None));
    let result2 = Arc::clone(&result);
    loader
        .require_list(&["slow/main"], move |values| {
            *result2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();

    // nothing resolves until the queue runs the injector completions
    assert_eq!(*result.lock(), None);
    drain(&queue);
    assert_eq!(*result.lock(), Some(Value::string("late")));
    assert!(injector.errors().is_empty());
}

#[test]
fn test_factory_error_surfaces_as_factory_error() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader
        .define_named("bad", &[], |_, _| {
            Err(Value::error("Error", "factory exploded"))
        })
        .unwrap();

    let error = loader
        .require_list(&["bad"], |_| Ok(Value::Undefined))
        .unwrap_err();
    match error {
        LoaderError::Factory { mid, message } => {
            assert_eq!(mid, "bad");
            assert!(message.contains("factory exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_dependency_factory_error_leaves_dependent_retryable() {
    let queue = TaskQueue::new();
    let loader = Loader::new(&queue);
    loader
        .define_named("chain/bad", &[], |_, _| {
            Err(Value::error("Error", "dep exploded"))
        })
        .unwrap();
    loader
        .define_named("chain/top", &["chain/bad"], |args, _| Ok(args[0].clone()))
        .unwrap();

    let error = loader
        .require_list(&["chain/top"], |_| Ok(Value::Undefined))
        .unwrap_err();
    assert!(matches!(error, LoaderError::Factory { .. }));

    // the failure must not strand the dependent mid-execution; a retry
    // runs its factory with the dependency's settled error value instead
    // of handing back undefined
    let seen = Arc::new(Mutex::new(None));
    let seen2 = Arc::clone(&seen);
    loader
        .require_list(&["chain/top"], move |values| {
            *seen2.lock() = Some(values[0].clone());
            Ok(Value::Undefined)
        })
        .unwrap();
    drain(&queue);

    let value = seen.lock().clone().unwrap();
    assert_eq!(value.get("message"), Value::string("dep exploded"));
}
