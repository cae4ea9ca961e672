// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Shared test fixtures: scripted source injectors and queue helpers.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use strand::task_queue::TaskQueue;
use strand::{InjectDone, InjectRequest, Loader, Result, SourceInjector};

/// Run the queue dry, including tasks scheduled by earlier tasks.
pub fn drain(queue: &TaskQueue) {
    queue.run_until_idle();
}

type Script = Box<dyn FnOnce(&Loader)>;

/// An injector that satisfies requests synchronously from scripted
/// definitions. A request with no script fails the load.
#[derive(Default)]
pub struct ScriptedInjector {
    scripts: Mutex<HashMap<String, Script>>,
    requested: Mutex<Vec<String>>,
}

impl ScriptedInjector {
    pub fn new() -> ScriptedInjector {
        ScriptedInjector::default()
    }

    pub fn script<F>(&self, mid: &str, script: F)
    where
        F: FnOnce(&Loader) + 'static,
    {
        self.scripts
            .lock()
            .insert(mid.to_string(), Box::new(script));
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

impl SourceInjector for ScriptedInjector {
    fn inject(&self, request: InjectRequest, loader: &Loader, done: InjectDone) -> Result<()> {
        self.requested.lock().push(request.mid.clone());
        // drop the guard before running the script; `done` re-enters
        // `inject` for nested dependencies
        let script = self.scripts.lock().remove(&request.mid);
        match script {
            Some(script) => {
                script(loader);
                done(Ok(()))
            }
            None => done(Err(format!("not found: {}", request.url))),
        }
    }
}

/// An injector that completes on the task queue, so definitions land a
/// drain later than the request. Load errors are collected rather than
/// propagated, since they surface after the original call returned.
#[derive(Default)]
pub struct DeferredInjector {
    scripts: Mutex<HashMap<String, Script>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl DeferredInjector {
    pub fn new() -> DeferredInjector {
        DeferredInjector::default()
    }

    pub fn script<F>(&self, mid: &str, script: F)
    where
        F: FnOnce(&Loader) + 'static,
    {
        self.scripts
            .lock()
            .insert(mid.to_string(), Box::new(script));
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl SourceInjector for DeferredInjector {
    fn inject(&self, request: InjectRequest, loader: &Loader, done: InjectDone) -> Result<()> {
        let script = self.scripts.lock().remove(&request.mid);
        let loader = loader.clone();
        let errors = Arc::clone(&self.errors);
        let url = request.url.clone();
        let queue = loader.queue().clone();
        queue.add(move || {
            let outcome = match script {
                Some(script) => {
                    script(&loader);
                    done(Ok(()))
                }
                None => done(Err(format!("not found: {url}"))),
            };
            if let Err(error) = outcome {
                errors.lock().push(error.to_string());
            }
        });
        Ok(())
    }
}
