// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module id normalization and url resolution.
//!
//! Resolution is purely lexical: relative segments are folded against the
//! referrer, map rules rewrite prefixes, package mains expand, and a url is
//! derived from paths overrides or the owning package's location. Nothing
//! here touches the filesystem.

use crate::loader::config::{CompiledConfig, PrefixRule};

/// Fully resolved identity of a module reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Absolute module id
    pub mid: String,
    /// Owning package name, empty when no package matched
    pub pid: String,
    /// Source url
    pub url: String,
}

/// Fold `.` and `..` segments out of a path. Leading `..` segments that
/// cannot fold are kept.
pub fn compact_path(path: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." => {}
            ".." => {
                if matches!(result.last(), Some(&last) if last != "..") {
                    result.pop();
                } else {
                    result.push("..");
                }
            }
            other => result.push(other),
        }
    }
    result.join("/")
}

/// Whether `prefix` matches `mid` exactly or as a leading path segment run.
fn prefix_matches(prefix: &str, mid: &str) -> bool {
    mid == prefix || (mid.len() > prefix.len() && mid.as_bytes()[prefix.len()] == b'/' && mid.starts_with(prefix))
}

fn run_program<'a>(programs: &'a [PrefixRule], mid: &str) -> Option<&'a PrefixRule> {
    programs.iter().find(|rule| prefix_matches(&rule.from, mid))
}

fn looks_absolute(path: &str) -> bool {
    path.starts_with('/') || path.contains("://")
}

/// Resolve `mid` against an optional referrer module id under `config`.
///
/// Steps, in order: fold relative segments against the referrer's
/// directory, apply the referrer's map scope then the `*` scope, expand a
/// bare package reference to its main, and derive the url.
pub fn module_info(config: &CompiledConfig, mid: &str, referrer: Option<&str>) -> ModuleInfo {
    let mut mid = mid.to_string();

    if mid.starts_with("./") || mid.starts_with("../") {
        let base = match referrer {
            Some(referrer) => match referrer.rfind('/') {
                Some(slash) => &referrer[..slash],
                None => "",
            },
            None => "",
        };
        mid = if base.is_empty() {
            compact_path(&mid)
        } else {
            compact_path(&format!("{base}/{mid}"))
        };
    } else {
        mid = compact_path(&mid);
    }

    // the referrer's scope wins over the star scope
    let mapped = referrer
        .and_then(|referrer| {
            config
                .scopes
                .iter()
                .find(|scope| prefix_matches(&scope.scope, referrer))
        })
        .and_then(|scope| run_program(&scope.rules, &mid))
        .or_else(|| run_program(&config.star, &mid));
    if let Some(rule) = mapped {
        mid = format!("{}{}", rule.to, &mid[rule.from.len()..]);
        mid = compact_path(&mid);
    }

    let (pid, mid_in_package) = match mid.split_once('/') {
        Some((head, rest)) if config.packs.contains_key(head) => {
            (head.to_string(), rest.to_string())
        }
        None if config.packs.contains_key(mid.as_str()) => {
            // bare package reference expands to its main
            let pack = &config.packs[mid.as_str()];
            let main = pack.main.clone();
            let pid = mid.clone();
            mid = format!("{mid}/{main}");
            (pid, main)
        }
        _ => (String::new(), mid.clone()),
    };

    let url = resolve_url(config, &mid, &pid, &mid_in_package);
    ModuleInfo { mid, pid, url }
}

fn resolve_url(config: &CompiledConfig, mid: &str, pid: &str, mid_in_package: &str) -> String {
    // paths overrides beat package locations
    let mut url = match run_program(&config.paths, mid) {
        Some(rule) => format!("{}{}", rule.to, &mid[rule.from.len()..]),
        None if !pid.is_empty() => {
            let pack = &config.packs[pid];
            format!("{}/{}", pack.location, mid_in_package)
        }
        None => mid.to_string(),
    };
    if !looks_absolute(&url) {
        url = format!("{}{}", config.base_url, url);
    }
    if !url.ends_with(".js") {
        url.push_str(".js");
    }
    compact_path(&url)
}

/// Resolve a module-id-shaped path to a url without the `.js` suffix, for
/// locating non-module resources alongside modules.
pub fn to_url(config: &CompiledConfig, id: &str, referrer: Option<&str>) -> String {
    // resolve a synthetic member so package mains do not interfere
    let info = module_info(config, &format!("{}/x", id.trim_end_matches('/')), referrer);
    info.url
        .strip_suffix("/x.js")
        .map(str::to_string)
        .unwrap_or(info.url)
}
