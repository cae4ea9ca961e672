// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader configuration and its compiled lookup programs.

use crate::error::{LoaderError, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// A package declaration: a name bound to a location, with an optional main
/// module and id remapping applied inside the package.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Package {
    /// Package name; the first segment of member module ids
    pub name: String,
    /// Directory the package's modules load from, relative to `base_url`
    /// unless absolute
    #[serde(default)]
    pub location: Option<String>,
    /// Module executed for a bare reference to the package name
    #[serde(default)]
    pub main: Option<String>,
}

/// Declarative loader configuration.
///
/// Successive calls to [`crate::loader::Loader::configure`] merge: packages
/// replace same-named packages, map scopes merge per prefix, and paths
/// merge per key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Prefix for every package location and path that is not absolute
    #[serde(default)]
    pub base_url: Option<String>,
    /// Package declarations
    #[serde(default)]
    pub packages: Vec<Package>,
    /// Module id remapping. The `"*"` scope applies everywhere; other
    /// scopes apply to references made from modules under that prefix.
    #[serde(default)]
    pub map: HashMap<String, HashMap<String, String>>,
    /// Module-id-to-path overrides consulted before package locations
    #[serde(default)]
    pub paths: HashMap<String, String>,
}

impl LoaderConfig {
    /// Parse a configuration from its json text.
    pub fn from_json(text: &str) -> Result<LoaderConfig> {
        let config: LoaderConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for package in &self.packages {
            if package.name.is_empty() {
                return Err(LoaderError::Config("package name must not be empty".into()));
            }
            if package.name.contains('!') {
                return Err(LoaderError::Config(format!(
                    "package name may not contain '!': {}",
                    package.name
                )));
            }
        }
        Ok(())
    }
}

/// One compiled prefix rule: match `from` (exactly or as a path prefix),
/// substitute `to`.
#[derive(Debug, Clone)]
pub struct PrefixRule {
    pub(crate) from: String,
    pub(crate) to: String,
}

/// Map rules that apply only to references made from modules under a
/// prefix.
#[derive(Debug, Clone)]
pub struct ScopeRule {
    pub(crate) scope: String,
    pub(crate) rules: Vec<PrefixRule>,
}

/// Compiled package record.
#[derive(Debug, Clone)]
pub struct CompiledPackage {
    pub(crate) name: String,
    pub(crate) location: String,
    pub(crate) main: String,
}

/// Configuration compiled into longest-prefix-first lookup programs.
#[derive(Debug, Clone, Default)]
pub struct CompiledConfig {
    pub(crate) base_url: String,
    pub(crate) packs: HashMap<String, CompiledPackage>,
    pub(crate) scopes: Vec<ScopeRule>,
    pub(crate) star: Vec<PrefixRule>,
    pub(crate) paths: Vec<PrefixRule>,
}

fn sort_rules(rules: &mut Vec<PrefixRule>) {
    // longest prefix first so the most specific rule wins
    rules.sort_by(|a, b| b.from.len().cmp(&a.from.len()).then(a.from.cmp(&b.from)));
}

fn compile_rules(map: &HashMap<String, String>) -> Vec<PrefixRule> {
    let mut rules: Vec<PrefixRule> = map
        .iter()
        .map(|(from, to)| PrefixRule {
            from: from.trim_end_matches('/').to_string(),
            to: to.clone(),
        })
        .collect();
    sort_rules(&mut rules);
    rules
}

impl CompiledConfig {
    /// Merge `config` into the compiled state.
    pub fn apply(&mut self, config: &LoaderConfig) {
        if let Some(base_url) = &config.base_url {
            let mut base = base_url.trim_end_matches('/').to_string();
            if !base.is_empty() {
                base.push('/');
            }
            self.base_url = base;
        }
        for package in &config.packages {
            let location = package
                .location
                .clone()
                .unwrap_or_else(|| package.name.clone());
            self.packs.insert(
                package.name.clone(),
                CompiledPackage {
                    name: package.name.clone(),
                    location: location.trim_end_matches('/').to_string(),
                    main: package.main.clone().unwrap_or_else(|| "main".to_string()),
                },
            );
        }
        for (scope, rules) in &config.map {
            let compiled = compile_rules(rules);
            if scope == "*" {
                merge_rules(&mut self.star, compiled);
            } else {
                let scope = scope.trim_end_matches('/').to_string();
                match self.scopes.iter_mut().find(|s| s.scope == scope) {
                    Some(existing) => merge_rules(&mut existing.rules, compiled),
                    None => self.scopes.push(ScopeRule {
                        scope,
                        rules: compiled,
                    }),
                }
            }
        }
        // scopes themselves also match longest-first
        self.scopes
            .sort_by(|a, b| b.scope.len().cmp(&a.scope.len()).then(a.scope.cmp(&b.scope)));
        if !config.paths.is_empty() {
            merge_rules(&mut self.paths, compile_rules(&config.paths));
        }
    }
}

fn merge_rules(target: &mut Vec<PrefixRule>, incoming: Vec<PrefixRule>) {
    for rule in incoming {
        match target.iter_mut().find(|r| r.from == rule.from) {
            Some(existing) => existing.to = rule.to,
            None => target.push(rule),
        }
    }
    sort_rules(target);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_rejects_unknown_fields() {
        let result = LoaderConfig::from_json(r#"{"bogus": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_package_main_defaults_to_main() {
        let config =
            LoaderConfig::from_json(r#"{"packages": [{"name": "app", "location": "src/app"}]}"#)
                .unwrap();
        let mut compiled = CompiledConfig::default();
        compiled.apply(&config);
        let pack = &compiled.packs["app"];
        assert_eq!(pack.main, "main");
        assert_eq!(pack.location, "src/app");
    }

    #[test]
    fn test_rules_sorted_longest_first() {
        let config = LoaderConfig::from_json(
            r#"{"map": {"*": {"a": "x", "a/b/c": "z", "a/b": "y"}}}"#,
        )
        .unwrap();
        let mut compiled = CompiledConfig::default();
        compiled.apply(&config);
        let froms: Vec<&str> = compiled.star.iter().map(|r| r.from.as_str()).collect();
        assert_eq!(froms, vec!["a/b/c", "a/b", "a"]);
    }

    #[test]
    fn test_successive_configs_merge() {
        let mut compiled = CompiledConfig::default();
        compiled.apply(&LoaderConfig::from_json(r#"{"map": {"*": {"a": "x"}}}"#).unwrap());
        compiled.apply(&LoaderConfig::from_json(r#"{"map": {"*": {"a": "y", "b": "z"}}}"#).unwrap());
        assert_eq!(compiled.star.len(), 2);
        let a = compiled.star.iter().find(|r| r.from == "a").unwrap();
        assert_eq!(a.to, "y");
    }

    #[test]
    fn test_invalid_package_name() {
        let result = LoaderConfig::from_json(r#"{"packages": [{"name": "p!q"}]}"#);
        assert!(result.is_err());
    }
}
