// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the loader

use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Errors that can occur while resolving, loading, or executing modules
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A module id could not be mapped to a loadable resource
    #[error("Cannot resolve module id '{0}'")]
    Resolution(String),

    /// The source injector failed, or the fetched source never declared a factory
    #[error(
        "Failed to load module {mid} from {url} (parent: {}): {reason}",
        .parent.as_deref().unwrap_or("<root>")
    )]
    Load {
        /// Canonical id of the failing module
        mid: String,
        /// Source location the load was attempted from
        url: String,
        /// Id of the module that requested the failing one, if known
        parent: Option<String>,
        /// Reason reported by the injector or source thunk
        reason: String,
    },

    /// Synchronous require of a module whose factory has not executed yet
    #[error("Attempt to require unloaded module '{0}'")]
    NotLoaded(String),

    /// A module factory signalled failure while executing
    #[error("Factory for module '{mid}' failed: {message}")]
    Factory {
        /// Id of the module whose factory failed
        mid: String,
        /// Stringified failure value
        message: String,
    },

    /// Invalid loader configuration
    #[error("Invalid loader configuration: {0}")]
    Config(String),

    /// JSON configuration parse error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl LoaderError {
    /// Create a resolution error
    pub fn resolution(mid: impl Into<String>) -> Self {
        Self::Resolution(mid.into())
    }

    /// Create a load error
    pub fn load_failed(
        mid: impl Into<String>,
        url: impl Into<String>,
        parent: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Load {
            mid: mid.into(),
            url: url.into(),
            parent,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_names_module_url_and_parent() {
        let err = LoaderError::load_failed("a/b", "lib/a/b.js", Some("app/main".to_string()), "404");
        let msg = err.to_string();
        assert!(msg.contains("a/b"));
        assert!(msg.contains("lib/a/b.js"));
        assert!(msg.contains("app/main"));
    }

    #[test]
    fn test_load_error_without_parent() {
        let err = LoaderError::load_failed("a", "a.js", None, "gone");
        assert!(err.to_string().contains("<root>"));
    }
}
