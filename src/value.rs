// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Dynamic value representation shared by the promise engine and the loader.
//!
//! Objects and arrays are reference types: clones share the same backing
//! storage, so two holders observe each other's mutations. The loader relies
//! on this for the circular-dependency exports placeholder.

use crate::loader::plugin::LoaderPlugin;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A native callable usable as a module factory, require function, or
/// promise handler payload.
///
/// Failure is signalled by returning `Err` with a reason value; the engine
/// never unwinds through user code.
#[derive(Clone)]
pub struct NativeFunction {
    f: Arc<Mutex<dyn FnMut(Vec<Value>) -> std::result::Result<Value, Value>>>,
}

impl NativeFunction {
    /// Wrap a closure as a callable value.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(Vec<Value>) -> std::result::Result<Value, Value> + 'static,
    {
        Self {
            f: Arc::new(Mutex::new(f)),
        }
    }

    /// Call the function with the given arguments.
    pub fn call(&self, args: Vec<Value>) -> std::result::Result<Value, Value> {
        let mut f = self.f.lock();
        (*f)(args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction {{ ... }}")
    }
}

/// A dynamic runtime value.
#[derive(Clone)]
pub enum Value {
    /// undefined
    Undefined,
    /// null
    Null,
    /// Boolean value
    Boolean(bool),
    /// Number (IEEE 754 double)
    Number(f64),
    /// String
    String(String),
    /// Object reference; clones share identity
    Object(Arc<RwLock<HashMap<String, Value>>>),
    /// Array reference; clones share identity
    Array(Arc<RwLock<Vec<Value>>>),
    /// Native callable
    Function(NativeFunction),
    /// Loader-plugin capability; a module exporting this is treated as a plugin
    Plugin(Arc<dyn LoaderPlugin>),
}

impl Value {
    /// Create an empty object value.
    pub fn object() -> Value {
        Value::Object(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Create an array value from a vector.
    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(values)))
    }

    /// Create a string value.
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    /// Create an error-shaped object with `name` and `message` keys.
    pub fn error(name: &str, message: impl Into<String>) -> Value {
        let obj = Value::object();
        obj.set("name", Value::string(name));
        obj.set("message", Value::string(message));
        obj
    }

    /// Returns true if this value is undefined.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Returns true if this value is a function.
    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Look up a property on an object value.
    ///
    /// Returns `Undefined` for missing keys and for non-object receivers.
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(map) => map.read().get(key).cloned().unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    /// Set a property on an object value. No-op on non-object receivers.
    pub fn set(&self, key: &str, value: Value) {
        if let Value::Object(map) = self {
            map.write().insert(key.to_string(), value);
        }
    }

    /// Borrow the string contents, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the numeric contents, if this is a number value.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the type of this value as a string.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Function(_) => "function",
            Value::Plugin(_) => "plugin",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                if a.is_nan() && b.is_nan() {
                    false
                } else {
                    a == b
                }
            }
            (Value::String(a), Value::String(b)) => a == b,
            // Reference types compare by identity
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.f, &b.f),
            (Value::Plugin(a), Value::Plugin(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Undefined
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Object(map) => write!(f, "Object {{ {} keys }}", map.read().len()),
            Value::Array(values) => write!(f, "Array [ {} items ]", values.read().len()),
            Value::Function(_) => write!(f, "Function"),
            Value::Plugin(_) => write!(f, "Plugin"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Object(_) => {
                // Error-shaped objects display as "name: message"
                let name = self.get("name");
                let message = self.get("message");
                match (name.as_str(), message.as_str()) {
                    (Some(n), Some(m)) => write!(f, "{}: {}", n, m),
                    _ => write!(f, "[object]"),
                }
            }
            Value::Array(values) => write!(f, "[array({})]", values.read().len()),
            Value::Function(_) => write!(f, "[function]"),
            Value::Plugin(_) => write!(f, "[plugin]"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
