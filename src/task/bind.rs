//! Argument defaulting from configuration.
//!
//! When a task is constructed, every declared parameter the caller did not
//! supply is looked up by name in the task's configuration section, then in
//! the declaration's own default. This is the only place ambient
//! configuration turns into explicit arguments, and it runs exactly once
//! per descriptor construction.

use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::AqueductError;

/// A declared constructor parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// Bind supplied arguments against a declaration, defaulting absent ones
/// from the configuration section.
///
/// Binding order per parameter: supplied value, then `section[name]`, then
/// the declared default. A required parameter absent everywhere is an
/// [`AqueductError::ArgumentBinding`]; a supplied argument that matches no
/// declared parameter is rejected too.
pub fn bind_args(
    task_name: &str,
    declared: &[Param],
    supplied: Map<String, Value>,
    section: &Config,
) -> Result<Map<String, Value>, AqueductError> {
    for key in supplied.keys() {
        if !declared.iter().any(|p| p.name == *key) {
            return Err(AqueductError::other(format!(
                "task '{task_name}' has no parameter '{key}'"
            )));
        }
    }

    let mut bound = Map::new();
    for param in declared {
        let value = match supplied.get(&param.name) {
            Some(value) => value.clone(),
            None => match section.get(&param.name) {
                Some(value) => value.clone(),
                None => match &param.default {
                    Some(default) => default.clone(),
                    None => {
                        return Err(AqueductError::ArgumentBinding {
                            task: task_name.to_string(),
                            param: param.name.clone(),
                        })
                    }
                },
            },
        };
        bound.insert(param.name.clone(), value);
    }
    Ok(bound)
}
