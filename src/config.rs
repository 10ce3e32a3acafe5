//! Hierarchical configuration.
//!
//! A [`Config`] is a string-keyed tree of values supporting:
//!
//! - deep lookup by dotted path (`section.subsection.key`),
//! - structural merge of several sources in priority order,
//! - `${other.key}` and `${env:VAR}` interpolation inside string values.
//!
//! Loading files is the embedding application's business; this module only
//! consumes already-parsed YAML/JSON or `key=value` dot-lists.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::AqueductError;

static INTERPOLATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.:\-]+)\}").expect("interpolation pattern"));

/// Interpolation recursion bound; a reference chain deeper than this is
/// treated as unresolvable.
const MAX_INTERPOLATION_DEPTH: usize = 32;

/// A hierarchical string-keyed configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config(Value);

impl Config {
    /// Empty configuration.
    pub fn new() -> Self {
        Config(Value::Object(Map::new()))
    }

    /// Wrap an already-parsed value. The root must be a mapping.
    pub fn from_value(value: Value) -> Result<Self, AqueductError> {
        match value {
            Value::Object(_) => Ok(Config(value)),
            Value::Null => Ok(Config::new()),
            other => Err(AqueductError::other(format!(
                "root configuration must be a mapping, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Parse a YAML document into a configuration tree.
    pub fn from_yaml(text: &str) -> Result<Self, AqueductError> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| AqueductError::other(format!("invalid configuration YAML: {e}")))?;
        Config::from_value(value)
    }

    /// Parse a `key=value` dot-list (CLI overrides) into a configuration
    /// tree. Values are parsed as YAML scalars so `n=3` binds a number and
    /// `flag=true` a boolean.
    pub fn from_dotlist(entries: &[String]) -> Result<Self, AqueductError> {
        let mut cfg = Config::new();
        for entry in entries {
            let (path, raw) = entry.split_once('=').ok_or_else(|| {
                AqueductError::other(format!("override '{entry}' is not of the form key=value"))
            })?;
            let value: Value = serde_yaml::from_str(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string()));
            cfg.set(path, value);
        }
        Ok(cfg)
    }

    /// Same as [`Config::from_dotlist`], with every path nested under
    /// `section`.
    pub fn from_dotlist_in_section(
        entries: &[String],
        section: &str,
    ) -> Result<Self, AqueductError> {
        let inner = Config::from_dotlist(entries)?;
        let mut cfg = Config::new();
        cfg.set_value(section, inner.0);
        Ok(cfg)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.0, Value::Object(m) if m.is_empty())
    }

    /// Deep lookup by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut cursor = &self.0;
        for part in path.split('.') {
            cursor = cursor.as_object()?.get(part)?;
        }
        Some(cursor)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// The sub-configuration rooted at `path`. Missing or non-mapping nodes
    /// yield an empty configuration.
    pub fn section(&self, path: &str) -> Config {
        match self.get(path) {
            Some(Value::Object(map)) => Config(Value::Object(map.clone())),
            _ => Config::new(),
        }
    }

    /// Set a value at a dotted path, creating intermediate mappings.
    pub fn set(&mut self, path: &str, value: Value) {
        self.set_value(path, value);
    }

    fn set_value(&mut self, path: &str, value: Value) {
        let mut cursor = &mut self.0;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let map = match cursor {
                Value::Object(map) => map,
                other => {
                    *other = Value::Object(Map::new());
                    other.as_object_mut().expect("just replaced with object")
                }
            };
            if parts.peek().is_none() {
                map.insert(part.to_string(), value);
                return;
            }
            cursor = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }

    /// Structurally merge `overlay` on top of `self`. Mappings merge key by
    /// key; any other value in the overlay replaces the base value.
    pub fn merge(&self, overlay: &Config) -> Config {
        Config(merge_values(&self.0, &overlay.0))
    }

    /// Merge several sources in priority order (later overrides earlier).
    pub fn merge_all(sources: impl IntoIterator<Item = Config>) -> Config {
        sources
            .into_iter()
            .fold(Config::new(), |acc, src| acc.merge(&src))
    }

    /// Resolve `${path}` and `${env:VAR}` references inside string values.
    ///
    /// References point at other keys of this configuration by dotted path.
    /// A missing reference is a [`AqueductError::ConfigResolution`] error.
    pub fn resolve(&self) -> Result<Config, AqueductError> {
        let resolved = resolve_value(&self.0, self, 0)?;
        Ok(Config(resolved))
    }

    /// Render as YAML for display.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.0).unwrap_or_else(|_| "{}\n".to_string())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, value) in b {
                let entry = match merged.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        (_, overriding) => overriding.clone(),
    }
}

fn resolve_value(value: &Value, root: &Config, depth: usize) -> Result<Value, AqueductError> {
    match value {
        Value::String(s) => resolve_string(s, root, depth),
        Value::Array(items) => {
            let resolved: Result<Vec<_>, _> = items
                .iter()
                .map(|item| resolve_value(item, root, depth))
                .collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, root, depth)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(text: &str, root: &Config, depth: usize) -> Result<Value, AqueductError> {
    if depth > MAX_INTERPOLATION_DEPTH {
        return Err(AqueductError::ConfigResolution(text.to_string()));
    }

    // A string that is exactly one reference resolves to the referenced
    // value, preserving its type.
    if let Some(caps) = INTERPOLATION.captures(text) {
        let whole = caps.get(0).expect("capture 0");
        if whole.start() == 0 && whole.end() == text.len() {
            let target = lookup_reference(&caps[1], root, text)?;
            return resolve_value(&target, root, depth + 1);
        }
    }

    // Otherwise substitute each reference as a string fragment.
    let mut out = String::new();
    let mut last = 0;
    for caps in INTERPOLATION.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0");
        out.push_str(&text[last..whole.start()]);
        let target = lookup_reference(&caps[1], root, text)?;
        let resolved = resolve_value(&target, root, depth + 1)?;
        match resolved {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

fn lookup_reference(
    reference: &str,
    root: &Config,
    context: &str,
) -> Result<Value, AqueductError> {
    if let Some(var) = reference.strip_prefix("env:") {
        return std::env::var(var)
            .map(Value::String)
            .map_err(|_| AqueductError::ConfigResolution(format!("env:{var}")));
    }
    root.get(reference)
        .cloned()
        .ok_or_else(|| AqueductError::ConfigResolution(format!("{reference} (in '{context}')")))
}
