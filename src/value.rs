//! Dynamic task values and content-addressed identity.
//!
//! Task arguments, results and map-reduce items all travel as
//! [`serde_json::Value`]. Identity is a SHA-256 digest over a canonical
//! rendering of `(class name, arguments)`: object keys sorted, floats printed
//! with fixed precision, nested structures recursed. Structurally equal
//! arguments therefore always produce byte-equal unique keys.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::task::Task;

/// Number of digest bytes kept in the rendered key (128 bits).
const KEY_DIGEST_BYTES: usize = 16;

/// Render a value into its canonical byte form.
///
/// The rendering is stable across processes: map keys are emitted in sorted
/// order regardless of insertion order, and floats use a fixed scientific
/// notation so equal values always render identically.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                // Fixed precision keeps structurally equal floats byte-equal.
                let f = n.as_f64().unwrap_or(f64::NAN);
                out.push_str(&format!("{:.12e}", f));
            }
        }
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_escaped(text: &str, out: &mut String) {
    // JSON escaping keeps structural characters inside strings from
    // aliasing container syntax in the canonical form.
    match serde_json::to_string(text) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => {
            out.push('"');
            out.push_str(text);
            out.push('"');
        }
    }
}

/// Hex digest over the canonical form of `(name, args)`.
pub fn content_hash(name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"-");
    hasher.update(canonical_string(args).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..KEY_DIGEST_BYTES])
}

/// The rendered unique key: `"<ClassName>-<hex_hash>"`.
pub fn unique_key(name: &str, args: &Value) -> String {
    format!("{}-{}", name, content_hash(name, args))
}

/// Represent a task-valued argument by its unique key.
///
/// Use this when one task takes another task as a constructor argument, so
/// the parent's identity reflects the child's identity rather than an
/// unhashable object.
pub fn task_arg(task: &dyn Task) -> Value {
    Value::String(task.unique_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_sorts_object_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn canonical_recurses_into_nested_structures() {
        let v = json!({"outer": {"z": [1, 2, {"y": true}], "a": null}});
        assert_eq!(
            canonical_string(&v),
            r#"{"outer":{"a":null,"z":[1,2,{"y":true}]}}"#
        );
    }

    #[test]
    fn floats_render_with_fixed_precision() {
        let a = json!(0.1);
        let b = json!(0.1f64);
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert!(canonical_string(&a).contains('e'));
    }

    #[test]
    fn integers_do_not_collide_with_strings() {
        assert_ne!(canonical_string(&json!(1)), canonical_string(&json!("1")));
    }

    #[test]
    fn equal_args_equal_keys() {
        let a = json!({"x": 3, "name": "station"});
        let b = json!({"name": "station", "x": 3});
        assert_eq!(unique_key("Fetch", &a), unique_key("Fetch", &b));
    }

    #[test]
    fn different_name_different_key() {
        let args = json!({"x": 3});
        assert_ne!(unique_key("Fetch", &args), unique_key("Clean", &args));
    }

    #[test]
    fn key_shape() {
        let key = unique_key("Fetch", &json!(null));
        let (name, hash) = key.split_once('-').unwrap();
        assert_eq!(name, "Fetch");
        assert_eq!(hash.len(), KEY_DIGEST_BYTES * 2);
    }
}
