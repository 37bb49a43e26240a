//! Operation keys and document inspection.
//!
//! Every cache and dedup lookup is addressed by an [`OperationKey`]: the
//! whitespace-normalized operation text followed by the variables serialized
//! with object keys sorted, so two calls with the same text and deep-equal
//! variables always collide regardless of key insertion order.

use serde_json::Value;
use std::fmt;

/// Separator between the operation text and the serialized variables.
const KEY_SEPARATOR: char = '|';

/// Deterministic identifier for a (operation text, variables) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKey(String);

impl OperationKey {
    /// Derive the key for an operation and its variables.
    pub fn new(operation: &str, variables: Option<&Value>) -> Self {
        let mut key = normalize(operation);
        key.push(KEY_SEPARATOR);
        match variables {
            Some(vars) if !vars.is_null() => write_canonical(vars, &mut key),
            _ => key.push_str("{}"),
        }
        Self(key)
    }

    /// Borrow the key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OperationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Collapse every whitespace run into a single space and trim both ends.
pub fn normalize(operation: &str) -> String {
    operation.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Heuristic document-kind check: the normalized text begins with the
/// `mutation` keyword.
///
/// Kept behind one predicate so it can be swapped for real document
/// inspection without touching callers.
pub fn is_mutation(operation: &str) -> bool {
    let trimmed = operation.trim_start();
    match trimmed.strip_prefix("mutation") {
        Some(rest) => rest
            .chars()
            .next()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_')),
        None => false,
    }
}

/// Append the canonical JSON encoding of `value` (object keys sorted) to `out`.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
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
        scalar => out.push_str(&scalar.to_string()),
    }
}
