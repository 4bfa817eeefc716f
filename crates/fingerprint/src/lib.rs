//! capibara_fingerprint
//!
//! Deterministic SHA-256 fingerprints over (prompt, language, context,
//! policy_name), used as the cache key for content-addressed script
//! storage. Context's `inputs` map is never hashed by value - only its
//! shape (count + sorted-unique value types) - so two requests that only
//! differ in concrete input values still share a cache entry.

use serde_json::{Map, Value};

pub type Fingerprint = String;

/// Compute the fingerprint for a generation request.
///
/// `context` may be `None`/`Null`, an empty object, or a full context
/// document as described by the engine's request schema.
pub fn fingerprint(
    prompt: &str,
    language: &str,
    context: Option<&Value>,
    policy_name: Option<&str>,
) -> Fingerprint {
    let normalized_context = match context {
        Some(v) => normalize_context(v),
        None => Value::Object(Map::new()),
    };

    let mut data = Map::new();
    data.insert("prompt".into(), Value::String(prompt.trim().to_string()));
    data.insert("language".into(), Value::String(language.to_lowercase()));
    data.insert("context".into(), normalized_context);
    data.insert(
        "policy_name".into(),
        policy_name.map(Value::from).unwrap_or(Value::Null),
    );

    capibara_common::hex_sha256_canonical_json(&data)
        .expect("fingerprint input is always representable as JSON")
}

/// Normalize a context document: recursively sort any string list, and
/// rewrite the `inputs` key (wherever it appears) to a `{count, types}`
/// shape instead of carrying raw input values forward.
fn normalize_context(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if k == "inputs" {
                    out.insert(k.clone(), inputs_signature(v));
                } else if let Value::Array(items) = v {
                    out.insert(k.clone(), normalize_string_list_or_recurse(items));
                } else {
                    out.insert(k.clone(), normalize_context(v));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn normalize_string_list_or_recurse(items: &[Value]) -> Value {
    let all_strings = items.iter().all(|v| v.is_string());
    if all_strings {
        let mut strs: Vec<String> = items
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        strs.sort();
        Value::Array(strs.into_iter().map(Value::String).collect())
    } else {
        Value::Array(items.iter().map(normalize_context).collect())
    }
}

/// Collapse an `inputs` value (an object of named inputs, or an array of
/// bare values) into a `{count, types}` signature. `types` is the
/// sorted-unique set of value-type labels.
fn inputs_signature(inputs: &Value) -> Value {
    let values: Vec<&Value> = match inputs {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    };

    let mut types: Vec<&'static str> = values.iter().map(|v| classify(v)).collect();
    types.sort_unstable();
    types.dedup();

    let mut out = Map::new();
    out.insert("count".into(), Value::from(values.len() as u64));
    out.insert(
        "types".into(),
        Value::Array(types.into_iter().map(|t| Value::String(t.into())).collect()),
    );
    Value::Object(out)
}

/// Classify a single input value the way the prompt decorator does:
/// a string that parses as a finite float counts as a number.
fn classify(v: &Value) -> &'static str {
    match v {
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::String(s) => {
            if s.parse::<f64>().map(|f| f.is_finite()).unwrap_or(false) {
                "number"
            } else {
                "string"
            }
        }
        _ => "string",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_independent_of_key_order() {
        let a = json!({"files": ["b.txt", "a.txt"], "env": "prod"});
        let b = json!({"env": "prod", "files": ["a.txt", "b.txt"]});
        assert_eq!(
            fingerprint("write a script", "python", Some(&a), Some("strict")),
            fingerprint("write a script", "python", Some(&b), Some("strict")),
        );
    }

    #[test]
    fn fingerprint_is_independent_of_input_values() {
        let a = json!({"inputs": {"x": 1, "y": "hello"}});
        let b = json!({"inputs": {"x": 999, "y": "goodbye"}});
        assert_eq!(
            fingerprint("p", "python", Some(&a), None),
            fingerprint("p", "python", Some(&b), None),
        );
    }

    #[test]
    fn fingerprint_changes_with_input_shape() {
        let a = json!({"inputs": {"x": 1}});
        let b = json!({"inputs": {"x": 1, "y": "s"}});
        assert_ne!(
            fingerprint("p", "python", Some(&a), None),
            fingerprint("p", "python", Some(&b), None),
        );
    }

    #[test]
    fn prompt_is_trimmed_and_language_lowercased() {
        let f1 = fingerprint("  do it  ", "Python", None, None);
        let f2 = fingerprint("do it", "python", None, None);
        assert_eq!(f1, f2);
    }

    #[test]
    fn numeric_string_input_classifies_as_number() {
        let a = json!({"inputs": {"x": "42"}});
        let b = json!({"inputs": {"x": 42}});
        assert_eq!(
            fingerprint("p", "python", Some(&a), None),
            fingerprint("p", "python", Some(&b), None),
        );
    }
}
