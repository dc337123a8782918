//! Variable substitution over challenge definition documents
//!
//! Templates use `{{NAME}}` placeholders. Substitution walks the document
//! tree, recursing into objects and arrays and rewriting string leaves; every
//! other leaf passes through untouched. A missing variable never fails the
//! operation: the placeholder is left verbatim and a warning is logged, so a
//! half-filled template is visible in the output rather than aborting
//! provisioning.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

/// Flat map of placeholder name to substitution value. Supplied per
/// provisioning call, never persisted.
pub type VariablesMap = HashMap<String, Value>;

/// Matches a single `{{name}}` placeholder. Dots are allowed inside the name
/// so explicit combined keys (`{{pod.name}}`) resolve as one unit.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_][A-Za-z0-9_.-]*)\}\}").unwrap());

/// Matches the composite form `{{a}}.{{b}}`, two placeholders joined by a
/// literal dot. Resolved before the generic scan so an explicit `a.b` entry
/// in the variable map can take precedence over joining the halves.
static COMPOSITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{([A-Za-z0-9_][A-Za-z0-9_-]*)\}\}\.\{\{([A-Za-z0-9_][A-Za-z0-9_-]*)\}\}")
        .unwrap()
});

/// Substitute `{{NAME}}` placeholders throughout a document.
///
/// Returns a new document; the input is never mutated. Applying the result to
/// a second pass with the same variables is a no-op once no placeholders
/// remain unresolved.
pub fn substitute_variables(doc: &Value, vars: &VariablesMap) -> Value {
    match doc {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_variables(v, vars)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_variables(v, vars)).collect())
        }
        Value::String(s) => Value::String(substitute_string(s, vars)),
        other => other.clone(),
    }
}

/// Substitute placeholders in a single string leaf.
fn substitute_string(input: &str, vars: &VariablesMap) -> String {
    // Composite pre-pass: `{{a}}.{{b}}` prefers an explicit `a.b` entry.
    let after_composite = COMPOSITE.replace_all(input, |caps: &regex::Captures<'_>| {
        let left = &caps[1];
        let right = &caps[2];
        let combined = format!("{left}.{right}");
        if let Some(value) = vars.get(&combined) {
            return coerce_text(value);
        }
        match (vars.get(left), vars.get(right)) {
            (Some(l), Some(r)) => format!("{}.{}", coerce_text(l), coerce_text(r)),
            // Leave for the generic scan; whichever half resolves will be
            // replaced there and the rest stays verbatim.
            _ => caps[0].to_string(),
        }
    });

    // Whole-string placeholder: replace the entire string with the variable's
    // value coerced to text.
    if let Some(caps) = PLACEHOLDER.captures(&after_composite) {
        if caps.get(0).map(|m| m.as_str()) == Some(after_composite.as_ref()) {
            let name = &caps[1];
            match vars.get(name) {
                Some(value) => return coerce_text(value),
                None => {
                    warn!("Unresolved template placeholder: {}", name);
                    return after_composite.into_owned();
                }
            }
        }
    }

    // In-place scan: every remaining occurrence is replaced individually.
    let mut unresolved: Vec<String> = Vec::new();
    let result = PLACEHOLDER.replace_all(&after_composite, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => coerce_text(value),
            None => {
                unresolved.push(name.to_string());
                caps[0].to_string()
            }
        }
    });

    for name in unresolved {
        warn!("Unresolved template placeholder: {}", name);
    }

    result.into_owned()
}

/// Coerce a variable value to its textual form for insertion into a string.
fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        // Compound values rarely appear as substitutions; serialize compactly
        // so the output is still a valid string leaf.
        other => other.to_string(),
    }
}
