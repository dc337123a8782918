//! Challenge resolution
//!
//! Turns a Challenge Definition File plus per-request variables into the
//! concrete infrastructure objects a deployment submits to the orchestrator.
//! Each component picks a Challenge Type Definition template, overlays its
//! own fields, and gets one substitution pass. Failures abort only the
//! request at hand; the type definition cache is never touched by a bad
//! document.

use serde_json::Value;
use tracing::warn;

use crate::challenge_type::validate_challenge_type;
use crate::definition::{parse_document, validate_cdf, TypeDefStore};
use crate::error::ControlResult;
use crate::template::{substitute_variables, VariablesMap};

/// Output of resolving one CDF: the challenge name and its infrastructure
/// objects in component order.
#[derive(Debug, Clone)]
pub struct ResolvedChallenge {
    pub name: String,
    pub objects: Vec<Value>,
}

/// Resolve CDF text into infrastructure objects.
///
/// Parse and schema failures, and unknown component types, fail the whole
/// request; nothing partial is returned.
pub fn resolve_challenge(
    content: &str,
    vars: &VariablesMap,
    typedefs: &TypeDefStore,
) -> ControlResult<ResolvedChallenge> {
    let doc = parse_document(content)?;
    validate_cdf(&doc)?;

    let name = doc["metadata"]["name"].as_str().unwrap_or_default().to_string();

    let mut objects = Vec::new();
    if let Some(components) = doc["components"].as_array() {
        for component in components {
            objects.push(resolve_component(component, vars, typedefs)?);
        }
    }

    Ok(ResolvedChallenge { name, objects })
}

/// Resolve a single CDF component against its type's template.
fn resolve_component(
    component: &Value,
    vars: &VariablesMap,
    typedefs: &TypeDefStore,
) -> ControlResult<Value> {
    let type_name = component.get("type").and_then(Value::as_str).unwrap_or_default();
    let canonical = validate_challenge_type(type_name, typedefs)?;

    // Caller-supplied variables shadow the component's own entries.
    let mut merged = vars.clone();
    if let Some(own) = component.get("variables").and_then(Value::as_object) {
        for (key, value) in own {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    let object = match typedefs.load(&canonical) {
        Some(typedef) => deep_merge(typedef.template.clone(), component_fragment(component)),
        None => {
            warn!("No template on disk for type '{canonical}', using component fragment as-is");
            component_fragment(component)
        }
    };

    Ok(substitute_variables(&object, &merged))
}

/// The component minus its resolution-only keys.
fn component_fragment(component: &Value) -> Value {
    let mut fragment = component.clone();
    if let Value::Object(obj) = &mut fragment {
        obj.remove("type");
        obj.remove("variables");
    }
    fragment
}

/// Overlay wins on scalars and arrays; objects merge recursively.
fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use serde_json::json;
    use tempfile::TempDir;

    fn typedef_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("web.json"),
            serde_json::to_string(&json!({
                "typeId": "web",
                "template": {
                    "kind": "Deployment",
                    "metadata": {"name": "{{INSTANCE_NAME}}", "labels": {"tier": "web"}},
                    "spec": {
                        "image": "{{IMAGE}}",
                        "env": [{"name": "FLAG", "value": "{{FLAG}}"}]
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("container.yaml"),
            "typeId: container\ntemplate:\n  kind: Pod\n  spec:\n    image: '{{IMAGE}}'\n",
        )
        .unwrap();
        dir
    }

    fn vars(pairs: &[(&str, Value)]) -> VariablesMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_resolve_full_challenge() {
        let dir = typedef_dir();
        let typedefs = TypeDefStore::new(dir.path());
        let cdf = r#"{
            "metadata": {"name": "web-basics"},
            "components": [
                {"type": "web", "variables": {"IMAGE": "registry.local/web:1"}},
                {"type": "container", "variables": {"IMAGE": "registry.local/db:2"}}
            ]
        }"#;
        let v = vars(&[
            ("INSTANCE_NAME", json!("ctfchal-web-basics-abc12345")),
            ("FLAG", json!("flag{resolved}")),
        ]);

        let resolved = resolve_challenge(cdf, &v, &typedefs).unwrap();
        assert_eq!(resolved.name, "web-basics");
        assert_eq!(resolved.objects.len(), 2);

        let web = &resolved.objects[0];
        assert_eq!(web["kind"], "Deployment");
        assert_eq!(web["metadata"]["name"], "ctfchal-web-basics-abc12345");
        assert_eq!(web["spec"]["image"], "registry.local/web:1");
        assert_eq!(web["spec"]["env"][0]["value"], "flag{resolved}");

        let db = &resolved.objects[1];
        assert_eq!(db["kind"], "Pod");
        assert_eq!(db["spec"]["image"], "registry.local/db:2");
    }

    #[test]
    fn test_component_fields_overlay_template() {
        let dir = typedef_dir();
        let typedefs = TypeDefStore::new(dir.path());
        let cdf = r#"{
            "metadata": {"name": "custom"},
            "components": [
                {
                    "type": "web",
                    "variables": {"IMAGE": "x", "INSTANCE_NAME": "n", "FLAG": "f"},
                    "metadata": {"labels": {"tier": "frontend", "team": "blue"}},
                    "spec": {"replicas": 2}
                }
            ]
        }"#;
        let resolved = resolve_challenge(cdf, &VariablesMap::new(), &typedefs).unwrap();
        let object = &resolved.objects[0];
        // Overlay replaced one label, added another, kept template siblings.
        assert_eq!(object["metadata"]["labels"]["tier"], "frontend");
        assert_eq!(object["metadata"]["labels"]["team"], "blue");
        assert_eq!(object["metadata"]["name"], "n");
        assert_eq!(object["spec"]["replicas"], 2);
        assert_eq!(object["spec"]["image"], "x");
    }

    #[test]
    fn test_caller_vars_shadow_component_vars() {
        let dir = typedef_dir();
        let typedefs = TypeDefStore::new(dir.path());
        let cdf = r#"{
            "metadata": {"name": "shadow"},
            "components": [{"type": "container", "variables": {"IMAGE": "component-image"}}]
        }"#;
        let v = vars(&[("IMAGE", json!("caller-image"))]);
        let resolved = resolve_challenge(cdf, &v, &typedefs).unwrap();
        assert_eq!(resolved.objects[0]["spec"]["image"], "caller-image");
    }

    #[test]
    fn test_unknown_type_fails_request_and_spares_cache() {
        let dir = typedef_dir();
        let typedefs = TypeDefStore::new(dir.path());
        let bad = r#"{
            "metadata": {"name": "broken"},
            "components": [{"type": "no-such-type"}]
        }"#;
        let err = resolve_challenge(bad, &VariablesMap::new(), &typedefs).unwrap_err();
        assert!(matches!(err, ControlError::UnknownChallengeType { .. }));

        // The store still serves good requests afterwards.
        let good = r#"{
            "metadata": {"name": "ok"},
            "components": [{"type": "container", "variables": {"IMAGE": "i"}}]
        }"#;
        assert!(resolve_challenge(good, &VariablesMap::new(), &typedefs).is_ok());
    }

    #[test]
    fn test_invalid_cdf_fails_schema_validation() {
        let dir = typedef_dir();
        let typedefs = TypeDefStore::new(dir.path());
        let err =
            resolve_challenge(r#"{"metadata": {}}"#, &VariablesMap::new(), &typedefs).unwrap_err();
        assert!(matches!(err, ControlError::SchemaValidation { .. }));
    }

    #[test]
    fn test_canonical_type_without_template_uses_fragment() {
        let dir = TempDir::new().unwrap();
        let typedefs = TypeDefStore::new(dir.path());
        let cdf = r#"{
            "metadata": {"name": "bare"},
            "components": [
                {"type": "web", "kind": "Deployment", "spec": {"image": "{{IMAGE}}"}}
            ]
        }"#;
        let v = vars(&[("IMAGE", json!("inline-image"))]);
        let resolved = resolve_challenge(cdf, &v, &typedefs).unwrap();
        let object = &resolved.objects[0];
        assert_eq!(object["kind"], "Deployment");
        assert_eq!(object["spec"]["image"], "inline-image");
        assert!(object.get("type").is_none());
        assert!(object.get("variables").is_none());
    }

    #[test]
    fn test_yaml_cdf_accepted() {
        let dir = typedef_dir();
        let typedefs = TypeDefStore::new(dir.path());
        let cdf = "metadata:\n  name: yaml-chal\ncomponents:\n  - type: container\n    variables:\n      IMAGE: img\n";
        let resolved = resolve_challenge(cdf, &VariablesMap::new(), &typedefs).unwrap();
        assert_eq!(resolved.name, "yaml-chal");
        assert_eq!(resolved.objects[0]["spec"]["image"], "img");
    }

    #[test]
    fn test_deep_merge_semantics() {
        let base = json!({"a": {"x": 1, "y": 2}, "keep": true, "list": [1, 2]});
        let overlay = json!({"a": {"y": 99, "z": 3}, "list": [9]});
        let merged = deep_merge(base, overlay);
        assert_eq!(
            merged,
            json!({"a": {"x": 1, "y": 99, "z": 3}, "keep": true, "list": [9]})
        );
    }
}
