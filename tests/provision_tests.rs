//! Integration tests for challenge resolution
//!
//! End-to-end: challenge definitions on disk through type normalization,
//! template merge, and variable substitution.

use std::collections::HashMap;

use serde_json::{json, Value};
use tempfile::TempDir;

use chal_control::definition::TypeDefStore;
use chal_control::error::ControlError;
use chal_control::orchestrator::instance_name;
use chal_control::provision::resolve_challenge;
use chal_control::template::VariablesMap;

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Type definition directory with one JSON and one YAML template.
fn typedef_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("web.json"),
        serde_json::to_string_pretty(&json!({
            "typeId": "web",
            "template": {
                "kind": "Deployment",
                "metadata": {
                    "name": "{{INSTANCE_NAME}}",
                    "labels": {"challenge": "{{CHALLENGE_ID}}", "tier": "web"}
                },
                "spec": {
                    "image": "{{IMAGE}}",
                    "env": [
                        {"name": "FLAG", "value": "{{FLAG}}"},
                        {"name": "BASE_DOMAIN", "value": "{{CHALLENGE_ID}}.{{DOMAIN}}"}
                    ]
                }
            }
        }))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("sql-injection.yaml"),
        concat!(
            "typeId: sql-injection\n",
            "template:\n",
            "  kind: Pod\n",
            "  metadata:\n",
            "    name: '{{INSTANCE_NAME}}'\n",
            "  spec:\n",
            "    image: '{{IMAGE}}'\n",
        ),
    )
    .unwrap();
    dir
}

fn base_vars(challenge_id: &str) -> VariablesMap {
    let mut vars: VariablesMap = HashMap::new();
    vars.insert(
        "INSTANCE_NAME".to_string(),
        Value::String(instance_name(challenge_id)),
    );
    vars.insert(
        "CHALLENGE_ID".to_string(),
        Value::String(challenge_id.to_string()),
    );
    vars.insert("DOMAIN".to_string(), json!("chal.example.org"));
    vars.insert("FLAG".to_string(), json!("flag{integration}"));
    vars
}

// ============================================================================
// RESOLUTION TESTS
// ============================================================================

#[test]
fn test_yaml_definition_resolves_against_templates() {
    let dir = typedef_dir();
    let typedefs = TypeDefStore::new(dir.path());
    let cdf = concat!(
        "metadata:\n",
        "  name: web-basics\n",
        "components:\n",
        "  - type: web\n",
        "    variables:\n",
        "      IMAGE: registry.local/web:1\n",
        "  - type: sqli\n",
        "    variables:\n",
        "      IMAGE: registry.local/db:2\n",
    );
    let vars = base_vars("web-basics");

    let resolved = resolve_challenge(cdf, &vars, &typedefs).unwrap();
    assert_eq!(resolved.name, "web-basics");
    assert_eq!(resolved.objects.len(), 2);

    let web = &resolved.objects[0];
    assert_eq!(web["kind"], "Deployment");
    assert_eq!(web["metadata"]["labels"]["challenge"], "web-basics");
    assert_eq!(web["spec"]["image"], "registry.local/web:1");
    assert_eq!(web["spec"]["env"][0]["value"], "flag{integration}");
    assert_eq!(
        web["spec"]["env"][1]["value"],
        "web-basics.chal.example.org"
    );
    let name = web["metadata"]["name"].as_str().unwrap();
    assert!(name.starts_with("ctfchal-web-basics-"));

    // The legacy "sqli" alias landed on the sql-injection template.
    let db = &resolved.objects[1];
    assert_eq!(db["kind"], "Pod");
    assert_eq!(db["spec"]["image"], "registry.local/db:2");
}

#[test]
fn test_component_overlay_beats_template_fields() {
    let dir = typedef_dir();
    let typedefs = TypeDefStore::new(dir.path());
    let cdf = json!({
        "metadata": {"name": "custom-web"},
        "components": [{
            "type": "WEB",
            "variables": {"IMAGE": "registry.local/web:9"},
            "metadata": {"labels": {"tier": "frontend"}},
            "spec": {"replicas": 3}
        }]
    })
    .to_string();

    let resolved = resolve_challenge(&cdf, &base_vars("custom-web"), &typedefs).unwrap();
    let object = &resolved.objects[0];
    assert_eq!(object["metadata"]["labels"]["tier"], "frontend");
    assert_eq!(object["metadata"]["labels"]["challenge"], "custom-web");
    assert_eq!(object["spec"]["replicas"], 3);
    assert_eq!(object["spec"]["image"], "registry.local/web:9");
    assert!(object.get("type").is_none());
    assert!(object.get("variables").is_none());
}

#[test]
fn test_schema_failure_reports_every_violation() {
    let dir = typedef_dir();
    let typedefs = TypeDefStore::new(dir.path());
    let cdf = json!({
        "metadata": {},
        "components": [{"image": "x"}, {"image": "y"}]
    })
    .to_string();

    let err = resolve_challenge(&cdf, &VariablesMap::new(), &typedefs).unwrap_err();
    let violations = err.violations();
    let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
    assert!(paths.contains(&"metadata"), "got: {paths:?}");
    assert!(paths.contains(&"components[0]"), "got: {paths:?}");
    assert!(paths.contains(&"components[1]"), "got: {paths:?}");
}

#[test]
fn test_unknown_type_error_carries_suggestions() {
    let dir = typedef_dir();
    let typedefs = TypeDefStore::new(dir.path());
    let cdf = json!({
        "metadata": {"name": "typo"},
        "components": [{"type": "contaner"}]
    })
    .to_string();

    let err = resolve_challenge(&cdf, &VariablesMap::new(), &typedefs).unwrap_err();
    assert!(matches!(err, ControlError::UnknownChallengeType { .. }));
    let text = err.to_string();
    assert!(text.contains("'contaner'"), "got: {text}");
    assert!(text.contains("container"), "got: {text}");
}

#[test]
fn test_unresolved_placeholders_survive_verbatim() {
    let dir = typedef_dir();
    let typedefs = TypeDefStore::new(dir.path());
    let cdf = json!({
        "metadata": {"name": "partial"},
        "components": [{"type": "web", "variables": {"IMAGE": "img"}}]
    })
    .to_string();

    // Only IMAGE is supplied; the template's other placeholders stay intact
    // for a later substitution pass.
    let resolved = resolve_challenge(&cdf, &VariablesMap::new(), &typedefs).unwrap();
    let object = &resolved.objects[0];
    assert_eq!(object["spec"]["image"], "img");
    assert_eq!(object["metadata"]["name"], "{{INSTANCE_NAME}}");
    assert_eq!(object["spec"]["env"][0]["value"], "{{FLAG}}");
}
