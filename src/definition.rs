//! Challenge definition parsing and validation
//!
//! Challenge Definition Files (CDFs) describe a deployable challenge:
//! metadata plus a list of typed components. Challenge Type Definitions
//! (CTDs) live on disk, one file per type, and hold the template a component
//! of that type expands into. Both formats accept JSON or YAML; JSON is tried
//! first so the YAML fallback only fires for documents that are not valid
//! JSON.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use jsonschema::Validator;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ControlError, ControlResult, SchemaViolation};

/// Schema for Challenge Definition Files. Extra fields are allowed; only the
/// structural core is enforced.
static CDF_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["metadata", "components"],
        "properties": {
            "metadata": {
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": {"type": "string", "minLength": 1},
                    "description": {"type": "string"},
                    "author": {"type": "string"}
                }
            },
            "components": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "type": {"type": "string", "minLength": 1},
                        "name": {"type": "string"},
                        "variables": {"type": "object"}
                    }
                }
            }
        }
    })
});

/// Schema for Challenge Type Definitions.
static CTD_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["typeId", "template"],
        "properties": {
            "typeId": {"type": "string", "minLength": 1},
            "template": {"type": "object"}
        }
    })
});

static CDF_VALIDATOR: Lazy<Validator> =
    Lazy::new(|| jsonschema::options().build(&CDF_SCHEMA).unwrap());

static CTD_VALIDATOR: Lazy<Validator> =
    Lazy::new(|| jsonschema::options().build(&CTD_SCHEMA).unwrap());

/// Parse a definition document from text. JSON is attempted first, then
/// YAML; the error carries both failures when neither format matches.
pub fn parse_document(content: &str) -> ControlResult<Value> {
    match serde_json::from_str::<Value>(content) {
        Ok(doc) => Ok(doc),
        Err(json_err) => match serde_yaml::from_str::<Value>(content) {
            Ok(doc) => Ok(doc),
            Err(yaml_err) => Err(ControlError::Parse(format!(
                "document is not valid JSON ({json_err}) or YAML ({yaml_err})"
            ))),
        },
    }
}

/// Serialize a document back to canonical JSON text.
///
/// `parse_document(&serialize_document(doc)?)` returns a document equal to
/// the input.
pub fn serialize_document(doc: &Value) -> ControlResult<String> {
    Ok(serde_json::to_string_pretty(doc)?)
}

/// Validate a parsed document against the CDF schema, collecting every
/// violation rather than stopping at the first.
pub fn validate_cdf(doc: &Value) -> ControlResult<()> {
    run_validator(&CDF_VALIDATOR, doc)
}

/// Validate a parsed document against the CTD schema.
pub fn validate_typedef(doc: &Value) -> ControlResult<()> {
    run_validator(&CTD_VALIDATOR, doc)
}

fn run_validator(validator: &Validator, doc: &Value) -> ControlResult<()> {
    let violations: Vec<SchemaViolation> = validator
        .iter_errors(doc)
        .map(|err| SchemaViolation {
            path: dot_path(&err.instance_path.to_string()),
            constraint: err.to_string(),
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ControlError::SchemaValidation { violations })
    }
}

/// Convert a JSON Pointer (`/components/0/type`) into the dot notation used
/// in operator-facing messages (`components[0].type`).
fn dot_path(pointer: &str) -> String {
    let mut out = String::new();
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            out.push('[');
            out.push_str(&segment);
            out.push(']');
        } else {
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(&segment);
        }
    }
    out
}

/// A loaded Challenge Type Definition.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Type id declared inside the file (falls back to the requested id when
    /// the field is missing).
    pub type_id: String,
    /// Template fragment expanded for each component of this type.
    pub template: Value,
}

/// Read-through cache of Challenge Type Definitions backed by a directory of
/// one-file-per-type documents. Entries never expire; changing a CTD on disk
/// requires a restart.
pub struct TypeDefStore {
    dir: PathBuf,
    cache: DashMap<String, Arc<TypeDef>>,
}

const TYPEDEF_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

impl TypeDefStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// Load a type definition by id, serving from cache when possible.
    ///
    /// A CTD that fails schema validation is still served (with a warning):
    /// provisioning against a sloppy but readable template beats refusing to
    /// run. Unreadable or unparseable files return `None`.
    pub fn load(&self, type_id: &str) -> Option<Arc<TypeDef>> {
        if !safe_type_id(type_id) {
            warn!("Rejecting challenge type id with path separators: {type_id}");
            return None;
        }
        if let Some(cached) = self.cache.get(type_id) {
            return Some(cached.clone());
        }

        let path = self.existing_path(type_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                warn!("Failed to read type definition {}: {err}", path.display());
                return None;
            }
        };
        let doc = match parse_document(&content) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("Failed to parse type definition {}: {err}", path.display());
                return None;
            }
        };
        if let Err(err) = validate_typedef(&doc) {
            warn!("Type definition {} is non-conforming: {err}", path.display());
        }

        let declared = doc
            .get("typeId")
            .and_then(Value::as_str)
            .unwrap_or(type_id)
            .to_string();
        if declared != type_id {
            warn!(
                "Type definition {} declares typeId '{declared}' but was loaded as '{type_id}'",
                path.display()
            );
        }
        let template = doc.get("template").cloned().unwrap_or_else(|| json!({}));

        let typedef = Arc::new(TypeDef {
            type_id: declared,
            template,
        });
        self.cache.insert(type_id.to_string(), typedef.clone());
        debug!("Cached type definition '{type_id}' from {}", path.display());
        Some(typedef)
    }

    /// Whether a definition file exists on disk for this id, cached or not.
    pub fn exists_on_disk(&self, type_id: &str) -> bool {
        safe_type_id(type_id) && self.existing_path(type_id).is_some()
    }

    /// All type ids that have a definition file in the directory.
    pub fn known_type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(
                    "Cannot list type definition directory {}: {err}",
                    self.dir.display()
                );
                return ids;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_typedef = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| TYPEDEF_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if !is_typedef {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    fn existing_path(&self, type_id: &str) -> Option<PathBuf> {
        TYPEDEF_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{type_id}.{ext}")))
            .find(|path| path.is_file())
    }
}

/// Type ids become file names; anything that could escape the directory is
/// rejected outright.
fn safe_type_id(type_id: &str) -> bool {
    !type_id.is_empty()
        && !type_id.contains('/')
        && !type_id.contains('\\')
        && !type_id.contains("..")
}
