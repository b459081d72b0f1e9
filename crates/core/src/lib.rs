//! Muster core types: the compose document, typed resource records, the
//! per-run resolution cache, and scope derivation.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod prelude {
    pub use super::{ComposeDoc, FieldValue, ResolutionCache, ResourceRecord, ScopeContext};
}

/// One field of a resource record, classified once at decode time against the
/// kind's declared schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldValue {
    /// Plain value, passed through to the directory untouched.
    Scalar(Json),
    /// Name of another resource; rewritten to its identifier before submission.
    Reference { target: String, value: String },
    /// Names of other resources; each element rewritten to an identifier.
    ReferenceList { target: String, values: Vec<String> },
}

impl FieldValue {
    /// The kind this field points at, if it is reference-typed.
    pub fn target(&self) -> Option<&str> {
        match self {
            FieldValue::Scalar(_) => None,
            FieldValue::Reference { target, .. } | FieldValue::ReferenceList { target, .. } => {
                Some(target)
            }
        }
    }
}

/// One named instance of one kind, decoded from the compose document.
///
/// Mutated exactly once between decode and submission: reference fields are
/// rewritten from names to identifiers, and the document key is injected as
/// the `name` field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceRecord {
    pub kind: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ResourceRecord {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), fields: BTreeMap::new() }
    }

    /// String view of a field: a scalar string or a reference value.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        match self.fields.get(field)? {
            FieldValue::Scalar(Json::String(s)) => Some(s),
            FieldValue::Reference { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn set_scalar(&mut self, field: &str, value: impl Into<Json>) {
        self.fields.insert(field.to_string(), FieldValue::Scalar(value.into()));
    }

    /// Overwrite a reference field's value in place, keeping its target kind.
    /// Inserts a scalar when the field was not declared as a reference.
    pub fn set_reference_value(&mut self, field: &str, id: String) {
        match self.fields.get_mut(field) {
            Some(FieldValue::Reference { value, .. }) => *value = id,
            _ => self.set_scalar(field, id),
        }
    }

    /// Reference-typed fields as `(field name, target kind)` pairs, in field
    /// order.
    pub fn reference_fields(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .filter_map(|(k, v)| v.target().map(|t| (k.clone(), t.to_string())))
            .collect()
    }

    /// The submission body: references render as plain identifier strings.
    pub fn to_body(&self) -> Json {
        let mut body = serde_json::Map::new();
        for (k, v) in &self.fields {
            let rendered = match v {
                FieldValue::Scalar(j) => j.clone(),
                FieldValue::Reference { value, .. } => Json::String(value.clone()),
                FieldValue::ReferenceList { values, .. } => {
                    Json::Array(values.iter().cloned().map(Json::String).collect())
                }
            };
            body.insert(k.clone(), rendered);
        }
        Json::Object(body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("parsing compose document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("decoding compose document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compose document root must be a mapping")]
    NotAMapping,
    #[error("entry {name:?} under {collection:?} must be a mapping of fields")]
    Record { collection: String, name: String },
    #[error("field {field:?} of kind {kind:?} references another resource and must hold a name")]
    ReferenceValue { kind: String, field: String },
}

/// The parsed compose document: named collections keyed by pluralized kind
/// name, each mapping instance name to a raw field record.
#[derive(Debug, Clone, Default)]
pub struct ComposeDoc {
    collections: BTreeMap<String, BTreeMap<String, Json>>,
}

impl ComposeDoc {
    /// Parse a YAML compose document. The top-level `version` field is
    /// recognized and discarded; top-level values that are not mappings are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, DocError> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        let json = serde_json::to_value(value)?;
        let Json::Object(root) = json else { return Err(DocError::NotAMapping) };
        let mut collections = BTreeMap::new();
        for (key, value) in root {
            if key == "version" {
                continue;
            }
            let Json::Object(entries) = value else { continue };
            let mut records = BTreeMap::new();
            for (name, record) in entries {
                if !record.is_object() {
                    return Err(DocError::Record { collection: key, name });
                }
                records.insert(name, record);
            }
            collections.insert(key, records);
        }
        Ok(Self { collections })
    }

    pub fn collection(&self, key: &str) -> Option<&BTreeMap<String, Json>> {
        self.collections.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// Name-to-identifier mappings per kind, built lazily over one run and never
/// refreshed within it.
#[derive(Debug, Clone, Default)]
pub struct ResolutionCache {
    kinds: HashMap<String, HashMap<String, String>>,
}

impl ResolutionCache {
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Mark a kind as populated, even when it has no instances.
    pub fn insert_kind(&mut self, kind: &str) {
        self.kinds.entry(kind.to_string()).or_default();
    }

    pub fn insert(&mut self, kind: &str, key: String, id: String) {
        self.kinds.entry(kind.to_string()).or_default().insert(key, id);
    }

    pub fn lookup(&self, kind: &str, key: &str) -> Option<&str> {
        self.kinds.get(kind)?.get(key).map(|s| s.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("invalid project reference {0:?}: expected <cluster>:<project>")]
    Malformed(String),
    #[error("cluster {0:?} not found among existing clusters")]
    UnknownCluster(String),
    #[error("project {0:?} not found among existing projects")]
    UnknownProject(String),
}

/// The owning scope of a record, resolved to identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeContext {
    pub cluster_id: String,
    pub project_id: String,
}

impl ScopeContext {
    /// Resolve a document-side `<cluster name>:<project name>` pair through
    /// the cache. `None` when the record carries no project reference.
    pub fn derive(
        project_ref: Option<&str>,
        cache: &ResolutionCache,
    ) -> Result<Option<Self>, ScopeError> {
        let raw = match project_ref {
            Some(s) if !s.is_empty() => s,
            _ => return Ok(None),
        };
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 2 {
            return Err(ScopeError::Malformed(raw.to_string()));
        }
        let cluster_name = parts[0];
        let cluster_id = cache
            .lookup("cluster", cluster_name)
            .ok_or_else(|| ScopeError::UnknownCluster(cluster_name.to_string()))?;
        let project_id = cache
            .lookup("project", raw)
            .ok_or_else(|| ScopeError::UnknownProject(raw.to_string()))?;
        Ok(Some(Self { cluster_id: cluster_id.to_string(), project_id: project_id.to_string() }))
    }
}
