//! Schema catalog adapter: field descriptors, reference-type parsing, and the
//! dependency-ordered creation plan.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use muster_core::{DocError, FieldValue, ResourceRecord};

/// Server-populated identity field present on every user-creatable kind.
/// Never gates ordering.
pub const CREATOR_FIELD: &str = "creatorId";

/// Kinds whose `namespace` references do not gate ordering; breaks the
/// project/namespace cycle.
const NAMESPACED_KINDS: &[&str] = &["project"];

pub fn namespace_exempt(kind: &str) -> bool {
    NAMESPACED_KINDS.contains(&kind)
}

/// Collection key for a kind, used both in the compose document and in the
/// directory's collection URLs.
pub fn plural(kind: &str) -> String {
    format!("{kind}s")
}

/// One field descriptor as served by the remote schema catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Field {
    #[serde(rename = "type", default)]
    pub field_type: String,
}

impl Field {
    /// Decode `reference[kind]` and `array[reference[kind]]` field types,
    /// including link-style targets such as `reference[/v3/schemas/project]`.
    pub fn reference_target(&self) -> Option<&str> {
        if !self.field_type.contains("reference") {
            return None;
        }
        let t = self.field_type.as_str();
        let t = t.strip_prefix("array[").unwrap_or(t);
        let t = t.strip_suffix(']').unwrap_or(t);
        let t = t.strip_prefix("reference[").unwrap_or(t);
        let t = t.strip_suffix(']').unwrap_or(t);
        let t = t.strip_prefix("/v3/schemas/").unwrap_or(t);
        let t = t.strip_prefix("/v3/clusters/schemas/").unwrap_or(t);
        let t = t.strip_prefix("/v3/projects/schemas/").unwrap_or(t);
        Some(t)
    }

    pub fn is_list(&self) -> bool {
        self.field_type.starts_with("array[")
    }
}

/// One resource kind as served by the remote schema catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "resourceFields")]
    pub resource_fields: BTreeMap<String, Field>,
}

impl Schema {
    pub fn is_creatable(&self) -> bool {
        self.resource_fields.contains_key(CREATOR_FIELD)
    }

    /// Decode a raw document record into typed fields. Fields the schema
    /// declares as references become `Reference`/`ReferenceList`; everything
    /// else passes through as a scalar.
    pub fn typed_record(&self, raw: &Json) -> Result<ResourceRecord, DocError> {
        let Some(map) = raw.as_object() else {
            return Err(DocError::Record { collection: plural(&self.id), name: String::new() });
        };
        let mut record = ResourceRecord::new(self.id.as_str());
        for (key, value) in map {
            let field = self.resource_fields.get(key);
            let target = field.and_then(|f| f.reference_target());
            match (field, target) {
                (Some(f), Some(target)) if f.is_list() => {
                    let items = value.as_array().ok_or_else(|| DocError::ReferenceValue {
                        kind: self.id.clone(),
                        field: key.clone(),
                    })?;
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        let name = item.as_str().ok_or_else(|| DocError::ReferenceValue {
                            kind: self.id.clone(),
                            field: key.clone(),
                        })?;
                        values.push(name.to_string());
                    }
                    record.fields.insert(
                        key.clone(),
                        FieldValue::ReferenceList { target: target.to_string(), values },
                    );
                }
                (Some(_), Some(target)) => {
                    let name = value.as_str().ok_or_else(|| DocError::ReferenceValue {
                        kind: self.id.clone(),
                        field: key.clone(),
                    })?;
                    record.fields.insert(
                        key.clone(),
                        FieldValue::Reference {
                            target: target.to_string(),
                            value: name.to_string(),
                        },
                    );
                }
                _ => {
                    record.fields.insert(key.clone(), FieldValue::Scalar(value.clone()));
                }
            }
        }
        Ok(record)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("unresolvable reference cycle among kinds: {}", .stuck.join(", "))]
    Cycle { stuck: Vec<String> },
}

/// The merged set of user-creatable kinds across all endpoint catalogs.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    schemas: BTreeMap<String, Schema>,
}

impl Catalog {
    /// Merge endpoint catalogs, keeping only kinds that carry the creator
    /// field. Later catalogs win on duplicate kinds.
    pub fn creatable<'a, I>(catalogs: I) -> Self
    where
        I: IntoIterator<Item = &'a BTreeMap<String, Schema>>,
    {
        let mut schemas = BTreeMap::new();
        for catalog in catalogs {
            for (kind, schema) in catalog {
                if schema.is_creatable() {
                    schemas.insert(kind.clone(), schema.clone());
                }
            }
        }
        Self { schemas }
    }

    pub fn get(&self, kind: &str) -> Option<&Schema> {
        self.schemas.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Creation order over the catalog: every kind is placed after the kinds
    /// it references. Self references, the creator field, the namespace
    /// exemption, and targets outside the catalog do not gate placement.
    /// A genuine cycle fails with the stuck kinds enumerated.
    pub fn creation_plan(&self) -> Result<Vec<String>, PlanError> {
        let mut deps: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (kind, schema) in &self.schemas {
            let mut wants = BTreeSet::new();
            for (field_name, field) in &schema.resource_fields {
                if field_name == CREATOR_FIELD {
                    continue;
                }
                let Some(target) = field.reference_target() else { continue };
                if target == kind {
                    continue;
                }
                if target == "namespace" && namespace_exempt(kind) {
                    continue;
                }
                if !self.schemas.contains_key(target) {
                    continue;
                }
                wants.insert(target);
            }
            deps.insert(kind.as_str(), wants);
        }

        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (&kind, wants) in &deps {
            in_degree.insert(kind, wants.len());
            for &target in wants {
                dependents.entry(target).or_default().push(kind);
            }
        }

        let mut ready: VecDeque<&str> =
            in_degree.iter().filter(|(_, d)| **d == 0).map(|(k, _)| *k).collect();
        let mut plan = Vec::with_capacity(self.schemas.len());
        while let Some(kind) = ready.pop_front() {
            plan.push(kind.to_string());
            if let Some(children) = dependents.get(kind) {
                for &child in children {
                    if let Some(d) = in_degree.get_mut(child) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push_back(child);
                        }
                    }
                }
            }
        }

        if plan.len() != self.schemas.len() {
            let placed: BTreeSet<&str> = plan.iter().map(|s| s.as_str()).collect();
            let stuck: Vec<String> = self
                .schemas
                .keys()
                .filter(|k| !placed.contains(k.as_str()))
                .cloned()
                .collect();
            return Err(PlanError::Cycle { stuck });
        }
        Ok(plan)
    }
}
