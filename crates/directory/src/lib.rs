//! The resource directory seam: the client trait frontends and the engine
//! depend on, endpoint selection, and an in-memory implementation for tests.

#![forbid(unsafe_code)]

pub mod http;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use muster_schema::Schema;

pub use http::{ConnectOptions, HttpDirectory};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("{kind} already exists: {message}")]
    Conflict { kind: String, message: String },
    #[error("{kind} {id:?} not found")]
    NotFound { kind: String, id: String },
    #[error("{scope} is required for {kind}")]
    ScopeRequired { kind: String, scope: &'static str },
    #[error("no endpoint serves kind {0:?}")]
    UnknownKind(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// A listed collection as returned by the directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub data: Vec<Json>,
}

/// One scoped view of the remote directory. `scoped` derives a narrower
/// client value; handles are never mutated in place.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Whether this endpoint's catalog serves the kind.
    fn has_kind(&self, kind: &str) -> bool;

    /// The endpoint's schema catalog.
    fn schemas(&self) -> &BTreeMap<String, Schema>;

    /// Every instance of a kind visible at this scope.
    async fn list(&self, kind: &str) -> Result<Collection, DirectoryError>;

    /// Create an instance; the returned record carries the assigned `id`.
    async fn create(&self, kind: &str, body: &Json) -> Result<Json, DirectoryError>;

    async fn get_by_id(&self, kind: &str, id: &str) -> Result<Json, DirectoryError>;

    /// A fresh handle addressing `segment` under this endpoint.
    fn scoped(&self, segment: &str) -> Arc<dyn Directory>;
}

/// The three endpoint roots a run talks to.
#[derive(Clone)]
pub struct ClientSet {
    pub management: Arc<dyn Directory>,
    pub cluster: Arc<dyn Directory>,
    pub project: Arc<dyn Directory>,
}

/// Pick the endpoint serving `kind`. Project- and cluster-scoped catalogs
/// take precedence over the management catalog, cluster checked last, so a
/// kind served by all three binds to the cluster endpoint. Scoped endpoints
/// require their scope identifier.
pub fn select_client(
    kind: &str,
    set: &ClientSet,
    cluster_id: &str,
    project_id: &str,
) -> Result<Arc<dyn Directory>, DirectoryError> {
    let mut chosen: Option<Arc<dyn Directory>> = None;
    if set.management.has_kind(kind) {
        chosen = Some(set.management.clone());
    }
    if set.project.has_kind(kind) {
        if project_id.is_empty() {
            return Err(DirectoryError::ScopeRequired { kind: kind.to_string(), scope: "projectId" });
        }
        chosen = Some(set.project.scoped(project_id));
    }
    if set.cluster.has_kind(kind) {
        if cluster_id.is_empty() {
            return Err(DirectoryError::ScopeRequired { kind: kind.to_string(), scope: "clusterId" });
        }
        chosen = Some(set.cluster.scoped(cluster_id));
    }
    chosen.ok_or_else(|| DirectoryError::UnknownKind(kind.to_string()))
}

// ----------------- In-memory implementation -----------------

/// A record of one create call observed by a [`MemoryDirectory`].
#[derive(Debug, Clone)]
pub struct CreatedRecord {
    /// Scope segments the creating handle was derived with, `/`-joined.
    pub scope: String,
    pub kind: String,
    pub body: Json,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<Json>>,
    created: Vec<CreatedRecord>,
    conflict_kinds: BTreeSet<String>,
    ready_on_create: bool,
    next_id: u64,
}

/// In-memory directory backing the engine tests. Handles derived with
/// `scoped` share the same state and record the scope they were given.
pub struct MemoryDirectory {
    schemas: Arc<BTreeMap<String, Schema>>,
    state: Arc<Mutex<MemoryState>>,
    scope: String,
}

impl MemoryDirectory {
    pub fn new(schemas: BTreeMap<String, Schema>) -> Arc<Self> {
        Arc::new(Self {
            schemas: Arc::new(schemas),
            state: Arc::new(Mutex::new(MemoryState::default())),
            scope: String::new(),
        })
    }

    /// Add a pre-existing object visible to `list` and `get_by_id`.
    pub fn seed(&self, kind: &str, object: Json) {
        let mut state = self.state.lock().unwrap();
        state.objects.entry(kind.to_string()).or_default().push(object);
    }

    /// Make every create of `kind` fail with a duplicate conflict.
    pub fn conflict_on_create(&self, kind: &str) {
        self.state.lock().unwrap().conflict_kinds.insert(kind.to_string());
    }

    /// Stamp created objects with a `Ready`/`True` condition.
    pub fn mark_ready_on_create(&self) {
        self.state.lock().unwrap().ready_on_create = true;
    }

    pub fn created(&self) -> Vec<CreatedRecord> {
        self.state.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    fn has_kind(&self, kind: &str) -> bool {
        self.schemas.contains_key(kind)
    }

    fn schemas(&self) -> &BTreeMap<String, Schema> {
        &self.schemas
    }

    async fn list(&self, kind: &str) -> Result<Collection, DirectoryError> {
        let state = self.state.lock().unwrap();
        Ok(Collection { data: state.objects.get(kind).cloned().unwrap_or_default() })
    }

    async fn create(&self, kind: &str, body: &Json) -> Result<Json, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        if state.conflict_kinds.contains(kind) {
            return Err(DirectoryError::Conflict {
                kind: kind.to_string(),
                message: "already exists".to_string(),
            });
        }
        state.next_id += 1;
        // projects carry two-segment identifiers on the wire
        let id = if kind == "project" {
            let cluster = body.get("clusterId").and_then(|v| v.as_str()).unwrap_or("");
            format!("{cluster}:p-{}", state.next_id)
        } else {
            format!("{kind}-{}", state.next_id)
        };
        let mut object = body.clone();
        if let Some(map) = object.as_object_mut() {
            map.insert("id".to_string(), Json::String(id));
            if state.ready_on_create {
                map.insert(
                    "conditions".to_string(),
                    serde_json::json!([{"type": "Ready", "status": "True"}]),
                );
            }
        }
        state.objects.entry(kind.to_string()).or_default().push(object.clone());
        state.created.push(CreatedRecord {
            scope: self.scope.clone(),
            kind: kind.to_string(),
            body: body.clone(),
        });
        Ok(object)
    }

    async fn get_by_id(&self, kind: &str, id: &str) -> Result<Json, DirectoryError> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(kind)
            .and_then(|objects| {
                objects.iter().find(|o| o.get("id").and_then(|v| v.as_str()) == Some(id))
            })
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound { kind: kind.to_string(), id: id.to_string() })
    }

    fn scoped(&self, segment: &str) -> Arc<dyn Directory> {
        let scope = if self.scope.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", self.scope, segment)
        };
        Arc::new(Self { schemas: self.schemas.clone(), state: self.state.clone(), scope })
    }
}
