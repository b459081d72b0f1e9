//! The dependency-ordered creation engine: for each kind in plan order,
//! resolve references, create or reuse each named instance, and wait for
//! readiness where a condition is registered.

#![forbid(unsafe_code)]

mod resolve;
mod wait;

pub use resolve::{fill_cache, resolve_references};
pub use wait::{cluster_ready, condition_for, wait_ready, wait_ready_with, ConditionCheck};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use metrics::counter;
use tracing::{debug, info, warn};

use muster_core::{ComposeDoc, ResolutionCache};
use muster_directory::{select_client, ClientSet, Directory, DirectoryError};
use muster_schema::{plural, Catalog};

/// Merge the endpoint catalogs into the set of creatable kinds.
pub fn creatable_catalog(set: &ClientSet) -> Catalog {
    Catalog::creatable([set.management.schemas(), set.project.schemas(), set.cluster.schemas()])
}

/// Realize every collection in the document against the directory, in
/// creation-plan order. Stops at the first fatal error; resources created
/// up to that point stay in place.
pub async fn up(set: &ClientSet, doc: &ComposeDoc) -> Result<()> {
    let catalog = creatable_catalog(set);
    let plan = catalog.creation_plan()?;
    debug!(kinds = plan.len(), "creation plan computed");

    let mut cache = ResolutionCache::default();
    for kind in &plan {
        let Some(collection) = doc.collection(&plural(kind)) else { continue };
        let Some(schema) = catalog.get(kind) else { continue };
        let mut batch_client: Option<Arc<dyn Directory>> = None;
        let mut existing: Option<HashMap<String, String>> = None;

        'records: for (name, raw) in collection {
            let mut record = schema
                .typed_record(raw)
                .with_context(|| format!("decoding {kind} {name:?}"))?;
            resolve_references(kind, &mut record, &mut cache, set)
                .await
                .with_context(|| format!("resolving references of {kind} {name:?}"))?;
            record.set_scalar("name", name.as_str());

            let cluster_id = record.get_str("clusterId").unwrap_or_default().to_string();
            let project_id = record.get_str("projectId").unwrap_or_default().to_string();
            let client = select_client(kind, set, &cluster_id, &project_id)?;
            batch_client = Some(client.clone());

            // kinds served by the management endpoint enforce name uniqueness
            // at their scope; index what already exists before creating
            if set.management.has_kind(kind) && existing.is_none() {
                let listed =
                    client.list(kind).await.with_context(|| format!("listing {kind}"))?;
                let mut index = HashMap::new();
                for obj in &listed.data {
                    let obj_name = str_field(obj, "name");
                    let obj_id = str_field(obj, "id");
                    if !obj_name.is_empty() && !obj_id.is_empty() {
                        index.insert(obj_name.to_string(), obj_id.to_string());
                    }
                }
                existing = Some(index);
            }

            let id = match existing.as_ref().and_then(|index| index.get(name.as_str())) {
                Some(id) => {
                    counter!("up_reuse_total", 1u64);
                    info!(kind = %kind, name = %name, id = %id, "instance already present; reusing");
                    id.clone()
                }
                None => match client.create(kind, &record.to_body()).await {
                    Ok(created) => {
                        counter!("up_create_total", 1u64);
                        let Some(id) = created.get("id").and_then(|v| v.as_str()) else {
                            bail!("id is missing after creating {kind} {name:?}");
                        };
                        info!(kind = %kind, name = %name, id = %id, "created");
                        id.to_string()
                    }
                    Err(DirectoryError::Conflict { message, .. }) => {
                        counter!("up_conflict_total", 1u64);
                        warn!(kind = %kind, name = %name, %message, "already exists; skipping the rest of this batch");
                        break 'records;
                    }
                    Err(e) => return Err(e).context(format!("creating {kind} {name:?}")),
                },
            };

            if let Some(check) = condition_for(kind) {
                wait_ready(client.as_ref(), kind, &id, check).await?;
            }
        }

        // index what now exists so later kinds can resolve references to it
        if let Some(client) = batch_client {
            fill_cache(client.as_ref(), kind, &mut cache)
                .await
                .with_context(|| format!("indexing existing {kind} instances"))?;
        }
    }
    Ok(())
}

pub(crate) fn str_field<'a>(obj: &'a serde_json::Value, key: &str) -> &'a str {
    obj.get(key).and_then(|v| v.as_str()).unwrap_or("")
}
