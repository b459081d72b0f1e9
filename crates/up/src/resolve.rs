//! Reference rewriting: field values go from resource names to identifiers,
//! with the per-kind cache populated lazily on first use.

use anyhow::{bail, Context, Result};
use tracing::debug;

use muster_core::{FieldValue, ResolutionCache, ResourceRecord, ScopeContext};
use muster_directory::{select_client, ClientSet, Directory};

use crate::str_field;

/// Kinds addressed by name rather than identifier; references to them never
/// need rewriting.
const NAME_IS_ID: &[&str] = &["namespace", "persistVolume"];

/// Rewrite every reference-typed field of `record` from a resource name to
/// its identifier. A lookup miss leaves an empty identifier in place; the
/// directory is expected to reject those on submission.
pub async fn resolve_references(
    kind: &str,
    record: &mut ResourceRecord,
    cache: &mut ResolutionCache,
    set: &ClientSet,
) -> Result<()> {
    let reference_fields = record.reference_fields();
    if reference_fields.is_empty() {
        return Ok(());
    }
    // the record's own scope pair, captured before any rewrite touches it
    let project_ref = record.get_str("projectId").map(|s| s.to_string());

    for (field, target) in reference_fields {
        if NAME_IS_ID.contains(&target.as_str()) {
            continue;
        }
        if !cache.contains(&target) {
            // project and cluster are near-universal reference targets and
            // are needed to compute the owning scope below
            if !cache.contains("project") {
                fill_cache(set.management.as_ref(), "project", cache).await?;
            }
            if !cache.contains("cluster") {
                fill_cache(set.management.as_ref(), "cluster", cache).await?;
            }
            let scope = if set.project.has_kind(&target) {
                ScopeContext::derive(project_ref.as_deref(), cache)?.unwrap_or_default()
            } else {
                ScopeContext::default()
            };
            let client = select_client(&target, set, &scope.cluster_id, &scope.project_id)?;
            fill_cache(client.as_ref(), &target, cache).await?;
        }

        // a project reference always implies a cluster reference
        if field == "projectId" {
            let scope = ScopeContext::derive(project_ref.as_deref(), cache)?.unwrap_or_default();
            record.set_reference_value("projectId", scope.project_id);
            record.set_scalar("clusterId", scope.cluster_id);
            continue;
        }

        let scope = if set.project.has_kind(kind) {
            Some(ScopeContext::derive(project_ref.as_deref(), cache)?.unwrap_or_default())
        } else {
            None
        };
        rewrite_field(record, &field, &target, scope.as_ref(), cache);
    }
    Ok(())
}

fn rewrite_field(
    record: &mut ResourceRecord,
    field: &str,
    target: &str,
    scope: Option<&ScopeContext>,
    cache: &ResolutionCache,
) {
    let lookup = |name: &str| -> String {
        let resolved = match scope {
            // instances of project-scoped kinds are addressed within their
            // owning scope, not by bare name
            Some(s) => {
                cache.lookup(target, &format!("{}:{}:{}", s.cluster_id, s.project_id, name))
            }
            None => cache.lookup(target, name),
        };
        resolved.unwrap_or_default().to_string()
    };
    match record.fields.get_mut(field) {
        Some(FieldValue::Reference { value, .. }) => *value = lookup(value),
        Some(FieldValue::ReferenceList { values, .. }) => {
            for value in values.iter_mut() {
                *value = lookup(value);
            }
        }
        _ => {}
    }
}

/// List a kind's existing instances and index them name → identifier.
/// Instances owned by a project key as `<projectId>:<name>`; projects key as
/// `<cluster name>:<project name>` since project names are only unique
/// within their cluster. Namespaces are skipped: their name is their id.
pub async fn fill_cache(
    client: &dyn Directory,
    kind: &str,
    cache: &mut ResolutionCache,
) -> Result<()> {
    if kind == "namespace" {
        return Ok(());
    }
    cache.insert_kind(kind);
    let listed = client.list(kind).await.with_context(|| format!("listing {kind}"))?;
    for obj in &listed.data {
        let id = str_field(obj, "id");
        let project_id = str_field(obj, "projectId");
        let mut name = str_field(obj, "name").to_string();
        if kind == "project" {
            let parts: Vec<&str> = id.split(':').collect();
            if parts.len() != 2 {
                bail!("invalid project identifier {id:?}: expected <cluster>:<suffix>");
            }
            let cluster = client.get_by_id("cluster", parts[0]).await?;
            name = format!("{}:{}", str_field(&cluster, "name"), name);
        }
        if name.is_empty() || id.is_empty() {
            continue;
        }
        let key = if project_id.is_empty() { name } else { format!("{project_id}:{name}") };
        cache.insert(kind, key, id.to_string());
    }
    debug!(kind = %kind, "resolution cache populated");
    Ok(())
}
