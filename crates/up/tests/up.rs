#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use muster_core::{ComposeDoc, FieldValue, ResolutionCache};
use muster_directory::{ClientSet, Directory, MemoryDirectory};
use muster_schema::{Field, Schema};
use muster_up::{cluster_ready, resolve_references, up, wait_ready_with};

fn schema(id: &str, fields: &[(&str, &str)]) -> Schema {
    Schema {
        id: id.to_string(),
        resource_fields: fields
            .iter()
            .map(|(k, t)| (k.to_string(), Field { field_type: t.to_string() }))
            .collect(),
    }
}

fn catalog(schemas: Vec<Schema>) -> BTreeMap<String, Schema> {
    schemas.into_iter().map(|s| (s.id.clone(), s)).collect()
}

struct World {
    management: Arc<MemoryDirectory>,
    project: Arc<MemoryDirectory>,
    set: ClientSet,
}

fn world() -> World {
    let management = MemoryDirectory::new(catalog(vec![
        schema("cluster", &[("creatorId", "reference[user]"), ("description", "string")]),
        schema(
            "project",
            &[
                ("creatorId", "reference[user]"),
                ("clusterId", "reference[cluster]"),
                ("description", "string"),
            ],
        ),
    ]));
    let cluster_ep = MemoryDirectory::new(catalog(vec![schema(
        "namespace",
        &[("creatorId", "reference[user]"), ("projectId", "reference[project]")],
    )]));
    let project_ep = MemoryDirectory::new(catalog(vec![
        schema("secret", &[("creatorId", "reference[user]"), ("projectId", "reference[project]")]),
        schema(
            "workload",
            &[
                ("creatorId", "reference[user]"),
                ("projectId", "reference[project]"),
                ("image", "string"),
                ("secretIds", "array[reference[secret]]"),
            ],
        ),
    ]));
    let set = ClientSet {
        management: management.clone() as Arc<dyn Directory>,
        cluster: cluster_ep as Arc<dyn Directory>,
        project: project_ep.clone() as Arc<dyn Directory>,
    };
    World { management, project: project_ep, set }
}

fn workload_schema(w: &World) -> Schema {
    w.set.project.schemas().get("workload").cloned().unwrap()
}

#[tokio::test]
async fn resolving_a_project_reference_sets_both_identifiers() {
    let w = world();
    w.management.seed("cluster", json!({"name": "demo", "id": "c-1"}));
    w.management.seed("project", json!({"name": "myproject", "id": "c-1:p-1"}));

    let schema = workload_schema(&w);
    let mut record = schema
        .typed_record(&json!({"projectId": "demo:myproject", "image": "nginx"}))
        .unwrap();
    let mut cache = ResolutionCache::default();
    resolve_references("workload", &mut record, &mut cache, &w.set).await.unwrap();

    assert_eq!(record.get_str("projectId"), Some("c-1:p-1"));
    assert_eq!(record.get_str("clusterId"), Some("c-1"));
}

#[tokio::test]
async fn plain_references_resolve_through_the_bare_name() {
    let w = world();
    w.management.seed("cluster", json!({"name": "demo", "id": "c-1"}));

    let schema = w.set.management.schemas().get("project").cloned().unwrap();
    let mut record = schema.typed_record(&json!({"clusterId": "demo"})).unwrap();
    let mut cache = ResolutionCache::default();
    resolve_references("project", &mut record, &mut cache, &w.set).await.unwrap();

    assert_eq!(record.get_str("clusterId"), Some("c-1"));
}

#[tokio::test]
async fn project_scoped_references_use_the_composite_key() {
    let w = world();
    w.management.seed("cluster", json!({"name": "demo", "id": "c-1"}));
    w.management.seed("project", json!({"name": "myproject", "id": "c-1:p-1"}));

    let mut cache = ResolutionCache::default();
    cache.insert("secret", "c-1:c-1:p-1:db-password".to_string(), "s-1".to_string());

    let schema = workload_schema(&w);
    let mut record = schema
        .typed_record(&json!({"projectId": "demo:myproject", "secretIds": ["db-password"]}))
        .unwrap();
    resolve_references("workload", &mut record, &mut cache, &w.set).await.unwrap();

    assert_eq!(
        record.fields["secretIds"],
        FieldValue::ReferenceList { target: "secret".to_string(), values: vec!["s-1".to_string()] }
    );
}

#[tokio::test]
async fn unmatched_references_resolve_to_an_empty_identifier() {
    let w = world();
    w.management.seed("cluster", json!({"name": "demo", "id": "c-1"}));
    w.management.seed("project", json!({"name": "myproject", "id": "c-1:p-1"}));

    let schema = workload_schema(&w);
    let mut record = schema
        .typed_record(&json!({"projectId": "demo:myproject", "secretIds": ["ghost"]}))
        .unwrap();
    let mut cache = ResolutionCache::default();
    resolve_references("workload", &mut record, &mut cache, &w.set).await.unwrap();

    // the miss is not fatal here; the directory rejects the empty value
    assert_eq!(
        record.fields["secretIds"],
        FieldValue::ReferenceList { target: "secret".to_string(), values: vec![String::new()] }
    );
}

#[tokio::test]
async fn existing_instances_are_reused_without_a_create_call() {
    let w = world();
    w.management.seed(
        "cluster",
        json!({
            "name": "demo",
            "id": "c-1",
            "conditions": [{"type": "Ready", "status": "True"}],
        }),
    );

    let doc = ComposeDoc::parse("clusters:\n  demo:\n    description: already there\n").unwrap();
    up(&w.set, &doc).await.unwrap();

    assert!(w.management.created().is_empty());
}

#[tokio::test]
async fn a_duplicate_conflict_stops_the_remaining_batch() {
    let w = world();
    w.management.conflict_on_create("cluster");

    let doc = ComposeDoc::parse(
        "clusters:\n  alpha:\n    description: one\n  beta:\n    description: two\n",
    )
    .unwrap();
    // the duplicate is recovered, not fatal; beta is skipped with it
    up(&w.set, &doc).await.unwrap();

    assert!(w.management.created().is_empty());
}

#[tokio::test]
async fn a_full_document_materializes_in_dependency_order() {
    let w = world();
    w.management.mark_ready_on_create();

    let doc = ComposeDoc::parse(concat!(
        "version: \"v3\"\n",
        "workloads:\n",
        "  web:\n",
        "    projectId: demo:myproject\n",
        "    image: nginx\n",
        "projects:\n",
        "  myproject:\n",
        "    clusterId: demo\n",
        "clusters:\n",
        "  demo:\n",
        "    description: demo cluster\n",
    ))
    .unwrap();
    up(&w.set, &doc).await.unwrap();

    let managed = w.management.created();
    let kinds: Vec<&str> = managed.iter().map(|c| c.kind.as_str()).collect();
    assert_eq!(kinds, ["cluster", "project"]);
    assert_eq!(managed[1].body["clusterId"], "cluster-1");

    let scoped = w.project.created();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].kind, "workload");
    assert_eq!(scoped[0].scope, "cluster-1:p-2");
    assert_eq!(scoped[0].body["projectId"], "cluster-1:p-2");
    assert_eq!(scoped[0].body["clusterId"], "cluster-1");
    assert_eq!(scoped[0].body["name"], "web");
}

#[tokio::test]
async fn project_scoped_kinds_require_a_project_reference() {
    let w = world();
    let doc = ComposeDoc::parse("workloads:\n  web:\n    image: nginx\n").unwrap();
    let err = up(&w.set, &doc).await.unwrap_err();
    assert!(err.to_string().contains("projectId"), "err={err}");
}

#[tokio::test]
async fn readiness_times_out_when_the_condition_never_holds() {
    let w = world();
    w.management.seed("cluster", json!({"name": "demo", "id": "c-1"}));
    let err = wait_ready_with(
        w.set.management.as_ref(),
        "cluster",
        "c-1",
        cluster_ready,
        Duration::from_millis(1),
        Duration::from_millis(5),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("timeout"), "err={err}");
}

#[tokio::test]
async fn readiness_polling_fails_fast_on_lookup_errors() {
    let w = world();
    let err = wait_ready_with(
        w.set.management.as_ref(),
        "cluster",
        "ghost",
        cluster_ready,
        Duration::from_millis(1),
        Duration::from_millis(5),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not found"), "err={err}");
}
