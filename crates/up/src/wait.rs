//! Post-creation readiness: poll the directory until a registered condition
//! holds or the deadline passes.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use metrics::histogram;
use serde_json::Value as Json;
use tracing::info;

use muster_directory::Directory;

pub type ConditionCheck = fn(&Json) -> bool;

/// Readiness checkers by kind. Only clusters report a waitable condition.
pub fn condition_for(kind: &str) -> Option<ConditionCheck> {
    match kind {
        "cluster" => Some(cluster_ready),
        _ => None,
    }
}

/// A cluster is ready once a `Ready` condition reports `True`.
pub fn cluster_ready(obj: &Json) -> bool {
    obj.get("conditions")
        .and_then(|c| c.as_array())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|v| v.as_str()) == Some("Ready")
                    && c.get("status").and_then(|v| v.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

fn poll_secs() -> u64 {
    std::env::var("MUSTER_READY_POLL_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(10)
}

fn timeout_secs() -> u64 {
    std::env::var("MUSTER_READY_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30 * 60)
}

/// Block until `check` passes for the resource, polling on the configured
/// interval. A lookup failure while polling aborts immediately.
pub async fn wait_ready(
    client: &dyn Directory,
    kind: &str,
    id: &str,
    check: ConditionCheck,
) -> Result<()> {
    wait_ready_with(
        client,
        kind,
        id,
        check,
        Duration::from_secs(poll_secs()),
        Duration::from_secs(timeout_secs()),
    )
    .await
}

pub async fn wait_ready_with(
    client: &dyn Directory,
    kind: &str,
    id: &str,
    check: ConditionCheck,
    poll: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    info!(kind = %kind, id = %id, "waiting for readiness");
    loop {
        let obj = client.get_by_id(kind, id).await?;
        if check(&obj) {
            histogram!("up_ready_wait_ms", start.elapsed().as_secs_f64() * 1000.0);
            return Ok(());
        }
        tokio::time::sleep(poll).await;
        if start.elapsed() >= timeout {
            bail!("timeout waiting for {kind} {id} to be ready");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_requires_a_true_ready_condition() {
        assert!(cluster_ready(&serde_json::json!({
            "conditions": [
                {"type": "Provisioned", "status": "True"},
                {"type": "Ready", "status": "True"},
            ]
        })));
        assert!(!cluster_ready(&serde_json::json!({
            "conditions": [{"type": "Ready", "status": "False"}]
        })));
        assert!(!cluster_ready(&serde_json::json!({"name": "demo"})));
    }

    #[test]
    fn only_clusters_register_a_condition() {
        assert!(condition_for("cluster").is_some());
        assert!(condition_for("project").is_none());
        assert!(condition_for("workload").is_none());
    }
}
