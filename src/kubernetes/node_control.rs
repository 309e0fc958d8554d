use crate::errors::{CommandError, RollerError};
use crate::events::EventDetails;
use crate::runtime::block_on;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use std::time::Duration;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Cordons and drains nodes identified by cloud instance-id rather than
/// Kubernetes node name — the caller only ever knows the cloud side of the
/// identity.
pub struct NodeControl {
    client: Client,
}

impl NodeControl {
    pub fn new(client: Client) -> Self {
        NodeControl { client }
    }

    /// Marks every resolvable node `unschedulable=true`. Per-node failures
    /// are collected; if any node failed the whole call fails, after every
    /// node has been attempted.
    pub fn cordon(&self, ids: &[String], event_details: EventDetails) -> Result<(), Box<RollerError>> {
        block_on(async {
            let api: Api<Node> = Api::all(self.client.clone());
            let mut failures = Vec::new();

            for id in ids {
                if let Err(e) = Self::cordon_one(&api, id).await {
                    failures.push(format!("{id}: {e}"));
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(RollerError::upstream(
                    event_details,
                    CommandError::new_from_safe_message(format!("failed to cordon nodes: {}", failures.join("; "))),
                ))
            }
        })
    }

    async fn cordon_one(api: &Api<Node>, instance_id: &str) -> Result<(), CommandError> {
        let node_name = Self::resolve_node_name(api, instance_id).await?;
        let Some(node_name) = node_name else {
            return Ok(());
        };

        let patch = json!({ "spec": { "unschedulable": true } });
        api.patch(&node_name, &PatchParams::apply("cluster-roller"), &Patch::Merge(&patch))
            .await
            .map_err(|e| CommandError::new(format!("failed to cordon node {node_name}"), Some(e.to_string())))?;
        Ok(())
    }

    /// Cordons first, then evicts every pod on the node with force
    /// semantics: daemonset pods are skipped, emptyDir-backed pods are
    /// evicted anyway, grace period is left at the pod's own default.
    pub fn drain(&self, ids: &[String], event_details: EventDetails) -> Result<(), Box<RollerError>> {
        self.cordon(ids, event_details.clone())?;

        block_on(async {
            let node_api: Api<Node> = Api::all(self.client.clone());
            let mut failures = Vec::new();

            let outcome = tokio::time::timeout(DRAIN_TIMEOUT, async {
                for id in ids {
                    if let Err(e) = Self::drain_one(&self.client, &node_api, id).await {
                        failures.push(format!("{id}: {e}"));
                    }
                }
            })
            .await;

            if outcome.is_err() {
                return Err(RollerError::drain_timeout(
                    event_details.clone(),
                    "drain did not complete within the 120s budget",
                ));
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(RollerError::upstream(
                    event_details,
                    CommandError::new_from_safe_message(format!("failed to drain nodes: {}", failures.join("; "))),
                ))
            }
        })
    }

    async fn drain_one(client: &Client, node_api: &Api<Node>, instance_id: &str) -> Result<(), CommandError> {
        let Some(node_name) = Self::resolve_node_name(node_api, instance_id).await? else {
            return Ok(());
        };

        let all_pods: Api<Pod> = Api::all(client.clone());
        let list_params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = all_pods
            .list(&list_params)
            .await
            .map_err(|e| CommandError::new(format!("failed to list pods on node {node_name}"), Some(e.to_string())))?;

        for pod in pods.items {
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            if Self::is_daemonset_owned(&pod) {
                continue;
            }

            let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
            let namespaced_pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

            let evict_params = EvictParams {
                delete_options: Some(DeleteParams::default()),
                ..Default::default()
            };

            let result = namespaced_pods.evict(&name, &evict_params).await;

            if let Err(e) = result {
                if !e.to_string().contains("404") {
                    return Err(CommandError::new(format!("failed to evict pod {namespace}/{name}"), Some(e.to_string())));
                }
            }
        }

        Ok(())
    }

    fn is_daemonset_owned(pod: &Pod) -> bool {
        pod.metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
            .unwrap_or(false)
    }

    async fn resolve_node_name(api: &Api<Node>, instance_id: &str) -> Result<Option<String>, CommandError> {
        let list_params = ListParams::default().labels(&format!("instance-id={instance_id}"));
        let nodes = api
            .list(&list_params)
            .await
            .map_err(|e| CommandError::new(format!("failed to list nodes for instance {instance_id}"), Some(e.to_string())))?;

        Ok(nodes.items.into_iter().next().and_then(|n| n.metadata.name))
    }
}

#[cfg(test)]
mod tests {
    // `NodeControl` talks to a real API server via `kube::Client`; covered
    // under the `test-local-kube` feature against a live cluster, matching
    // the reference engine's split between unit and cluster-gated tests.
}
