use crate::errors::CommandError;
use crate::runtime::block_on;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;

/// Scales a Deployment's replica count and reports the replica count the
/// API server echoes back after the patch. Used to disable/re-enable the
/// cluster autoscaler and the node-terminator deployments around a run.
pub struct DeploymentScaler {
    client: Client,
}

impl DeploymentScaler {
    pub fn new(client: Client) -> Self {
        DeploymentScaler { client }
    }

    pub fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) -> Result<i32, CommandError> {
        block_on(async {
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
            let patch = json!({ "spec": { "replicas": replicas } });
            let deployment = api
                .patch(name, &PatchParams::apply("cluster-roller"), &Patch::Merge(&patch))
                .await
                .map_err(|e| {
                    CommandError::new(
                        format!("failed to scale deployment {namespace}/{name} to {replicas}"),
                        Some(e.to_string()),
                    )
                })?;

            Ok(deployment
                .spec
                .and_then(|s| s.replicas)
                .unwrap_or(replicas))
        })
    }
}

#[cfg(test)]
mod tests {
    // `DeploymentScaler` talks to a real API server via `kube::Client`; its
    // behavior is exercised against a live cluster under the
    // `test-local-kube` feature, following the reference engine's own split
    // between unit-testable pure logic and cluster-gated integration tests.
}
