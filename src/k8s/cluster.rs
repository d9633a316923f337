//! Applying manifests to a cluster through `kubectl`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::runner::{CommandSpec, ProcessRunner};
use crate::workflow::state::ResourceOutcome;

#[async_trait]
pub trait ClusterService: Send + Sync {
    /// Apply each manifest, returning one outcome per resource.
    ///
    /// A manifest that fails to apply yields a failed outcome rather than an
    /// error; callers decide whether partial success is acceptable.
    async fn apply(&self, manifests: &[PathBuf], namespace: &str)
        -> WorkflowResult<Vec<ResourceOutcome>>;

    async fn ensure_namespace(&self, namespace: &str) -> WorkflowResult<()>;
}

pub struct KubectlCluster {
    runner: Arc<dyn ProcessRunner>,
}

impl KubectlCluster {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

/// Parse `deployment.apps/web created` style lines
pub fn parse_apply_output(output: &str) -> Vec<ResourceOutcome> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| match line.split_once(' ') {
            Some((resource, message)) => ResourceOutcome {
                resource: resource.to_string(),
                success: true,
                message: message.trim().to_string(),
            },
            None => ResourceOutcome {
                resource: line.to_string(),
                success: true,
                message: String::new(),
            },
        })
        .collect()
}

#[async_trait]
impl ClusterService for KubectlCluster {
    #[instrument(skip(self, manifests), fields(count = manifests.len()))]
    async fn apply(
        &self,
        manifests: &[PathBuf],
        namespace: &str,
    ) -> WorkflowResult<Vec<ResourceOutcome>> {
        if manifests.is_empty() {
            return Err(WorkflowError::validation("manifests", "nothing to apply"));
        }

        let mut outcomes = Vec::new();
        for manifest in manifests {
            let spec = CommandSpec::new("kubectl")
                .arg("apply")
                .arg("-f")
                .arg(manifest.display().to_string())
                .arg("-n")
                .arg(namespace);
            match self.runner.run(&spec).await {
                Ok(output) => outcomes.extend(parse_apply_output(&output.stdout)),
                Err(e) => {
                    warn!(manifest = %manifest.display(), "kubectl apply failed: {}", e);
                    outcomes.push(ResourceOutcome {
                        resource: manifest.display().to_string(),
                        success: false,
                        message: e.output().map(str::trim).unwrap_or_default().to_string(),
                    });
                }
            }
        }

        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(applied = outcomes.len() - failed, failed, "Applied manifests");
        Ok(outcomes)
    }

    async fn ensure_namespace(&self, namespace: &str) -> WorkflowResult<()> {
        let exists = self
            .runner
            .run(&CommandSpec::new("kubectl").args(["get", "namespace", namespace]))
            .await
            .is_ok();
        if !exists {
            self.runner
                .run(&CommandSpec::new("kubectl").args(["create", "namespace", namespace]))
                .await?;
            info!(namespace, "Created namespace");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockRunner};

    #[test]
    fn test_parse_apply_output() {
        let outcomes =
            parse_apply_output("deployment.apps/web created\nservice/web unchanged\n\n");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].resource, "deployment.apps/web");
        assert_eq!(outcomes[1].message, "unchanged");
    }

    #[tokio::test]
    async fn test_apply_records_per_manifest_failures() {
        let runner = Arc::new(MockRunner::new());
        runner
            .on(
                "kubectl apply -f /m/deployment.yaml",
                Ok(CommandOutput::ok("deployment.apps/web created")),
            )
            .on(
                "kubectl apply -f /m/service.yaml",
                MockRunner::fail("kubectl apply", "error: invalid port"),
            );
        let cluster = KubectlCluster::new(runner.clone());

        let outcomes = cluster
            .apply(
                &[
                    PathBuf::from("/m/deployment.yaml"),
                    PathBuf::from("/m/service.yaml"),
                ],
                "apps",
            )
            .await
            .unwrap();

        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].message, "error: invalid port");
        assert!(runner.calls("kubectl apply")[0].ends_with("-n apps"));
    }

    #[tokio::test]
    async fn test_ensure_namespace_creates_when_missing() {
        let runner = Arc::new(MockRunner::new());
        runner.on(
            "kubectl get namespace",
            MockRunner::fail("kubectl get namespace", "NotFound"),
        );
        KubectlCluster::new(runner.clone())
            .ensure_namespace("apps")
            .await
            .unwrap();
        assert_eq!(runner.calls("kubectl create namespace apps").len(), 1);
    }
}
