//! Apply the rendered manifests.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::k8s::ClusterService;
use crate::runner::ProcessRunner;
use crate::verify::diagnostics::DiagnosticsCollector;
use crate::workflow::state::{MetadataKey, MetadataValue, Output, WorkflowState};
use crate::workflow::step::{Step, StepResult};

pub struct DeployStep {
    cluster: Arc<dyn ClusterService>,
    collector: DiagnosticsCollector,
}

impl DeployStep {
    pub fn new(runner: Arc<dyn ProcessRunner>, cluster: Arc<dyn ClusterService>) -> Self {
        Self {
            cluster,
            collector: DiagnosticsCollector::new(runner),
        }
    }
}

#[async_trait]
impl Step for DeployStep {
    fn name(&self) -> &str {
        super::DEPLOY
    }

    fn max_retries(&self) -> u32 {
        2
    }

    fn requires(&self) -> &[Output] {
        &[Output::K8s]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let k8s = state
            .k8s_result
            .as_mut()
            .ok_or_else(|| WorkflowError::invalid_state(super::DEPLOY, Output::K8s.field_name()))?;

        let outcomes = self.cluster.apply(&k8s.manifests, &k8s.namespace).await?;
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| format!("{}: {}", o.resource, o.message))
            .collect();
        k8s.applied = outcomes;

        // Snapshot right after apply; pods are usually still starting
        let diagnostics = self.collector.collect(&k8s.namespace, &k8s.service_name).await;
        k8s.metadata.insert(
            MetadataKey::Diagnostics,
            MetadataValue::Json(serde_json::to_value(&diagnostics)?),
        );

        if !failed.is_empty() {
            warn!(failed = failed.len(), "Some resources failed to apply");
            return Err(WorkflowError::external_with_output(
                "kubectl apply",
                format!("{} resource(s) failed to apply", failed.len()),
                failed.join("\n"),
            ));
        }

        info!(resources = k8s.applied.len(), namespace = %k8s.namespace, "Deployed");
        Ok(StepResult::ok(format!(
            "applied {} resources to {}",
            k8s.applied.len(),
            k8s.namespace
        )))
    }
}
