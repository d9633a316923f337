//! Prepare the target cluster: kind cluster, image availability, namespace.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::k8s::{ClusterService, KindCluster};
use crate::workflow::state::{MetadataKey, MetadataValue, Output, WorkflowState};
use crate::workflow::step::{Step, StepResult};

pub struct ClusterStep {
    kind: KindCluster,
    cluster: Arc<dyn ClusterService>,
}

impl ClusterStep {
    pub fn new(kind: KindCluster, cluster: Arc<dyn ClusterService>) -> Self {
        Self { kind, cluster }
    }
}

#[async_trait]
impl Step for ClusterStep {
    fn name(&self) -> &str {
        super::CLUSTER
    }

    fn max_retries(&self) -> u32 {
        2
    }

    fn requires(&self) -> &[Output] {
        &[Output::Build]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let image = state
            .deploy_image_ref()
            .ok_or_else(|| WorkflowError::invalid_state(self.name(), Output::Build.field_name()))?;

        let mut message = if self.kind.is_available() {
            let created = self.kind.ensure_cluster().await?;
            state.set_metadata(
                MetadataKey::ClusterName,
                MetadataValue::Text(self.kind.name().to_string()),
            );
            // Pushed images are pulled from the registry instead
            if state.metadata_text(MetadataKey::PushedImage).is_none() {
                self.kind.load_image(&image).await?;
            }
            format!(
                "kind cluster {} {}",
                self.kind.name(),
                if created { "created" } else { "ready" }
            )
        } else {
            warn!("kind is not installed, using the current kubectl context");
            "using current kubectl context".to_string()
        };

        self.cluster.ensure_namespace(&state.namespace).await?;
        info!(namespace = %state.namespace, "Cluster ready");
        message.push_str(&format!(", namespace {}", state.namespace));
        Ok(StepResult::ok(message))
    }
}
