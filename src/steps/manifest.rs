//! Render Kubernetes manifests for the built image.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::{WorkflowError, WorkflowResult};
use crate::k8s::{ManifestOptions, ManifestService};
use crate::verify::diagnostics::DEFAULT_TARGET_PORT;
use crate::workflow::state::{K8sResult, Output, WorkflowState};
use crate::workflow::step::{Step, StepResult};

pub struct ManifestStep {
    manifests: Arc<dyn ManifestService>,
}

impl ManifestStep {
    pub fn new(manifests: Arc<dyn ManifestService>) -> Self {
        Self { manifests }
    }
}

/// Container port: analysis first, then the Dockerfile's EXPOSE
fn container_port(state: &WorkflowState) -> u16 {
    state
        .analyze_result
        .as_ref()
        .and_then(|a| a.port)
        .or_else(|| state.dockerfile_result.as_ref().and_then(|d| d.exposed_port))
        .unwrap_or(DEFAULT_TARGET_PORT)
}

#[async_trait]
impl Step for ManifestStep {
    fn name(&self) -> &str {
        super::MANIFEST
    }

    fn max_retries(&self) -> u32 {
        1
    }

    fn requires(&self) -> &[Output] {
        &[Output::Build]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let image = state
            .deploy_image_ref()
            .ok_or_else(|| WorkflowError::invalid_state(self.name(), Output::Build.field_name()))?;
        let app_name = state.app_name();

        let mut options = ManifestOptions::new(&app_name, &image, &state.namespace, container_port(state));
        options
            .labels
            .insert("app.kubernetes.io/managed-by".to_string(), "stevedore".to_string());
        options
            .labels
            .insert("stevedore.dev/session".to_string(), state.session_id.clone());

        let dir = state.workspace_dir.join("manifests");
        let manifests = self.manifests.write(&options, &dir)?;
        info!(count = manifests.len(), dir = %dir.display(), "Wrote manifests");

        let message = format!("{} manifests for {app_name}", manifests.len());
        state.k8s_result = Some(K8sResult {
            manifests,
            namespace: state.namespace.clone(),
            service_name: app_name,
            endpoint: None,
            ..Default::default()
        });
        Ok(StepResult::ok(message))
    }
}
