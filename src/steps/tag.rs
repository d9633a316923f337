//! Tag the built image for the configured registry.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::{WorkflowError, WorkflowResult};
use crate::runner::{CommandSpec, ProcessRunner};
use crate::workflow::state::{MetadataKey, MetadataValue, Output, WorkflowState};
use crate::workflow::step::{Step, StepResult};

pub struct TagStep {
    runner: Arc<dyn ProcessRunner>,
}

impl TagStep {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

/// `<registry>/<name>:<tag>` for a local `name:tag` reference
pub fn registry_ref(registry: &str, image_ref: &str) -> String {
    let local = image_ref.rsplit('/').next().unwrap_or(image_ref);
    format!("{}/{}", registry.trim_end_matches('/'), local)
}

#[async_trait]
impl Step for TagStep {
    fn name(&self) -> &str {
        super::TAG
    }

    fn max_retries(&self) -> u32 {
        1
    }

    fn requires(&self) -> &[Output] {
        &[Output::Build]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let source = state
            .build_result
            .as_ref()
            .map(|b| b.image_ref.clone())
            .ok_or_else(|| WorkflowError::invalid_state(self.name(), Output::Build.field_name()))?;

        if state.registry_url.trim().is_empty() {
            return Ok(StepResult::ok("no registry configured, tag skipped"));
        }

        let target = registry_ref(&state.registry_url, &source);
        self.runner
            .run(&CommandSpec::new("docker").args(["tag", source.as_str(), target.as_str()]))
            .await?;
        info!(source = %source, target = %target, "Tagged image");

        state.set_metadata(MetadataKey::TaggedImage, MetadataValue::Text(target.clone()));
        Ok(StepResult::ok(format!("tagged {target}")).with_data("image", target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use crate::steps::testing::built_state;
    use tempfile::TempDir;

    #[test]
    fn test_registry_ref() {
        assert_eq!(registry_ref("localhost:5001/", "web:abc"), "localhost:5001/web:abc");
        assert_eq!(registry_ref("ghcr.io/acme", "old/web:abc"), "ghcr.io/acme/web:abc");
    }

    #[tokio::test]
    async fn test_tags_for_registry() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(MockRunner::new());
        let mut state = built_state(dir.path(), dir.path());
        state.registry_url = "localhost:5001".to_string();

        TagStep::new(runner.clone()).execute(&mut state).await.unwrap();
        assert_eq!(runner.calls("docker tag web:abc12345 localhost:5001/web:abc12345").len(), 1);
        assert_eq!(
            state.deploy_image_ref().as_deref(),
            Some("localhost:5001/web:abc12345")
        );
    }

    #[tokio::test]
    async fn test_skipped_without_registry() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(MockRunner::new());
        let mut state = built_state(dir.path(), dir.path());

        TagStep::new(runner.clone()).execute(&mut state).await.unwrap();
        assert!(runner.calls("docker").is_empty());
        assert_eq!(state.deploy_image_ref().as_deref(), Some("web:abc12345"));
    }
}
