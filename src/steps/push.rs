//! Push the tagged image to the registry.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::WorkflowResult;
use crate::runner::{CommandSpec, ProcessRunner};
use crate::workflow::state::{MetadataKey, MetadataValue, Output, WorkflowState};
use crate::workflow::step::{Step, StepResult};

pub struct PushStep {
    runner: Arc<dyn ProcessRunner>,
}

impl PushStep {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Step for PushStep {
    fn name(&self) -> &str {
        super::PUSH
    }

    fn max_retries(&self) -> u32 {
        2
    }

    fn requires(&self) -> &[Output] {
        &[Output::Build]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let Some(tagged) = state.metadata_text(MetadataKey::TaggedImage).map(str::to_string) else {
            return Ok(StepResult::ok("image not tagged for a registry, push skipped"));
        };

        self.runner
            .run(&CommandSpec::new("docker").args(["push", tagged.as_str()]))
            .await?;
        info!(image = %tagged, "Pushed image");

        state.set_metadata(MetadataKey::PushedImage, MetadataValue::Text(tagged.clone()));
        Ok(StepResult::ok(format!("pushed {tagged}")))
    }
}
