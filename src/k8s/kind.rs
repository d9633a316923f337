//! Local kind cluster management.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{WorkflowError, WorkflowResult};
use crate::runner::{CommandSpec, ProcessRunner};

pub struct KindCluster {
    runner: Arc<dyn ProcessRunner>,
    name: String,
}

impl KindCluster {
    pub fn new(runner: Arc<dyn ProcessRunner>, name: impl Into<String>) -> Self {
        Self {
            runner,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self) -> bool {
        self.runner.is_available("kind")
    }

    /// Create the cluster unless it already exists. Returns true if created.
    #[instrument(skip(self), fields(cluster = %self.name))]
    pub async fn ensure_cluster(&self) -> WorkflowResult<bool> {
        if !self.is_available() {
            return Err(WorkflowError::validation("kind", "not installed"));
        }
        let clusters = self
            .runner
            .run(&CommandSpec::new("kind").args(["get", "clusters"]))
            .await?;
        if clusters.stdout.lines().any(|l| l.trim() == self.name) {
            return Ok(false);
        }

        self.runner
            .run(&CommandSpec::new("kind").args(["create", "cluster", "--name", self.name.as_str()]))
            .await?;
        info!("Created kind cluster");
        Ok(true)
    }

    /// Make a locally built image available to the cluster nodes
    #[instrument(skip(self), fields(cluster = %self.name))]
    pub async fn load_image(&self, image_ref: &str) -> WorkflowResult<()> {
        self.runner
            .run(&CommandSpec::new("kind").args([
                "load",
                "docker-image",
                image_ref,
                "--name",
                self.name.as_str(),
            ]))
            .await?;
        info!(image_ref, "Loaded image into kind cluster");
        Ok(())
    }
}
