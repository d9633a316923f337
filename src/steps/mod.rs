//! The containerization steps and the default pipeline built from them.

pub mod analyze;
pub mod build;
pub mod cluster;
pub mod deploy;
pub mod dockerfile;
pub mod manifest;
pub mod push;
pub mod scan;
pub mod tag;
pub mod verify;

pub use analyze::AnalyzeStep;
pub use build::BuildStep;
pub use cluster::ClusterStep;
pub use deploy::DeployStep;
pub use dockerfile::DockerfileStep;
pub use manifest::ManifestStep;
pub use push::PushStep;
pub use scan::ScanStep;
pub use tag::TagStep;
pub use verify::VerifyStep;

use std::sync::Arc;
use std::time::Duration;

use crate::api::AiClient;
use crate::config::{Config, LlmConfig};
use crate::k8s::{ClusterService, KindCluster, KubectlCluster, ManifestService, TemplateManifestService};
use crate::runner::{ProcessRunner, SystemRunner};
use crate::verify::{ClusterVerifier, DeploymentVerifier, ManifestFixer, RecoveryLoop};
use crate::workflow::executor::Pipeline;
use crate::workflow::registry::{RegistryError, StepRegistry};

pub const ANALYZE: &str = "analyze";
pub const DOCKERFILE: &str = "dockerfile";
pub const BUILD: &str = "build";
pub const SCAN: &str = "scan";
pub const TAG: &str = "tag";
pub const PUSH: &str = "push";
pub const MANIFEST: &str = "manifest";
pub const CLUSTER: &str = "cluster";
pub const DEPLOY: &str = "deploy";
pub const VERIFY: &str = "verify";

/// Stage order of the full containerize pipeline
pub const DEFAULT_STAGES: [&str; 10] = [
    ANALYZE, DOCKERFILE, BUILD, SCAN, TAG, PUSH, MANIFEST, CLUSTER, DEPLOY, VERIFY,
];

/// Stage to jump back to once a stage's retries are exhausted
pub const DEFAULT_REROUTES: [(&str, &str); 3] =
    [(BUILD, DOCKERFILE), (MANIFEST, BUILD), (DEPLOY, MANIFEST)];

/// Collaborators shared by the steps
#[derive(Clone)]
pub struct StepDeps {
    pub runner: Arc<dyn ProcessRunner>,
    pub ai: Option<Arc<dyn AiClient>>,
    pub manifests: Arc<dyn ManifestService>,
    pub cluster: Arc<dyn ClusterService>,
    pub verifier: Arc<dyn DeploymentVerifier>,
    pub config: Arc<Config>,
}

impl StepDeps {
    /// Wire everything to `runner` with the template and kubectl services
    pub fn new(runner: Arc<dyn ProcessRunner>, config: Arc<Config>) -> Self {
        Self {
            manifests: Arc::new(TemplateManifestService::new()),
            cluster: Arc::new(KubectlCluster::new(runner.clone())),
            verifier: Arc::new(ClusterVerifier::new(
                runner.clone(),
                config.verification.clone(),
            )),
            runner,
            ai: None,
            config,
        }
    }

    /// Real subprocesses, real cluster
    pub fn system(config: Arc<Config>) -> Self {
        Self::new(Arc::new(SystemRunner::new()), config)
    }

    pub fn with_ai(mut self, ai: Option<Arc<dyn AiClient>>) -> Self {
        self.ai = ai;
        self
    }

    fn llm(&self) -> &LlmConfig {
        &self.config.llm
    }

    fn recovery(&self) -> RecoveryLoop {
        let verification = &self.config.verification;
        let mut recovery = RecoveryLoop::new(self.verifier.clone(), verification.recovery_max_attempts)
            .with_settle(Duration::from_millis(verification.fix_settle_ms));
        if let Some(ai) = &self.ai {
            let fixer = ManifestFixer::new(ai.clone(), self.cluster.clone())
                .with_limits(self.llm().max_tokens, self.llm().temperature);
            recovery = recovery.with_ai(ai.clone()).with_fixer(Arc::new(fixer));
        }
        recovery
    }
}

/// Registry holding every built-in step
pub fn default_registry(deps: &StepDeps) -> Result<StepRegistry, RegistryError> {
    let pipeline = &deps.config.pipeline;
    Ok(StepRegistry::builder()
        .register(AnalyzeStep::new(deps.runner.clone(), deps.ai.clone(), deps.llm().clone()))?
        .register(DockerfileStep::new(
            deps.ai.clone(),
            deps.llm().clone(),
            pipeline.draft_dockerfile,
        ))?
        .register(BuildStep::new(deps.runner.clone(), deps.ai.clone(), deps.llm().clone()))?
        .register(ScanStep::new(deps.runner.clone()))?
        .register(TagStep::new(deps.runner.clone()))?
        .register(PushStep::new(deps.runner.clone()))?
        .register(ManifestStep::new(deps.manifests.clone()))?
        .register(ClusterStep::new(
            KindCluster::new(deps.runner.clone(), &pipeline.kind_cluster),
            deps.cluster.clone(),
        ))?
        .register(DeployStep::new(deps.runner.clone(), deps.cluster.clone()))?
        .register(VerifyStep::new(deps.recovery()))?
        .build())
}

/// The full pipeline with configured retry budgets and the default reroutes
pub fn default_pipeline(registry: &StepRegistry, config: &Config) -> Result<Pipeline, RegistryError> {
    let mut pipeline = Pipeline::from_registry(registry, &DEFAULT_STAGES)?;
    for stage in DEFAULT_STAGES {
        pipeline.configure(stage, |entry| {
            entry.max_retries = config.max_retries_for(stage, entry.max_retries);
        });
    }
    for (from, to) in DEFAULT_REROUTES {
        pipeline.set_reroute(from, to)?;
    }
    Ok(pipeline)
}
