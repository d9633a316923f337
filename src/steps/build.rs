//! `docker build`, with AI-suggested Dockerfile fixes between attempts.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::api::{strip_code_fences, AiClient, CompletionRequest};
use crate::config::LlmConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::runner::{CommandError, CommandSpec, ProcessRunner};
use crate::workflow::state::{
    BuildResult, DockerfileResult, MetadataKey, MetadataValue, Output, WorkflowState,
};
use crate::workflow::step::{Step, StepResult};

/// Build output kept in prompts and errors
const OUTPUT_TAIL: usize = 4000;

pub struct BuildStep {
    runner: Arc<dyn ProcessRunner>,
    ai: Option<Arc<dyn AiClient>>,
    llm: LlmConfig,
}

/// Local image tag for a session
pub fn image_tag(session_id: &str) -> String {
    session_id.chars().take(12).collect::<String>().to_ascii_lowercase()
}

fn tail(output: &str) -> &str {
    let start = output.len().saturating_sub(OUTPUT_TAIL);
    // Stay on a char boundary
    let start = (start..output.len())
        .find(|i| output.is_char_boundary(*i))
        .unwrap_or(output.len());
    &output[start..]
}

impl BuildStep {
    pub fn new(runner: Arc<dyn ProcessRunner>, ai: Option<Arc<dyn AiClient>>, llm: LlmConfig) -> Self {
        Self { runner, ai, llm }
    }

    /// Ask for a corrected Dockerfile and write it in place. Returns true if one was written.
    async fn suggest_fix(&self, state: &mut WorkflowState, build_output: &str) -> bool {
        let Some(ai) = &self.ai else {
            return false;
        };
        let Some(dockerfile) = state.dockerfile_result.clone() else {
            return false;
        };

        let prompt = format!(
            "This Dockerfile failed to build.\n\nDockerfile:\n{}\n\nBuild output:\n{}\n\n\
             Return only the corrected Dockerfile.",
            dockerfile.content,
            tail(build_output)
        );
        let request = CompletionRequest::new(prompt).with_limits(self.llm.max_tokens, self.llm.temperature);
        let completion = match ai.complete(&request).await {
            Ok(c) => c,
            Err(e) => {
                warn!("No Dockerfile fix available: {}", e);
                return false;
            }
        };
        state.record_tokens(&completion.usage);

        let fixed = strip_code_fences(&completion.content);
        let (base_image, exposed_port) = DockerfileResult::inspect(&fixed);
        if base_image.is_empty() || fixed == dockerfile.content.trim() {
            return false;
        }

        // Never overwrite the repository's own Dockerfile
        let path = if dockerfile.generated {
            dockerfile.path.clone()
        } else {
            state.workspace_dir.join("Dockerfile")
        };
        if let Err(e) = std::fs::create_dir_all(&state.workspace_dir)
            .and_then(|()| std::fs::write(&path, format!("{fixed}\n")))
        {
            warn!("Could not write fixed Dockerfile: {}", e);
            return false;
        }

        let fixes = state
            .metadata
            .get(&MetadataKey::DockerfileFixes)
            .and_then(|v| v.as_count())
            .unwrap_or(0);
        state.set_metadata(MetadataKey::DockerfileFixes, MetadataValue::Count(fixes + 1));
        state.dockerfile_result = Some(DockerfileResult {
            content: fixed,
            path,
            base_image,
            exposed_port,
            generated: true,
        });
        info!("Applied AI Dockerfile fix");
        true
    }

    async fn inspect_image(&self, image_ref: &str) -> (String, Option<u64>) {
        let spec = CommandSpec::new("docker").args([
            "image",
            "inspect",
            image_ref,
            "--format",
            "{{.Id}} {{.Size}}",
        ]);
        match self.runner.run(&spec).await {
            Ok(output) => {
                let mut parts = output.stdout.split_whitespace();
                let id = parts.next().unwrap_or_default().to_string();
                let size = parts.next().and_then(|s| s.parse().ok());
                (id, size)
            }
            Err(e) => {
                warn!("Could not inspect built image: {}", e);
                (String::new(), None)
            }
        }
    }
}

#[async_trait]
impl Step for BuildStep {
    fn name(&self) -> &str {
        super::BUILD
    }

    fn max_retries(&self) -> u32 {
        2
    }

    fn requires(&self) -> &[Output] {
        &[Output::Analyze, Output::Dockerfile]
    }

    #[instrument(skip_all, fields(session_id = %state.session_id))]
    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let (dockerfile, context) = match (&state.dockerfile_result, &state.analyze_result) {
            (Some(d), Some(a)) => (d.path.clone(), a.repo_path.clone()),
            _ => return Err(WorkflowError::invalid_state(self.name(), "dockerfile_result")),
        };
        if state.image_name.is_empty() {
            return Err(WorkflowError::validation("image_name", "no image name set"));
        }
        let image_ref = format!("{}:{}", state.image_name, image_tag(&state.session_id));

        let spec = CommandSpec::new("docker")
            .arg("build")
            .arg("-t")
            .arg(&image_ref)
            .arg("-f")
            .arg(dockerfile.to_string_lossy())
            .arg(context.to_string_lossy());

        let started = Instant::now();
        match self.runner.run(&spec).await {
            Ok(_) => {}
            Err(CommandError::NotInstalled(program)) => {
                return Err(WorkflowError::validation(
                    program,
                    "not installed; install Docker and make sure it is on PATH",
                ));
            }
            Err(e) => {
                let output = e.output().unwrap_or_default().to_string();
                let fixed = self.suggest_fix(state, &output).await;
                let message = if fixed {
                    "build failed, Dockerfile fix applied for the next attempt"
                } else {
                    "build failed"
                };
                return Err(WorkflowError::external_with_output(
                    "docker build",
                    message,
                    tail(&output),
                ));
            }
        }
        let build_time_ms = started.elapsed().as_millis() as u64;

        let (image_id, image_size) = self.inspect_image(&image_ref).await;
        info!(image_ref = %image_ref, build_time_ms, "Built image");
        state.build_result = Some(BuildResult {
            image_id,
            image_ref: image_ref.clone(),
            image_size,
            build_time_ms,
            built_at: Utc::now(),
        });
        Ok(StepResult::ok(format!("built {image_ref}")).with_data("image_ref", image_ref))
    }
}
