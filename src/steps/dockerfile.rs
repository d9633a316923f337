//! Dockerfile selection or generation.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{strip_code_fences, AiClient, CompletionRequest};
use crate::config::LlmConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::templates::{self, DockerfileTemplate};
use crate::workflow::state::{AnalyzeResult, DockerfileResult, Output, WorkflowState};
use crate::workflow::step::{Step, StepResult};

const DEFAULT_PORT: u16 = 8080;

pub struct DockerfileStep {
    ai: Option<Arc<dyn AiClient>>,
    llm: LlmConfig,
    /// Render a fresh Dockerfile even when the repository has one
    draft: bool,
}

impl DockerfileStep {
    pub fn new(ai: Option<Arc<dyn AiClient>>, llm: LlmConfig, draft: bool) -> Self {
        Self { ai, llm, draft }
    }

    async fn refine(&self, state: &mut WorkflowState, draft: &str, analysis: &AnalyzeResult) -> Option<String> {
        let ai = self.ai.as_ref()?;
        let prompt = format!(
            "Improve this Dockerfile for a {} {} application listening on port {}. \
             Keep it minimal, use a small runtime image and a non-root user where possible.\n\
             Dependencies: {}\n{}\nDockerfile:\n{}\n\nReturn only the Dockerfile.",
            analysis.language,
            analysis.framework.as_deref().unwrap_or(""),
            analysis.port.unwrap_or(DEFAULT_PORT),
            analysis.dependencies.join(", "),
            state.extra_context.as_deref().unwrap_or_default(),
            draft
        );
        let request = CompletionRequest::new(prompt).with_limits(self.llm.max_tokens, self.llm.temperature);
        match ai.complete(&request).await {
            Ok(completion) => {
                state.record_tokens(&completion.usage);
                let refined = strip_code_fences(&completion.content);
                let (base_image, _) = DockerfileResult::inspect(&refined);
                if base_image.is_empty() {
                    warn!("Ignoring AI Dockerfile without a FROM instruction");
                    None
                } else {
                    Some(refined)
                }
            }
            Err(e) => {
                warn!("AI Dockerfile refinement unavailable: {}", e);
                None
            }
        }
    }
}

/// Render the language template for an analysis result
pub fn render_template(analysis: &AnalyzeResult) -> WorkflowResult<String> {
    let template = DockerfileTemplate::for_language(&analysis.language);
    let command = match analysis.framework.as_deref() {
        Some("django") => r#"["gunicorn", "--bind", "0.0.0.0:8000", "wsgi:application"]"#,
        Some("fastapi") => r#"["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]"#,
        _ => r#"["python", "app.py"]"#,
    };
    let binary = package_name(&analysis.repo_path).unwrap_or_else(|| "app".to_string());
    templates::render(
        &analysis.language,
        template.source(),
        &json!({
            "version": template.default_version(),
            "port": analysis.port.unwrap_or(DEFAULT_PORT),
            "command": command,
            "binary": binary,
        }),
    )
}

fn package_name(repo: &Path) -> Option<String> {
    let manifest = std::fs::read_to_string(repo.join("Cargo.toml")).ok()?;
    let table = manifest.parse::<toml::Table>().ok()?;
    table
        .get("package")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl Step for DockerfileStep {
    fn name(&self) -> &str {
        super::DOCKERFILE
    }

    fn max_retries(&self) -> u32 {
        1
    }

    fn requires(&self) -> &[Output] {
        &[Output::Analyze]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let analysis = state
            .analyze_result
            .clone()
            .ok_or_else(|| WorkflowError::invalid_state(self.name(), Output::Analyze.field_name()))?;

        let existing = analysis.repo_path.join("Dockerfile");
        if existing.is_file() && !self.draft {
            let content = std::fs::read_to_string(&existing)?;
            let (base_image, exposed_port) = DockerfileResult::inspect(&content);
            info!(path = %existing.display(), "Using repository Dockerfile");
            state.dockerfile_result = Some(DockerfileResult {
                content,
                path: existing,
                base_image,
                exposed_port,
                generated: false,
            });
            return Ok(StepResult::ok("using existing Dockerfile"));
        }

        let draft = render_template(&analysis)?;
        let content = match self.refine(state, &draft, &analysis).await {
            Some(refined) => refined,
            None => draft,
        };

        std::fs::create_dir_all(&state.workspace_dir)?;
        let path = state.workspace_dir.join("Dockerfile");
        std::fs::write(&path, &content)?;
        let (base_image, exposed_port) = DockerfileResult::inspect(&content);
        info!(path = %path.display(), base_image = %base_image, "Generated Dockerfile");

        let message = format!("generated Dockerfile from {base_image}");
        state.dockerfile_result = Some(DockerfileResult {
            content,
            path,
            base_image,
            exposed_port,
            generated: true,
        });
        Ok(StepResult::ok(message))
    }
}
