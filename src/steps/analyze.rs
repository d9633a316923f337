//! Repository analysis: language, framework, port and dependencies.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{AiClient, CompletionRequest};
use crate::config::LlmConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::runner::{CommandSpec, ProcessRunner};
use crate::workflow::state::{AnalyzeResult, DockerfileResult, MetadataKey, MetadataValue, WorkflowState};
use crate::workflow::step::{Step, StepResult};

static PORT_IN_SOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:listen|port\s*[:=]|PORT\s*\|\|)\s*\(?\s*(\d{4,5})")
        .expect("port regex is valid")
});

pub struct AnalyzeStep {
    runner: Arc<dyn ProcessRunner>,
    ai: Option<Arc<dyn AiClient>>,
    llm: LlmConfig,
}

impl AnalyzeStep {
    pub fn new(runner: Arc<dyn ProcessRunner>, ai: Option<Arc<dyn AiClient>>, llm: LlmConfig) -> Self {
        Self { runner, ai, llm }
    }

    /// Local checkout for the repository, cloning remote URLs into the workspace
    async fn checkout(&self, state: &WorkflowState) -> WorkflowResult<PathBuf> {
        let identifier = state.repo_identifier.trim();
        if !is_remote(identifier) {
            let path = PathBuf::from(identifier);
            if !path.is_dir() {
                return Err(WorkflowError::validation(
                    "repo_identifier",
                    format!("{identifier} is not a directory"),
                ));
            }
            return Ok(path);
        }

        let target = state.workspace_dir.join("repo");
        if target.join(".git").is_dir() {
            return Ok(target);
        }
        self.runner
            .run(&CommandSpec::new("git").args([
                "clone",
                "--depth",
                "1",
                identifier,
                target.to_string_lossy().as_ref(),
            ]))
            .await?;
        Ok(target)
    }

    /// Let the AI client confirm or correct the heuristic result
    async fn refine(&self, state: &mut WorkflowState, result: &mut AnalyzeResult) -> bool {
        let Some(ai) = &self.ai else {
            return false;
        };

        let mut prompt = format!(
            "A repository was detected as language={} framework={} port={}.\n\
             Files: {}\nDependencies: {}\n",
            result.language,
            result.framework.as_deref().unwrap_or("none"),
            result.port.map_or_else(|| "unknown".to_string(), |p| p.to_string()),
            result.evidence.join(", "),
            result.dependencies.join(", "),
        );
        if let Some(extra) = &state.extra_context {
            prompt.push_str(&format!("Additional context: {extra}\n"));
        }
        prompt.push_str(
            "Reply with a JSON object with the fields language, framework and port, correcting anything that is wrong.",
        );

        let request = CompletionRequest::new(prompt).with_limits(self.llm.max_tokens, self.llm.temperature);
        let completion = match ai.complete(&request).await {
            Ok(c) => c,
            Err(e) => {
                warn!("AI analysis unavailable, keeping heuristic result: {}", e);
                return false;
            }
        };
        state.record_tokens(&completion.usage);

        #[derive(Deserialize)]
        struct Refined {
            language: Option<String>,
            framework: Option<String>,
            port: Option<u16>,
        }
        let content = &completion.content;
        let json = match (content.find('{'), content.rfind('}')) {
            (Some(start), Some(end)) if end > start => &content[start..=end],
            _ => return false,
        };
        let Ok(refined) = serde_json::from_str::<Refined>(json) else {
            debug!("Ignoring unparseable analysis refinement");
            return false;
        };

        if let Some(language) = refined.language.filter(|l| !l.is_empty()) {
            result.language = language.to_ascii_lowercase();
        }
        if refined.framework.is_some() {
            result.framework = refined.framework;
        }
        if refined.port.is_some() {
            result.port = refined.port;
        }
        true
    }
}

fn is_remote(identifier: &str) -> bool {
    identifier.starts_with("https://")
        || identifier.starts_with("http://")
        || identifier.starts_with("git@")
        || identifier.starts_with("ssh://")
}

/// Image name derived from the last path segment of the repository
pub fn image_name_for(identifier: &str) -> String {
    let last = identifier
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    let name: String = last
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    let name = name.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if name.is_empty() {
        "app".to_string()
    } else {
        name.to_string()
    }
}

fn read(repo: &Path, file: &str) -> Option<String> {
    std::fs::read_to_string(repo.join(file)).ok()
}

fn find_framework(deps: &[String], known: &[(&str, &str)]) -> Option<String> {
    known
        .iter()
        .find(|(dep, _)| deps.iter().any(|d| d == dep))
        .map(|(_, framework)| (*framework).to_string())
}

#[derive(Deserialize, Default)]
struct PackageJson {
    #[serde(default)]
    dependencies: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    scripts: serde_json::Map<String, serde_json::Value>,
}

/// Detect the stack from well-known build files
pub fn detect(repo: &Path) -> AnalyzeResult {
    let mut result = AnalyzeResult {
        language: "unknown".to_string(),
        framework: None,
        port: None,
        dependencies: vec![],
        repo_path: repo.to_path_buf(),
        evidence: vec![],
    };

    if let Some(content) = read(repo, "go.mod") {
        result.language = "go".to_string();
        result.evidence.push("go.mod".to_string());
        result.dependencies = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with("module") && !l.starts_with("go ") && l.contains('/'))
            .filter_map(|l| l.trim_start_matches("require").split_whitespace().next())
            .map(str::to_string)
            .collect();
        result.framework = find_framework(
            &result.dependencies,
            &[
                ("github.com/gin-gonic/gin", "gin"),
                ("github.com/labstack/echo/v4", "echo"),
                ("github.com/gofiber/fiber/v2", "fiber"),
            ],
        );
        result.port = Some(8080);
    } else if let Some(content) = read(repo, "Cargo.toml") {
        result.language = "rust".to_string();
        result.evidence.push("Cargo.toml".to_string());
        if let Ok(manifest) = content.parse::<toml::Table>() {
            if let Some(deps) = manifest.get("dependencies").and_then(|d| d.as_table()) {
                result.dependencies = deps.keys().cloned().collect();
            }
        }
        result.framework = find_framework(
            &result.dependencies,
            &[("axum", "axum"), ("actix-web", "actix-web"), ("rocket", "rocket"), ("warp", "warp")],
        );
        result.port = Some(8080);
    } else if let Some(content) = read(repo, "package.json") {
        result.language = "node".to_string();
        result.evidence.push("package.json".to_string());
        let package: PackageJson = serde_json::from_str(&content).unwrap_or_default();
        result.dependencies = package.dependencies.keys().cloned().collect();
        result.framework = find_framework(
            &result.dependencies,
            &[("next", "next"), ("@nestjs/core", "nestjs"), ("express", "express"), ("fastify", "fastify")],
        );
        if package.scripts.contains_key("start") {
            result.evidence.push("package.json#start".to_string());
        }
        result.port = Some(3000);
    } else if let Some(content) = read(repo, "requirements.txt")
        .or_else(|| read(repo, "pyproject.toml"))
    {
        result.language = "python".to_string();
        result.evidence.push(
            if repo.join("requirements.txt").exists() { "requirements.txt" } else { "pyproject.toml" }
                .to_string(),
        );
        result.dependencies = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('['))
            .filter_map(|l| {
                l.split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
                    .next()
            })
            .filter(|d| !d.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        result.framework = find_framework(
            &result.dependencies,
            &[("django", "django"), ("fastapi", "fastapi"), ("flask", "flask")],
        );
        result.port = Some(match result.framework.as_deref() {
            Some("flask") => 5000,
            _ => 8000,
        });
    } else if repo.join("pom.xml").exists() || repo.join("build.gradle").exists() {
        result.language = "java".to_string();
        let file = if repo.join("pom.xml").exists() { "pom.xml" } else { "build.gradle" };
        result.evidence.push(file.to_string());
        if read(repo, file).is_some_and(|c| c.contains("spring-boot")) {
            result.framework = Some("spring-boot".to_string());
        }
        result.port = Some(8080);
    }

    // An explicit EXPOSE or a literal port in the entry point beats the defaults
    if let Some((_, Some(port))) = read(repo, "Dockerfile").map(|c| DockerfileResult::inspect(&c)) {
        result.port = Some(port);
    } else if let Some(port) = ["main.go", "src/main.rs", "index.js", "server.js", "app.py", "main.py"]
        .iter()
        .filter_map(|f| read(repo, f))
        .find_map(|c| PORT_IN_SOURCE.captures(&c).and_then(|m| m[1].parse::<u16>().ok()))
    {
        result.port = Some(port);
    }

    result
}

#[async_trait]
impl Step for AnalyzeStep {
    fn name(&self) -> &str {
        super::ANALYZE
    }

    fn max_retries(&self) -> u32 {
        1
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let repo = self.checkout(state).await?;
        let mut result = detect(&repo);
        info!(language = %result.language, framework = ?result.framework, port = ?result.port, "Detected stack");

        let source = if self.refine(state, &mut result).await { "ai" } else { "heuristic" };
        state.set_metadata(MetadataKey::AnalysisSource, MetadataValue::Text(source.to_string()));

        if state.image_name.is_empty() {
            state.image_name = image_name_for(&state.repo_identifier);
        }

        let message = format!(
            "{} project{} on port {}",
            result.language,
            result.framework.as_ref().map(|f| format!(" ({f})")).unwrap_or_default(),
            result.port.map_or_else(|| "unknown".to_string(), |p| p.to_string())
        );
        let language = result.language.clone();
        state.analyze_result = Some(result);
        Ok(StepResult::ok(message)
            .with_data("language", language)
            .with_data("source", source))
    }
}
