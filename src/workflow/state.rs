//! Workflow state threaded through every step of one pipeline execution.
//!
//! Each stage output is written by exactly one step. Later steps declare the
//! outputs they read through [`Output`] and the executor refuses to run them
//! until those outputs exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stage outputs a step can depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    Analyze,
    Dockerfile,
    Build,
    Scan,
    K8s,
}

impl Output {
    /// Name of the state field holding this output
    pub fn field_name(self) -> &'static str {
        match self {
            Output::Analyze => "analyze_result",
            Output::Dockerfile => "dockerfile_result",
            Output::Build => "build_result",
            Output::Scan => "scan_report",
            Output::K8s => "k8s_result",
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResult {
    pub language: String,
    pub framework: Option<String>,
    pub port: Option<u16>,
    pub dependencies: Vec<String>,
    pub repo_path: PathBuf,
    /// Files that drove the detection (e.g. `Cargo.toml`)
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerfileResult {
    pub content: String,
    pub path: PathBuf,
    pub base_image: String,
    pub exposed_port: Option<u16>,
    /// False when the repository's own Dockerfile was used
    pub generated: bool,
}

impl DockerfileResult {
    /// First `FROM` image and first `EXPOSE` port of a Dockerfile
    pub fn inspect(content: &str) -> (String, Option<u16>) {
        let mut base_image = String::new();
        let mut port = None;
        for line in content.lines().map(str::trim) {
            let mut parts = line.split_whitespace();
            match parts.next().map(str::to_ascii_uppercase).as_deref() {
                Some("FROM") if base_image.is_empty() => {
                    base_image = parts.next().unwrap_or_default().to_string();
                }
                Some("EXPOSE") if port.is_none() => {
                    port = parts
                        .next()
                        .and_then(|p| p.split('/').next())
                        .and_then(|p| p.parse().ok());
                }
                _ => {}
            }
        }
        (base_image, port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub image_id: String,
    pub image_ref: String,
    pub image_size: Option<u64>,
    pub build_time_ms: u64,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub unknown: u32,
}

impl VulnerabilityCounts {
    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low + self.unknown
    }

    /// Count one finding by its scanner severity label
    pub fn record(&mut self, severity: &str) {
        match severity.to_ascii_uppercase().as_str() {
            "CRITICAL" => self.critical += 1,
            "HIGH" => self.high += 1,
            "MEDIUM" => self.medium += 1,
            "LOW" => self.low += 1,
            _ => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Clean,
    /// Findings present but below the blocking threshold
    Warnings,
    /// Critical findings present
    Blocked,
    /// No scanner available
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanner: String,
    pub vulnerability_counts: VulnerabilityCounts,
    pub status: ScanStatus,
}

/// Outcome of applying one Kubernetes resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    /// e.g. `deployment.apps/web`
    pub resource: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct K8sResult {
    pub manifests: Vec<PathBuf>,
    pub namespace: String,
    pub service_name: String,
    pub endpoint: Option<String>,
    /// Filled in by the deploy step
    #[serde(default)]
    pub applied: Vec<ResourceOutcome>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Closed set of metadata keys a step may record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKey {
    /// Registry-qualified reference produced by the tag step
    TaggedImage,
    /// Reference that was pushed to the registry
    PushedImage,
    ClusterName,
    /// Where the analysis came from (`heuristic` or `ai`)
    AnalysisSource,
    /// Number of AI-suggested Dockerfile fixes applied during builds
    DockerfileFixes,
    ScanSkippedReason,
    /// Latest deployment diagnostics snapshot
    Diagnostics,
    /// Final verification outcome
    Verification,
    /// Every recovery attempt, oldest first
    RecoveryAttempts,
    ReportPath,
}

/// Small tagged union for metadata values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Text(String),
    Count(u64),
    Flag(bool),
    List(Vec<String>),
    /// Structured snapshot (diagnostics, verification results)
    Json(serde_json::Value),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            MetadataValue::Count(n) => Some(*n),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<MetadataKey, MetadataValue>;

/// One step invocation recorded by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub step: String,
    /// 1-based attempt number within the current visit of the step
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
}

impl StageExecution {
    pub fn start(step: impl Into<String>, attempt: u32) -> Self {
        Self {
            step: step.into(),
            attempt,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            success: false,
            error: None,
            tokens_used: 0,
        }
    }

    pub fn finish(&mut self, success: bool, error: Option<String>, tokens_used: u64) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.success = success;
        self.error = error;
        self.tokens_used = tokens_used;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    /// Local path or git URL of the repository being containerized
    pub repo_identifier: String,
    pub image_name: String,
    pub registry_url: String,
    pub namespace: String,
    /// Session-scoped scratch directory
    pub workspace_dir: PathBuf,

    pub analyze_result: Option<AnalyzeResult>,
    pub dockerfile_result: Option<DockerfileResult>,
    pub build_result: Option<BuildResult>,
    pub scan_report: Option<ScanReport>,
    pub k8s_result: Option<K8sResult>,

    /// How many times the pipeline has jumped back to an earlier stage
    pub iteration_count: u32,
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub metadata: Metadata,
    /// Free-text hint forwarded to the AI client
    #[serde(default)]
    pub extra_context: Option<String>,
    #[serde(default)]
    pub stage_history: Vec<StageExecution>,
}

impl WorkflowState {
    pub fn new(session_id: impl Into<String>, repo_identifier: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            repo_identifier: repo_identifier.into(),
            namespace: "default".to_string(),
            ..Default::default()
        }
    }

    pub fn has_output(&self, output: Output) -> bool {
        match output {
            Output::Analyze => self.analyze_result.is_some(),
            Output::Dockerfile => self.dockerfile_result.is_some(),
            Output::Build => self.build_result.is_some(),
            Output::Scan => self.scan_report.is_some(),
            Output::K8s => self.k8s_result.is_some(),
        }
    }

    /// First required output that has not been produced yet
    pub fn missing_output(&self, required: &[Output]) -> Option<Output> {
        required.iter().copied().find(|o| !self.has_output(*o))
    }

    pub fn set_metadata(&mut self, key: MetadataKey, value: MetadataValue) {
        self.metadata.insert(key, value);
    }

    pub fn metadata_text(&self, key: MetadataKey) -> Option<&str> {
        self.metadata.get(&key).and_then(MetadataValue::as_text)
    }

    /// Image reference deployments should use: the tagged reference when the
    /// tag step ran, otherwise the locally built one
    pub fn deploy_image_ref(&self) -> Option<String> {
        self.metadata_text(MetadataKey::TaggedImage)
            .map(str::to_string)
            .or_else(|| self.build_result.as_ref().map(|b| b.image_ref.clone()))
    }

    /// Application name used for Kubernetes resources
    pub fn app_name(&self) -> String {
        let raw = self
            .image_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.image_name)
            .split(':')
            .next()
            .unwrap_or_default();
        let name: String = raw
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        // DNS labels cap at 63 chars and must start and end alphanumeric
        let name: String = name.trim_matches('-').chars().take(63).collect();
        let name = name.trim_end_matches('-');
        if name.is_empty() {
            "app".to_string()
        } else {
            name.to_string()
        }
    }

    pub fn record_tokens(&mut self, usage: &TokenUsage) {
        self.token_usage.add(usage);
    }

    /// History entries for one step, in execution order
    pub fn history_for(&self, step: &str) -> Vec<&StageExecution> {
        self.stage_history.iter().filter(|e| e.step == step).collect()
    }
}
