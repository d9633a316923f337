//! Bounded deployment recovery.
//!
//! Each failed verification becomes an immutable [`AttemptRecord`]. The loop
//! walks `Attempting -> Diagnosing -> Deciding -> Retrying | Failing` and the
//! attempt bound holds whatever the analyzer recommends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::api::{analyze_error, strip_code_fences, AiClient, CompletionRequest, ErrorAnalysis};
use crate::error::{WorkflowError, WorkflowResult};
use crate::k8s::manifest::check_yaml;
use crate::k8s::ClusterService;
use crate::verify::diagnostics::DeploymentDiagnostics;
use crate::verify::verifier::{DeploymentVerifier, VerificationResult};
use crate::workflow::state::{MetadataKey, MetadataValue, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Attempting,
    Diagnosing,
    Deciding,
    Retrying,
    Failing,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryPhase::Attempting => "attempting",
            RecoveryPhase::Diagnosing => "diagnosing",
            RecoveryPhase::Deciding => "deciding",
            RecoveryPhase::Retrying => "retrying",
            RecoveryPhase::Failing => "failing",
        };
        f.write_str(name)
    }
}

/// One failed verification attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based
    pub attempt: u32,
    pub diagnostics: DeploymentDiagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<ErrorAnalysis>,
    pub fix_applied: bool,
    pub error: String,
}

/// Applies an automatic fix for a failed deployment
#[async_trait]
pub trait DeploymentFixer: Send + Sync {
    /// Returns true when a fix was applied and the deployment should be re-verified
    async fn apply_fix(
        &self,
        state: &mut WorkflowState,
        hypothesis: &ErrorAnalysis,
        diagnostics: &DeploymentDiagnostics,
        history: &[AttemptRecord],
    ) -> WorkflowResult<bool>;
}

const MANIFEST_FIX_SYSTEM: &str = "You are a Kubernetes expert. Return only the corrected \
manifest YAML, without explanations.";

/// Asks the AI client for a corrected Deployment manifest and reapplies it
pub struct ManifestFixer {
    ai: Arc<dyn AiClient>,
    cluster: Arc<dyn ClusterService>,
    max_tokens: u32,
    temperature: f32,
}

impl ManifestFixer {
    pub fn new(ai: Arc<dyn AiClient>, cluster: Arc<dyn ClusterService>) -> Self {
        Self {
            ai,
            cluster,
            max_tokens: 2048,
            temperature: 0.3,
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

fn deployment_manifest(state: &WorkflowState) -> Option<PathBuf> {
    state.k8s_result.as_ref().and_then(|k8s| {
        k8s.manifests
            .iter()
            .find(|p| p.file_name().is_some_and(|n| n == "deployment.yaml"))
            .cloned()
    })
}

#[async_trait]
impl DeploymentFixer for ManifestFixer {
    #[instrument(skip_all, fields(session_id = %state.session_id))]
    async fn apply_fix(
        &self,
        state: &mut WorkflowState,
        hypothesis: &ErrorAnalysis,
        diagnostics: &DeploymentDiagnostics,
        history: &[AttemptRecord],
    ) -> WorkflowResult<bool> {
        let Some(path) = deployment_manifest(state) else {
            return Ok(false);
        };
        let current = tokio::fs::read_to_string(&path).await?;

        let mut prompt = format!(
            "This Kubernetes deployment is failing.\n\nRoot cause: {}\nSuggested fix: {}\n",
            hypothesis.root_cause, hypothesis.fix
        );
        for step in &hypothesis.fix_steps {
            let _ = writeln!(prompt, "- {step}");
        }
        let _ = write!(
            prompt,
            "\nPrevious attempts: {}\n\nDiagnostics:\n{}\nCurrent manifest:\n{}\n\nReturn the corrected manifest.",
            history.len(),
            diagnostics.report(),
            current
        );
        let request = CompletionRequest::new(prompt)
            .with_system(MANIFEST_FIX_SYSTEM)
            .with_limits(self.max_tokens, self.temperature);

        let completion = match self.ai.complete(&request).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not get a manifest fix from {}: {}", self.ai.name(), e);
                return Ok(false);
            }
        };
        state.record_tokens(&completion.usage);

        let fixed = strip_code_fences(&completion.content);
        if fixed.is_empty() || fixed == current.trim() {
            return Ok(false);
        }
        if let Err(e) = check_yaml("deployment.yaml", &fixed) {
            warn!("Discarding suggested manifest: {}", e);
            return Ok(false);
        }
        tokio::fs::write(&path, format!("{fixed}\n")).await?;

        let namespace = state
            .k8s_result
            .as_ref()
            .map(|k| k.namespace.clone())
            .unwrap_or_else(|| state.namespace.clone());
        let outcomes = self.cluster.apply(&[path], &namespace).await?;
        let applied = outcomes.iter().all(|o| o.success);
        if let Some(k8s) = state.k8s_result.as_mut() {
            k8s.applied = outcomes;
        }
        info!(applied, "Applied suggested manifest fix");
        Ok(applied)
    }
}

/// Pattern-based hypothesis used when no analyzer is available
pub fn fallback_hypothesis(diagnostics: &DeploymentDiagnostics) -> ErrorAnalysis {
    let states: Vec<&str> = diagnostics
        .pod_statuses
        .iter()
        .flat_map(|p| p.container_states.iter().map(String::as_str))
        .collect();
    let has_state = |needle: &str| states.iter().any(|s| s.contains(needle));

    let (root_cause, fix) = if has_state("ImagePullBackOff") || has_state("ErrImagePull") {
        (
            "The cluster cannot pull the container image",
            "Check the image reference and make sure the image was pushed or loaded into the cluster",
        )
    } else if has_state("CrashLoopBackOff") {
        (
            "The container keeps crashing after start",
            "Inspect the container logs for startup errors and missing configuration",
        )
    } else if diagnostics.pod_statuses.iter().any(|p| p.phase == "Pending") {
        (
            "Pods are pending scheduling",
            "Check node capacity and the resource requests of the deployment",
        )
    } else if diagnostics.pods_total == 0 {
        (
            "No pods were found for the deployment",
            "Check that the deployment exists and its selector matches the pod labels",
        )
    } else {
        (
            "The deployment is not healthy",
            "Review the diagnostics report",
        )
    };

    ErrorAnalysis {
        root_cause: root_cause.to_string(),
        fix: fix.to_string(),
        fix_steps: vec![],
        can_auto_fix: false,
    }
}

/// Pods still being scheduled or started may become ready without intervention
pub fn is_transient(diagnostics: &DeploymentDiagnostics) -> bool {
    diagnostics.errors.is_empty()
        && diagnostics.pod_statuses.iter().any(|p| {
            p.phase == "Pending"
                || p.container_states
                    .iter()
                    .any(|s| s.contains("ContainerCreating") || s.contains("PodInitializing"))
        })
}

fn attempt_report(attempt: u32, result: &VerificationResult) -> String {
    let mut report = format!("=== Attempt {attempt} ===\n{}\n", result.failure_reason());
    report.push_str(&result.diagnostics.report());
    for message in &result.messages {
        let _ = writeln!(report, "{message}");
    }
    report
}

/// Drives verification with diagnosis and optional automatic fixes
pub struct RecoveryLoop {
    verifier: Arc<dyn DeploymentVerifier>,
    ai: Option<Arc<dyn AiClient>>,
    fixer: Option<Arc<dyn DeploymentFixer>>,
    max_attempts: u32,
    settle: Duration,
}

impl RecoveryLoop {
    pub fn new(verifier: Arc<dyn DeploymentVerifier>, max_attempts: u32) -> Self {
        Self {
            verifier,
            ai: None,
            fixer: None,
            max_attempts: max_attempts.max(1),
            settle: Duration::from_millis(200),
        }
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiClient>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_fixer(mut self, fixer: Arc<dyn DeploymentFixer>) -> Self {
        self.fixer = Some(fixer);
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    async fn hypothesize(
        &self,
        state: &mut WorkflowState,
        result: &VerificationResult,
        error_context: &str,
    ) -> ErrorAnalysis {
        if let Some(ai) = &self.ai {
            match analyze_error(ai.as_ref(), &result.failure_reason(), error_context).await {
                Ok((analysis, usage)) => {
                    state.record_tokens(&usage);
                    return analysis;
                }
                Err(e) => warn!("Error analysis unavailable, using fallback: {}", e),
            }
        }
        fallback_hypothesis(&result.diagnostics)
    }

    /// Verify the deployment recorded in `state`, retrying within the bound.
    ///
    /// Earlier stage outputs are reused as-is; only the deployment itself is
    /// touched by fixes.
    #[instrument(skip_all, fields(session_id = %state.session_id, max_attempts = self.max_attempts))]
    pub async fn run(&self, state: &mut WorkflowState) -> WorkflowResult<VerificationResult> {
        let (namespace, app) = match &state.k8s_result {
            Some(k8s) => (k8s.namespace.clone(), k8s.service_name.clone()),
            None => return Err(WorkflowError::invalid_state("verify", "k8s_result")),
        };

        let mut records: Vec<AttemptRecord> = Vec::new();
        let mut error_context = String::new();
        let mut phase = RecoveryPhase::Attempting;
        let mut attempt = 0;
        let mut latest = VerificationResult::default();
        let mut hypothesis = ErrorAnalysis::default();

        loop {
            match phase {
                RecoveryPhase::Attempting => {
                    attempt += 1;
                    latest = self.verifier.verify(&namespace, &app).await;
                    self.record(state, &latest, records.len());
                    if latest.deployment_ok {
                        info!(attempt, "Deployment verified");
                        if let Some(k8s) = state.k8s_result.as_mut() {
                            k8s.endpoint = latest.access_url.clone();
                        }
                        return Ok(latest);
                    }
                    phase = RecoveryPhase::Diagnosing;
                }
                RecoveryPhase::Diagnosing => {
                    error_context.push_str(&attempt_report(attempt, &latest));
                    hypothesis = self.hypothesize(state, &latest, &error_context).await;
                    phase = RecoveryPhase::Deciding;
                }
                RecoveryPhase::Deciding => {
                    let mut fix_applied = false;
                    let next = if attempt >= self.max_attempts {
                        RecoveryPhase::Failing
                    } else {
                        if hypothesis.can_auto_fix {
                            if let Some(fixer) = &self.fixer {
                                fix_applied = match fixer
                                    .apply_fix(state, &hypothesis, &latest.diagnostics, &records)
                                    .await
                                {
                                    Ok(applied) => applied,
                                    Err(e) => {
                                        warn!(attempt, "Automatic fix failed: {}", e);
                                        false
                                    }
                                };
                            }
                        }
                        if fix_applied || is_transient(&latest.diagnostics) {
                            RecoveryPhase::Retrying
                        } else {
                            RecoveryPhase::Failing
                        }
                    };

                    records.push(AttemptRecord {
                        attempt,
                        diagnostics: latest.diagnostics.clone(),
                        hypothesis: Some(hypothesis.clone()),
                        fix_applied,
                        error: latest.failure_reason(),
                    });
                    self.record(state, &latest, records.len());
                    warn!(
                        attempt,
                        fix_applied,
                        next = %next,
                        root_cause = %hypothesis.root_cause,
                        "Deployment verification failed"
                    );
                    phase = next;
                }
                RecoveryPhase::Retrying => {
                    tokio::time::sleep(self.settle).await;
                    phase = RecoveryPhase::Attempting;
                }
                RecoveryPhase::Failing => {
                    let last_error = latest.failure_reason();
                    return Err(WorkflowError::DeploymentFailed {
                        attempts: records,
                        last_error,
                    });
                }
            }
        }
    }

    fn record(&self, state: &mut WorkflowState, result: &VerificationResult, attempts: usize) {
        let diagnostics =
            serde_json::to_value(&result.diagnostics).unwrap_or(serde_json::Value::Null);
        if let Some(k8s) = state.k8s_result.as_mut() {
            k8s.metadata
                .insert(MetadataKey::Diagnostics, MetadataValue::Json(diagnostics.clone()));
        }
        state.set_metadata(MetadataKey::Diagnostics, MetadataValue::Json(diagnostics));
        state.set_metadata(
            MetadataKey::Verification,
            MetadataValue::Json(serde_json::to_value(result).unwrap_or(serde_json::Value::Null)),
        );
        state.set_metadata(
            MetadataKey::RecoveryAttempts,
            MetadataValue::Count(attempts as u64),
        );
    }
}
