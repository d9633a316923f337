//! Data Transfer Objects for the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

// Note: ToSchema is derived on all DTOs for OpenAPI documentation generation

use crate::session::model::{JobInfo, Session, SessionSummary, StoreStats};
use crate::workflow::state::StageExecution;

// =============================================================================
// Health DTOs
// =============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

// =============================================================================
// Session DTOs
// =============================================================================

/// Listing view of a session
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionSummaryResponse {
    pub session_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub disk_usage: u64,
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub outstanding_jobs: usize,
    pub stages_completed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub expired: bool,
    pub quota_exceeded: bool,
}

impl From<SessionSummary> for SessionSummaryResponse {
    fn from(s: SessionSummary) -> Self {
        Self {
            session_id: s.session_id,
            status: s.status.to_string(),
            created_at: s.created_at,
            last_accessed: s.last_accessed,
            expires_at: s.expires_at,
            disk_usage: s.disk_usage,
            labels: s.labels,
            repo_url: s.repo_url,
            outstanding_jobs: s.outstanding_jobs,
            stages_completed: s.stages_completed,
            last_error: s.last_error,
            expired: s.expired,
            quota_exceeded: s.quota_exceeded,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    pub job_id: String,
    pub job_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl From<&JobInfo> for JobResponse {
    fn from(job: &JobInfo) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type.clone(),
            status: job.status.to_string(),
            created_at: job.created_at,
            duration_ms: job.duration_ms,
            error: job.error.clone(),
            result: job.result.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StageResponse {
    pub step: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&StageExecution> for StageResponse {
    fn from(stage: &StageExecution) -> Self {
        Self {
            step: stage.step.clone(),
            attempt: stage.attempt,
            started_at: stage.started_at,
            duration_ms: stage.duration_ms,
            success: stage.success,
            error: stage.error.clone(),
        }
    }
}

/// Full session details
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub workspace_dir: String,
    pub disk_usage: u64,
    pub max_disk_usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub labels: Vec<String>,
    pub k8s_labels: BTreeMap<String, String>,
    pub jobs: Vec<JobResponse>,
    pub stage_history: Vec<StageResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub error_count: u32,
    pub tokens_used: u64,
}

impl From<&Session> for SessionResponse {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            status: s.status.to_string(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            expires_at: s.expires_at,
            workspace_dir: s.workspace_dir.display().to_string(),
            disk_usage: s.disk_usage,
            max_disk_usage: s.max_disk_usage,
            repo_url: s.repo_url.clone(),
            labels: s.labels.iter().cloned().collect(),
            k8s_labels: s.k8s_labels.clone(),
            jobs: s.active_jobs.values().map(JobResponse::from).collect(),
            stage_history: s.stage_history.iter().map(StageResponse::from).collect(),
            last_error: s.last_error.clone(),
            error_count: s.error_count,
            tokens_used: s.token_usage.total,
        }
    }
}

/// Request to create a session
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// Generated when omitted
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddLabelRequest {
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteSessionResponse {
    pub session_id: String,
    pub cancelled_jobs: Vec<String>,
}

// =============================================================================
// Stats DTOs
// =============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    pub total_sessions: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_disk_usage: u64,
    pub total_disk_limit: u64,
    pub outstanding_jobs: usize,
    pub total_errors: u64,
    pub average_age_secs: u64,
    pub labels: Vec<String>,
}

impl StatsResponse {
    pub fn new(stats: StoreStats, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            total_sessions: stats.total_sessions,
            by_status: stats.by_status,
            total_disk_usage: stats.total_disk_usage,
            total_disk_limit: stats.total_disk_limit,
            outstanding_jobs: stats.outstanding_jobs,
            total_errors: stats.total_errors,
            average_age_secs: stats.average_age_secs,
            labels: labels.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::JobStatus;
    use chrono::Duration;
    use std::path::PathBuf;

    #[test]
    fn test_session_response_flattens_jobs_and_labels() {
        let mut session = Session::new(
            "0123456789abcdef",
            PathBuf::from("/tmp/ws/0123456789abcdef"),
            Duration::hours(1),
            1024,
        );
        session.labels.insert("team-a".to_string());
        let mut job = JobInfo::new("job-1", "containerize");
        job.transition(JobStatus::Running, Utc::now());
        session.active_jobs.insert(job.job_id.clone(), job);

        let response = SessionResponse::from(&session);
        assert_eq!(response.status, "active");
        assert_eq!(response.labels, vec!["team-a"]);
        assert_eq!(response.jobs[0].status, "running");

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("repo_url").is_none());
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.session_id.is_none());
        assert!(request.labels.is_empty());
    }
}
