//! Persisted session record, status state machine and job bookkeeping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::workflow::state::{StageExecution, TokenUsage, WorkflowState};

/// Record format version written with every session
pub const SESSION_RECORD_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Inactive,
    Suspended,
    Completed,
    Failed,
    Deleted,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 6] = [
        SessionStatus::Active,
        SessionStatus::Inactive,
        SessionStatus::Suspended,
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Deleted,
    ];

    /// Allowed transitions; everything not listed is rejected
    pub fn can_transition_to(self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, target),
            (Active, Completed | Failed | Suspended)
                | (Inactive, Active | Deleted)
                | (Suspended, Active | Failed | Deleted)
                | (Completed | Failed, Deleted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown session status '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, target),
            (Pending, Running | Failed | Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }

    /// Pending or running work blocks cleanup
    pub fn is_outstanding(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_outstanding()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl JobInfo {
    pub fn new(job_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            error: None,
            result: None,
        }
    }

    /// Apply a transition, stamping start/end times. Returns false if illegal.
    pub fn transition(&mut self, target: JobStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(target) {
            return false;
        }
        if target == JobStatus::Running {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.ended_at = Some(now);
            let from = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - from).num_milliseconds().max(0) as u64);
        }
        self.status = target;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub version: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub workspace_dir: PathBuf,
    pub disk_usage: u64,
    pub max_disk_usage: u64,
    pub status: SessionStatus,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub k8s_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub active_jobs: BTreeMap<String, JobInfo>,
    #[serde(default)]
    pub stage_history: Vec<StageExecution>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// Latest checkpoint of the workflow running in this session
    #[serde(default)]
    pub workflow: Option<WorkflowState>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        workspace_dir: PathBuf,
        ttl: Duration,
        max_disk_usage: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: SESSION_RECORD_VERSION.to_string(),
            session_id: session_id.into(),
            created_at: now,
            updated_at: now,
            last_accessed: now,
            expires_at: now + ttl,
            workspace_dir,
            disk_usage: 0,
            max_disk_usage,
            status: SessionStatus::Active,
            repo_url: None,
            labels: BTreeSet::new(),
            k8s_labels: BTreeMap::new(),
            active_jobs: BTreeMap::new(),
            stage_history: Vec::new(),
            last_error: None,
            error_count: 0,
            token_usage: TokenUsage::default(),
            workflow: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether any job is pending or running
    pub fn has_active_jobs(&self) -> bool {
        self.active_jobs.values().any(|j| j.status.is_outstanding())
    }

    pub fn outstanding_jobs(&self) -> usize {
        self.active_jobs
            .values()
            .filter(|j| j.status.is_outstanding())
            .count()
    }

    /// Apply a status transition; false if the state machine forbids it
    pub fn transition_to(&mut self, target: SessionStatus) -> bool {
        if !self.status.can_transition_to(target) {
            return false;
        }
        self.status = target;
        true
    }

    /// Whether garbage collection may remove this session.
    ///
    /// Sessions with pending or running jobs are never eligible.
    pub fn should_auto_cleanup(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        deleted_grace: Duration,
    ) -> bool {
        if self.has_active_jobs() {
            return false;
        }
        match self.status {
            SessionStatus::Completed | SessionStatus::Failed => now - self.updated_at > retention,
            SessionStatus::Deleted => now - self.updated_at > deleted_grace,
            SessionStatus::Inactive | SessionStatus::Suspended => self.is_expired(now),
            SessionStatus::Active => false,
        }
    }

    /// Whether the session may be evicted to make room for a new one
    pub fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        self.should_auto_cleanup(now, Duration::zero(), Duration::zero())
    }

    /// Number of distinct steps with a successful history entry
    pub fn stages_completed(&self) -> usize {
        self.stage_history
            .iter()
            .filter(|e| e.success)
            .map(|e| e.step.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            expires_at: self.expires_at,
            disk_usage: self.disk_usage,
            labels: self.labels.iter().cloned().collect(),
            repo_url: self.repo_url.clone(),
            outstanding_jobs: self.outstanding_jobs(),
            stages_completed: self.stages_completed(),
            last_error: self.last_error.clone(),
            expired: self.is_expired(now),
            quota_exceeded: self.disk_usage >= self.max_disk_usage,
        }
    }
}

/// Lightweight listing view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub disk_usage: u64,
    pub labels: Vec<String>,
    pub repo_url: Option<String>,
    pub outstanding_jobs: usize,
    pub stages_completed: usize,
    pub last_error: Option<String>,
    pub expired: bool,
    pub quota_exceeded: bool,
}

/// Aggregate store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_sessions: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_disk_usage: u64,
    pub total_disk_limit: u64,
    pub outstanding_jobs: usize,
    pub total_errors: u64,
    pub average_age_secs: u64,
}

/// Query over sessions; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFilter {
    /// Session must carry every one of these labels
    #[serde(default)]
    pub all_labels: Vec<String>,
    /// Session must carry at least one of these labels
    #[serde(default)]
    pub any_labels: Vec<String>,
    pub status: Option<SessionStatus>,
    pub repo_url: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl SessionFilter {
    /// Labels in a filter are compared in normalized form
    pub fn matches(&self, session: &Session) -> bool {
        let has = |label: &String| session.labels.contains(&label.trim().to_lowercase());

        self.all_labels.iter().all(has)
            && (self.any_labels.is_empty() || self.any_labels.iter().any(has))
            && self.status.map_or(true, |s| s == session.status)
            && self
                .repo_url
                .as_ref()
                .map_or(true, |url| session.repo_url.as_ref() == Some(url))
            && self.created_after.map_or(true, |t| session.created_at > t)
            && self.created_before.map_or(true, |t| session.created_at < t)
    }
}
