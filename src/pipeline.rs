//! Pipeline invocation surface.
//!
//! [`ContainerizeRunner`] ties a session to one run of the pipeline: it
//! activates the session, tracks a `containerize` job, checkpoints the
//! workflow into the store and settles the session status at the end.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::error::{WorkflowError, WorkflowResult};
use crate::session::model::{JobStatus, Session, SessionStatus};
use crate::session::store::SessionStore;
use crate::steps::{default_pipeline, default_registry, StepDeps};
use crate::workflow::executor::{Checkpoint, Executor, Pipeline};
use crate::workflow::state::{MetadataKey, MetadataValue, StageExecution, TokenUsage, WorkflowState};

pub const CONTAINERIZE_JOB: &str = "containerize";

/// Named options for one pipeline run. `None` falls back to configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Local directory or git URL
    pub target: String,
    pub registry_url: Option<String>,
    pub image_name: Option<String>,
    /// Reuse this session instead of creating a new one
    pub session_id: Option<String>,
    pub namespace: Option<String>,
    pub draft_dockerfile: Option<bool>,
    pub snapshot: Option<bool>,
    pub report: Option<bool>,
    pub max_iterations: Option<u32>,
    /// Per-stage retry budgets, layered over the configured ones
    pub max_retries: BTreeMap<String, u32>,
    pub timeout: Option<Duration>,
    pub extra_context: Option<String>,
    pub labels: Vec<String>,
}

impl PipelineOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    /// Effective configuration for this run
    fn apply(&self, config: &Config) -> Config {
        let mut config = config.clone();
        let pipeline = &mut config.pipeline;
        if let Some(registry) = &self.registry_url {
            pipeline.registry_url.clone_from(registry);
        }
        if let Some(namespace) = &self.namespace {
            pipeline.namespace.clone_from(namespace);
        }
        if let Some(draft) = self.draft_dockerfile {
            pipeline.draft_dockerfile = draft;
        }
        if let Some(snapshot) = self.snapshot {
            pipeline.snapshot = snapshot;
        }
        if let Some(report) = self.report {
            pipeline.report = report;
        }
        if let Some(max) = self.max_iterations {
            pipeline.complete_loop_max_iterations = max;
        }
        if let Some(timeout) = self.timeout {
            pipeline.timeout_secs = timeout.as_secs();
        }
        pipeline
            .max_retries
            .extend(self.max_retries.iter().map(|(k, v)| (k.clone(), *v)));
        config
    }
}

/// Saves the workflow into its session after every stage
struct SessionCheckpoint {
    store: Arc<SessionStore>,
}

#[async_trait]
impl Checkpoint for SessionCheckpoint {
    async fn save(&self, state: &WorkflowState) -> WorkflowResult<()> {
        self.store.record_workflow(state).map(|_| ())
    }
}

/// Contents of `<workspace>/report.json`
#[derive(Debug, Serialize)]
struct RunReport<'a> {
    session_id: &'a str,
    target: &'a str,
    success: bool,
    error: Option<String>,
    image: Option<String>,
    endpoint: Option<&'a str>,
    iterations: u32,
    token_usage: &'a TokenUsage,
    stages: &'a [StageExecution],
    diagnostics: Option<&'a serde_json::Value>,
}

pub struct ContainerizeRunner {
    store: Arc<SessionStore>,
    deps: StepDeps,
}

impl ContainerizeRunner {
    pub fn new(store: Arc<SessionStore>, deps: StepDeps) -> Self {
        Self { store, deps }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Run the default containerize pipeline
    pub async fn run(&self, options: &PipelineOptions) -> WorkflowResult<WorkflowState> {
        let config = Arc::new(options.apply(&self.deps.config));
        let mut deps = self.deps.clone();
        deps.config = config.clone();

        let registry = default_registry(&deps)?;
        let pipeline = default_pipeline(&registry, &config)?;
        self.run_pipeline(&pipeline, &config, options).await
    }

    /// Run an arbitrary pipeline under the session bookkeeping of a normal run
    #[instrument(skip_all, fields(target = %options.target))]
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        config: &Config,
        options: &PipelineOptions,
    ) -> WorkflowResult<WorkflowState> {
        let session = self.activate(options)?;
        let session_id = session.session_id.clone();
        for label in &options.labels {
            self.store.add_label(&session_id, label)?;
        }

        let mut state = initial_state(&session, config, options);
        let job_id = self.store.start_job(&session_id, CONTAINERIZE_JOB)?;
        self.store
            .update_job_status(&session_id, &job_id, JobStatus::Running, None)?;
        info!(session_id = %session_id, job_id = %job_id, "Containerize run started");

        let mut executor = Executor::new(config.pipeline.complete_loop_max_iterations);
        if config.pipeline.snapshot {
            executor = executor.with_checkpoint(Arc::new(SessionCheckpoint {
                store: self.store.clone(),
            }));
        }

        let timeout = Duration::from_secs(config.pipeline.timeout_secs);
        let timed = tokio::time::timeout(timeout, executor.run(pipeline, &mut state)).await;
        let outcome = match timed {
            Ok(outcome) => outcome,
            Err(_) => Err(cancel_in_flight(&mut state, timeout)),
        };

        if config.pipeline.report {
            match write_report(&state, outcome.as_ref().err()) {
                Ok(path) => state.set_metadata(
                    MetadataKey::ReportPath,
                    MetadataValue::Text(path.display().to_string()),
                ),
                Err(e) => warn!(session_id = %session_id, "Failed to write report: {}", e),
            }
        }

        self.settle(&state, &job_id, outcome.as_ref().err());
        outcome.map(|()| state)
    }

    /// Load or create the session and move it to active
    fn activate(&self, options: &PipelineOptions) -> WorkflowResult<Session> {
        let session = match &options.session_id {
            Some(id) => self.store.get_or_create(id)?,
            None => self.store.create_session(None)?,
        };
        match session.status {
            SessionStatus::Active => Ok(session),
            SessionStatus::Inactive | SessionStatus::Suspended => {
                self.store.set_status(&session.session_id, SessionStatus::Active)
            }
            status => Err(WorkflowError::validation(
                "session",
                format!("session {} is {status} and cannot run again", session.session_id),
            )),
        }
    }

    /// Record the final state and close out the job and session.
    ///
    /// Bookkeeping failures are logged and never replace the run's outcome.
    /// The job and session always end terminal in memory, even when the
    /// record cannot be written.
    fn settle(&self, state: &WorkflowState, job_id: &str, failure: Option<&WorkflowError>) {
        let session_id = state.session_id.as_str();
        if let Err(e) = self.store.record_workflow(state) {
            warn!(session_id, "Failed to record workflow state: {}", e);
        }

        let (job_status, session_status) = match failure {
            None => (JobStatus::Completed, SessionStatus::Completed),
            Some(WorkflowError::Cancelled { .. }) => (JobStatus::Cancelled, SessionStatus::Failed),
            Some(_) => (JobStatus::Failed, SessionStatus::Failed),
        };
        let message = failure.map(ToString::to_string);
        let summary = state
            .k8s_result
            .as_ref()
            .and_then(|k| k.endpoint.clone())
            .unwrap_or_else(|| format!("{} stages completed", state.stage_history.len()));

        let closed = self.store.finish_session(session_id, |session| {
            let now = Utc::now();
            let job = session
                .active_jobs
                .get_mut(job_id)
                .ok_or_else(|| WorkflowError::not_found("job", job_id))?;
            if job.status == JobStatus::Pending {
                job.transition(JobStatus::Running, now);
            }
            if !job.transition(job_status, now) {
                return Err(WorkflowError::validation(
                    "job_status",
                    format!("job {job_id} cannot move from {} to {job_status}", job.status),
                ));
            }
            match &message {
                None => job.result = Some(summary),
                Some(message) => {
                    job.error = Some(message.clone());
                    session.last_error = Some(message.clone());
                    session.error_count += 1;
                }
            }
            if !session.transition_to(session_status) {
                return Err(WorkflowError::validation(
                    "status",
                    format!("cannot move from {} to {session_status}", session.status),
                ));
            }
            Ok(())
        });

        match (closed, &message) {
            (Err(e), _) => error!(session_id, job_id, "Failed to close out containerize run: {}", e),
            (Ok(_), None) => info!(session_id, "Containerize run completed"),
            (Ok(_), Some(message)) => warn!(session_id, "Containerize run failed: {}", message),
        }

        if let Err(e) = self.store.refresh_disk_usage(session_id) {
            warn!(session_id, "Failed to refresh disk usage: {}", e);
        }
    }
}

fn initial_state(session: &Session, config: &Config, options: &PipelineOptions) -> WorkflowState {
    let mut state = WorkflowState::new(&session.session_id, &options.target);
    state.workspace_dir = session.workspace_dir.clone();
    state.registry_url = config.pipeline.registry_url.clone();
    state.namespace = config.pipeline.namespace.clone();
    if let Some(image) = &options.image_name {
        state.image_name.clone_from(image);
    }
    state.extra_context = options.extra_context.clone();
    state
}

/// Close the open history entry and name the stage that was interrupted
fn cancel_in_flight(state: &mut WorkflowState, timeout: Duration) -> WorkflowError {
    let message = format!("pipeline timed out after {}s", timeout.as_secs());
    let step = match state
        .stage_history
        .iter_mut()
        .rev()
        .find(|entry| entry.ended_at.is_none())
    {
        Some(entry) => {
            entry.finish(false, Some(message.clone()), 0);
            entry.step.clone()
        }
        None => "pipeline".to_string(),
    };
    warn!(session_id = %state.session_id, step = %step, "{}", message);
    WorkflowError::Cancelled { step }
}

fn write_report(state: &WorkflowState, error: Option<&WorkflowError>) -> WorkflowResult<PathBuf> {
    let k8s = state.k8s_result.as_ref();
    let report = RunReport {
        session_id: &state.session_id,
        target: &state.repo_identifier,
        success: error.is_none(),
        error: error.map(ToString::to_string),
        image: state.deploy_image_ref(),
        endpoint: k8s.and_then(|k| k.endpoint.as_deref()),
        iterations: state.iteration_count,
        token_usage: &state.token_usage,
        stages: &state.stage_history,
        diagnostics: k8s.and_then(|k| match k.metadata.get(&MetadataKey::Diagnostics) {
            Some(MetadataValue::Json(v)) => Some(v),
            _ => None,
        }),
    };
    let path = state.workspace_dir.join("report.json");
    std::fs::write(&path, serde_json::to_string_pretty(&report)?)
        .map_err(|e| WorkflowError::internal(format!("failed to write {}: {e}", path.display())))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use crate::session::persistence::MemoryPersistence;
    use crate::session::store::StoreSettings;
    use crate::workflow::executor::PipelineEntry;
    use crate::workflow::step::{Step, StepResult};
    use tempfile::TempDir;

    struct Passes(&'static str);

    #[async_trait]
    impl Step for Passes {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _state: &mut WorkflowState) -> WorkflowResult<StepResult> {
            Ok(StepResult::ok(self.0))
        }
    }

    struct Hangs;

    #[async_trait]
    impl Step for Hangs {
        fn name(&self) -> &str {
            "build"
        }

        async fn execute(&self, _state: &mut WorkflowState) -> WorkflowResult<StepResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StepResult::ok("never"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Step for Broken {
        fn name(&self) -> &str {
            "deploy"
        }

        async fn execute(&self, _state: &mut WorkflowState) -> WorkflowResult<StepResult> {
            Err(WorkflowError::validation("manifest", "bad path"))
        }
    }

    /// Breaks the session record store while it runs
    struct BreaksPersistence(Arc<MemoryPersistence>);

    #[async_trait]
    impl Step for BreaksPersistence {
        fn name(&self) -> &str {
            "build"
        }

        async fn execute(&self, _state: &mut WorkflowState) -> WorkflowResult<StepResult> {
            self.0.set_fail_saves(true);
            Ok(StepResult::ok("built"))
        }
    }

    fn runner(dir: &TempDir) -> ContainerizeRunner {
        runner_with(dir, Arc::new(MemoryPersistence::new()))
    }

    fn runner_with(dir: &TempDir, persistence: Arc<MemoryPersistence>) -> ContainerizeRunner {
        let store = SessionStore::open(
            StoreSettings::with_workspace_root(dir.path().join("workspaces")),
            persistence,
        )
        .unwrap();
        let config = Arc::new(Config::default());
        ContainerizeRunner::new(
            Arc::new(store),
            StepDeps::new(Arc::new(MockRunner::new()), config),
        )
    }

    fn pipeline(steps: Vec<Arc<dyn Step>>) -> Pipeline {
        Pipeline::new(steps.into_iter().map(PipelineEntry::new).collect()).unwrap()
    }

    #[test]
    fn test_options_layer_over_config() {
        let mut options = PipelineOptions::new("/repo");
        options.registry_url = Some(String::new());
        options.max_iterations = Some(5);
        options.snapshot = Some(false);
        options.max_retries.insert("build".to_string(), 4);

        let config = options.apply(&Config::default());
        assert_eq!(config.pipeline.registry_url, "");
        assert_eq!(config.pipeline.complete_loop_max_iterations, 5);
        assert!(!config.pipeline.snapshot);
        assert_eq!(config.max_retries_for("build", 2), 4);
        assert_eq!(config.pipeline.namespace, "default");
    }

    #[tokio::test]
    async fn test_successful_run_completes_session_and_job() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        let mut options = PipelineOptions::new("/repo");
        options.report = Some(true);
        options.labels = vec!["Team-A".to_string()];

        let state = runner
            .run_pipeline(
                &pipeline(vec![Arc::new(Passes("analyze")), Arc::new(Passes("build"))]),
                &options.apply(&Config::default()),
                &options,
            )
            .await
            .unwrap();

        let session = runner.store().get_session(&state.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.stage_history.len(), 2);
        assert!(session.labels.contains("team-a"));
        let job = session.active_jobs.values().next().unwrap();
        assert_eq!(job.job_type, CONTAINERIZE_JOB);
        assert_eq!(job.status, JobStatus::Completed);

        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(session.workspace_dir.join("report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(report["success"], true);
        assert_eq!(report["stages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_marks_session_failed() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        let options = PipelineOptions::new("/repo");

        let err = runner
            .run_pipeline(
                &pipeline(vec![Arc::new(Passes("analyze")), Arc::new(Broken)]),
                &Config::default(),
                &options,
            )
            .await
            .unwrap_err();
        assert!(matches!(&err, WorkflowError::StepFailed { step, .. } if step == "deploy"));

        let sessions = runner.store().list_sessions();
        let session = &sessions[0];
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error_count, 1);
        assert!(session.last_error.as_deref().unwrap().contains("bad path"));
        assert_eq!(
            session.active_jobs.values().next().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_timeout_cancels_in_flight_stage() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        let mut options = PipelineOptions::new("/repo");
        options.timeout = Some(Duration::from_secs(1));
        let config = options.apply(&Config::default());

        let err = runner
            .run_pipeline(
                &pipeline(vec![Arc::new(Passes("analyze")), Arc::new(Hangs)]),
                &config,
                &options,
            )
            .await
            .unwrap_err();
        assert!(matches!(&err, WorkflowError::Cancelled { step } if step == "build"));

        let sessions = runner.store().list_sessions();
        let session = &sessions[0];
        assert_eq!(session.status, SessionStatus::Failed);
        let last = session.stage_history.last().unwrap();
        assert_eq!(last.step, "build");
        assert!(last.ended_at.is_some());
        assert_eq!(
            session.active_jobs.values().next().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_completed_session_cannot_run_again() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        let mut options = PipelineOptions::new("/repo");
        options.session_id = Some("rerun-session".to_string());
        let steps = pipeline(vec![Arc::new(Passes("analyze"))]);

        runner
            .run_pipeline(&steps, &Config::default(), &options)
            .await
            .unwrap();
        let err = runner
            .run_pipeline(&steps, &Config::default(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_persist_failures_do_not_strand_the_run() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(MemoryPersistence::new());
        let runner = runner_with(&dir, persistence.clone());
        let options = PipelineOptions::new("/repo");

        // Checkpoints after both stages fail, so recording the workflow is rejected
        let state = runner
            .run_pipeline(
                &pipeline(vec![
                    Arc::new(BreaksPersistence(persistence.clone())),
                    Arc::new(Passes("manifest")),
                ]),
                &Config::default(),
                &options,
            )
            .await
            .unwrap();

        let session = runner.store().get_session(&state.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let job = session.active_jobs.values().next().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.ended_at.is_some());

        let stored = persistence.stored(&state.session_id).unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
        persistence.set_fail_saves(false);
        runner.store().flush().unwrap();
        let stored = persistence.stored(&state.session_id).unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
    }
}
