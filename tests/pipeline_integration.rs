//! Integration tests for the pipeline executor and its session bookkeeping
//!
//! The scripted-step tests always run. The end-to-end containerize test
//! drives real `docker`, `kind` and `kubectl` and is gated:
//!
//! ## Environment Variables
//!
//! - `STEVEDORE_E2E_ENABLED=true` - Required to run the real-cluster test
//! - `STEVEDORE_E2E_REPO` - Repository to containerize (local path or git URL)
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test pipeline_integration
//!
//! STEVEDORE_E2E_ENABLED=true STEVEDORE_E2E_REPO=/path/to/app \
//!     cargo test --test pipeline_integration test_containerize_real_repo -- --nocapture
//! ```

use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use stevedore::config::Config;
use stevedore::error::{WorkflowError, WorkflowResult};
use stevedore::pipeline::{ContainerizeRunner, PipelineOptions};
use stevedore::runner::MockRunner;
use stevedore::session::{FilePersistence, SessionStatus, SessionStore, StoreSettings};
use stevedore::steps::StepDeps;
use stevedore::workflow::{
    AnalyzeResult, Executor, Output, Pipeline, PipelineEntry, Step, StepResult, WorkflowState,
};

// ─── Configuration ────────────────────────────────────────────────────────────

fn e2e_tests_enabled() -> bool {
    env::var("STEVEDORE_E2E_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Macro to skip tests if not configured
macro_rules! skip_if_not_configured {
    () => {
        if !e2e_tests_enabled() {
            eprintln!("Skipping test: STEVEDORE_E2E_ENABLED not set to true");
            return;
        }
    };
}

// ─── Scripted steps ───────────────────────────────────────────────────────────

/// Fails its first `failures` invocations with a retryable error
struct Scripted {
    name: &'static str,
    failures: u32,
    max_retries: u32,
    requires: Vec<Output>,
    calls: AtomicU32,
}

impl Scripted {
    fn new(name: &'static str, failures: u32, max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            failures,
            max_retries,
            requires: vec![],
            calls: AtomicU32::new(0),
        })
    }

    fn requiring(name: &'static str, output: Output) -> Arc<Self> {
        Arc::new(Self {
            name,
            failures: 0,
            max_retries: 0,
            requires: vec![output],
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn requires(&self) -> &[Output] {
        &self.requires
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(WorkflowError::external(self.name, format!("scripted failure {call}")));
        }
        if self.name == "analyze" {
            state.analyze_result = Some(AnalyzeResult {
                language: "go".to_string(),
                framework: None,
                port: Some(8080),
                dependencies: vec![],
                repo_path: state.repo_identifier.clone().into(),
                evidence: vec!["go.mod".to_string()],
            });
        }
        Ok(StepResult::ok(format!("{} ok", self.name)))
    }
}

fn pipeline(steps: &[Arc<Scripted>]) -> Pipeline {
    Pipeline::new(
        steps
            .iter()
            .map(|s| PipelineEntry::new(s.clone() as Arc<dyn Step>))
            .collect(),
    )
    .unwrap()
}

fn open_store(dir: &TempDir) -> Arc<SessionStore> {
    let persistence = FilePersistence::new(dir.path().join("sessions")).unwrap();
    Arc::new(
        SessionStore::open(
            StoreSettings::with_workspace_root(dir.path().join("workspaces")),
            Arc::new(persistence),
        )
        .unwrap(),
    )
}

// ─── Executor scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_build_succeeds_on_third_attempt() {
    let analyze = Scripted::new("analyze", 0, 0);
    let build = Scripted::new("build", 2, 2);
    let mut state = WorkflowState::new("e2e-session", "/repo");

    Executor::new(2)
        .run(&pipeline(&[analyze.clone(), build.clone()]), &mut state)
        .await
        .unwrap();

    let analyze_history = state.history_for("analyze");
    let build_history = state.history_for("build");
    assert_eq!(analyze_history.len(), 1);
    assert_eq!(build_history.len(), 3);
    assert_eq!(
        build_history.iter().map(|e| e.success).collect::<Vec<_>>(),
        vec![false, false, true]
    );
    assert_eq!(
        build_history.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(state.stage_history.iter().all(|e| e.ended_at.is_some()));
    assert_eq!(state.iteration_count, 0);
}

#[tokio::test]
async fn test_retry_budget_bounds_invocations() {
    let push = Scripted::new("push", u32::MAX, 3);
    let mut state = WorkflowState::new("budget-session", "/repo");

    let err = Executor::new(2)
        .run(&pipeline(&[push.clone()]), &mut state)
        .await
        .unwrap_err();

    assert_eq!(push.calls(), 4);
    match err {
        WorkflowError::StepFailed { step, attempts, .. } => {
            assert_eq!(step, "push");
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_reroute_cycle_terminates() {
    let a = Scripted::new("manifest", u32::MAX, 0);
    let b = Scripted::new("deploy", u32::MAX, 0);
    let pipeline = Pipeline::new(vec![
        PipelineEntry::new(a.clone() as Arc<dyn Step>).on_fail_goto("deploy"),
        PipelineEntry::new(b.clone() as Arc<dyn Step>).on_fail_goto("manifest"),
    ])
    .unwrap();
    let mut state = WorkflowState::new("cycle-session", "/repo");

    let err = Executor::new(2).run(&pipeline, &mut state).await.unwrap_err();

    assert!(matches!(err, WorkflowError::StepFailed { .. }));
    assert_eq!(state.iteration_count, 2);
    assert!(a.calls() + b.calls() <= 3);
}

#[tokio::test]
async fn test_missing_predecessor_is_invalid_state() {
    let manifest = Scripted::requiring("manifest", Output::Build);
    let mut state = WorkflowState::new("order-session", "/repo");

    let err = Executor::new(2)
        .run(&pipeline(&[manifest.clone()]), &mut state)
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::InvalidState { ref field, .. } if field == "build_result"));
    assert_eq!(manifest.calls(), 0);
}

// ─── Session-backed runs ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_is_recorded_in_persisted_session() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let runner = ContainerizeRunner::new(
        store.clone(),
        StepDeps::new(Arc::new(MockRunner::new()), Arc::new(Config::default())),
    );
    let mut options = PipelineOptions::new("/repo");
    options.session_id = Some("persisted-run".to_string());

    let state = runner
        .run_pipeline(
            &pipeline(&[Scripted::new("analyze", 0, 0), Scripted::new("build", 1, 1)]),
            &Config::default(),
            &options,
        )
        .await
        .unwrap();
    assert_eq!(state.stage_history.len(), 3);
    store.flush().unwrap();
    drop(runner);
    drop(store);

    // A fresh store sees the finished session
    let reopened = open_store(&dir);
    let session = reopened.get_session("persisted-run").unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.stage_history.len(), 3);
    assert_eq!(session.repo_url.as_deref(), Some("/repo"));
    let snapshot = session.workflow.unwrap();
    assert_eq!(snapshot.analyze_result.unwrap().language, "go");
}

#[tokio::test]
async fn test_failed_run_keeps_partial_outputs() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let runner = ContainerizeRunner::new(
        store.clone(),
        StepDeps::new(Arc::new(MockRunner::new()), Arc::new(Config::default())),
    );

    let err = runner
        .run_pipeline(
            &pipeline(&[Scripted::new("analyze", 0, 0), Scripted::new("build", u32::MAX, 1)]),
            &Config::default(),
            &PipelineOptions::new("/repo"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::StepFailed { ref step, attempts: 2, .. } if step == "build"));

    let session = store.list_sessions().remove(0);
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.workflow.as_ref().unwrap().analyze_result.is_some());
    assert_eq!(session.stage_history.len(), 3);
}

// ─── Real cluster ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_containerize_real_repo() {
    skip_if_not_configured!();
    let Ok(repo) = env::var("STEVEDORE_E2E_REPO") else {
        eprintln!("Skipping test: STEVEDORE_E2E_REPO not set");
        return;
    };

    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut config = Config::default();
    config.pipeline.registry_url = String::new();
    let config = Arc::new(config);
    let runner = ContainerizeRunner::new(store, StepDeps::system(config));

    let mut options = PipelineOptions::new(repo);
    options.report = Some(true);
    let state = runner.run(&options).await.expect("pipeline should succeed");

    assert!(state.build_result.is_some());
    assert!(state.k8s_result.as_ref().is_some_and(|k| !k.applied.is_empty()));
    eprintln!("{}", serde_json::to_string_pretty(&state.stage_history).unwrap());
}
