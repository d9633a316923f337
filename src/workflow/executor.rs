//! Pipeline executor: per-step retry budgets and bounded reroute-on-fail.
//!
//! The executor does not impose timeouts. Callers wrap [`Executor::run`] in
//! `tokio::time::timeout` (or drop the future); subprocess-backed steps kill
//! their children when dropped. The stage-history entry of the step that was
//! in flight is left without an `ended_at`, which is how callers tell which
//! stage was interrupted.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::workflow::registry::{RegistryError, StepRegistry};
use crate::workflow::state::{StageExecution, WorkflowState};
use crate::workflow::step::Step;

/// One configured stage of a pipeline
#[derive(Clone)]
pub struct PipelineEntry {
    pub step_id: String,
    pub step: Arc<dyn Step>,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Stage to jump to once retries are exhausted
    pub on_fail_goto: Option<String>,
}

impl PipelineEntry {
    /// Entry named after the step, using the step's default retry budget
    pub fn new(step: Arc<dyn Step>) -> Self {
        Self {
            step_id: step.name().to_string(),
            max_retries: step.max_retries(),
            step,
            on_fail_goto: None,
        }
    }

    pub fn with_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = step_id.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn on_fail_goto(mut self, target: impl Into<String>) -> Self {
        self.on_fail_goto = Some(target.into());
        self
    }
}

/// An ordered, validated list of stages
#[derive(Clone)]
pub struct Pipeline {
    entries: Vec<PipelineEntry>,
}

impl Pipeline {
    /// Validate stage ids are unique and every reroute target exists
    pub fn new(entries: Vec<PipelineEntry>) -> Result<Self, RegistryError> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.step_id == entry.step_id) {
                return Err(RegistryError::DuplicateStage(entry.step_id.clone()));
            }
        }
        for entry in &entries {
            if let Some(target) = &entry.on_fail_goto {
                if !entries.iter().any(|e| &e.step_id == target) {
                    return Err(RegistryError::UnknownRerouteTarget {
                        from: entry.step_id.clone(),
                        to: target.clone(),
                    });
                }
            }
        }
        Ok(Self { entries })
    }

    /// Build entries for the named steps, in order, with their default budgets
    pub fn from_registry(registry: &StepRegistry, names: &[&str]) -> Result<Self, RegistryError> {
        let entries = names
            .iter()
            .map(|name| registry.require(name).map(PipelineEntry::new))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entries)
    }

    pub fn entries(&self) -> &[PipelineEntry] {
        &self.entries
    }

    /// Adjust an entry in place; unknown ids are ignored
    pub fn configure(&mut self, step_id: &str, f: impl FnOnce(&mut PipelineEntry)) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.step_id == step_id) {
            f(entry);
        }
    }

    /// Set a reroute target, validating that it exists
    pub fn set_reroute(&mut self, from: &str, to: &str) -> Result<(), RegistryError> {
        if !self.entries.iter().any(|e| e.step_id == to) {
            return Err(RegistryError::UnknownRerouteTarget {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.step_id == from)
            .ok_or_else(|| RegistryError::UnknownStep(from.to_string()))?;
        entry.on_fail_goto = Some(to.to_string());
        Ok(())
    }

    fn position(&self, step_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.step_id == step_id)
    }
}

/// Receives the workflow state after each completed stage and reroute
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn save(&self, state: &WorkflowState) -> WorkflowResult<()>;
}

pub struct Executor {
    /// How many times the whole pipeline may re-enter another stage
    complete_loop_max_iterations: u32,
    checkpoint: Option<Arc<dyn Checkpoint>>,
}

impl Executor {
    pub fn new(complete_loop_max_iterations: u32) -> Self {
        Self {
            complete_loop_max_iterations,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    async fn save_checkpoint(&self, state: &WorkflowState) {
        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.save(state).await {
                warn!(session_id = %state.session_id, "Failed to checkpoint workflow state: {}", e);
            }
        }
    }

    /// Run every stage of `pipeline` against `state`.
    ///
    /// Completed stage outputs survive reroutes; a reroute resumes from the
    /// target stage with all prior state intact.
    #[instrument(skip_all, fields(session_id = %state.session_id))]
    pub async fn run(&self, pipeline: &Pipeline, state: &mut WorkflowState) -> WorkflowResult<()> {
        let entries = pipeline.entries();
        let mut index = 0;

        while let Some(entry) = entries.get(index) {
            if let Some(missing) = state.missing_output(entry.step.requires()) {
                return Err(WorkflowError::invalid_state(
                    &entry.step_id,
                    missing.field_name(),
                ));
            }

            let (attempts, error) = match self.run_entry(entry, state).await {
                Ok(()) => {
                    self.save_checkpoint(state).await;
                    index += 1;
                    continue;
                }
                Err(failure) => failure,
            };

            let reroute = entry
                .on_fail_goto
                .as_deref()
                .filter(|_| error.is_retryable())
                .and_then(|target| pipeline.position(target).map(|pos| (target, pos)));

            match reroute {
                Some((target, pos)) if state.iteration_count < self.complete_loop_max_iterations => {
                    state.iteration_count += 1;
                    warn!(
                        step = %entry.step_id,
                        reroute_to = target,
                        iteration = state.iteration_count,
                        max = self.complete_loop_max_iterations,
                        "Retries exhausted, rerouting: {}", error
                    );
                    self.save_checkpoint(state).await;
                    index = pos;
                }
                Some((target, _)) => {
                    warn!(
                        step = %entry.step_id,
                        reroute_to = target,
                        "Reroute budget of {} exhausted", self.complete_loop_max_iterations
                    );
                    return Err(step_failed(entry, attempts, error));
                }
                None => return Err(step_failed(entry, attempts, error)),
            }
        }

        info!(stages = entries.len(), reroutes = state.iteration_count, "Pipeline completed");
        Ok(())
    }

    /// Run one entry with its retry budget. On failure returns attempts made and the last error.
    async fn run_entry(
        &self,
        entry: &PipelineEntry,
        state: &mut WorkflowState,
    ) -> Result<(), (u32, WorkflowError)> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let history_index = state.stage_history.len();
            state
                .stage_history
                .push(StageExecution::start(&entry.step_id, attempt));
            let tokens_before = state.token_usage.total;

            let outcome = match entry.step.execute(state).await {
                Ok(result) if result.success => Ok(result),
                Ok(result) => Err(WorkflowError::external(&entry.step_id, result.message)),
                Err(e) => Err(e),
            };

            let tokens_used = state.token_usage.total.saturating_sub(tokens_before);
            let record = state.stage_history.get_mut(history_index);

            match outcome {
                Ok(result) => {
                    if let Some(record) = record {
                        record.finish(true, None, tokens_used);
                    }
                    info!(step = %entry.step_id, attempt, "Step succeeded: {}", result.message);
                    return Ok(());
                }
                Err(error) => {
                    if let Some(record) = record {
                        record.finish(false, Some(error.to_string()), tokens_used);
                    }

                    if !error.is_retryable() {
                        warn!(step = %entry.step_id, attempt, "Step failed, not retryable: {}", error);
                        return Err((attempt, error));
                    }
                    if attempt > entry.max_retries {
                        warn!(step = %entry.step_id, attempt, "Step failed, retries exhausted: {}", error);
                        return Err((attempt, error));
                    }
                    warn!(
                        step = %entry.step_id,
                        attempt,
                        remaining = entry.max_retries + 1 - attempt,
                        "Step failed, retrying: {}", error
                    );
                }
            }
        }
    }
}

fn step_failed(entry: &PipelineEntry, attempts: u32, error: WorkflowError) -> WorkflowError {
    WorkflowError::StepFailed {
        step: entry.step_id.clone(),
        attempts,
        source: Box::new(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::{AnalyzeResult, Output};
    use crate::workflow::step::StepResult;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` invocations, then succeeds
    struct Flaky {
        name: &'static str,
        failures: u32,
        calls: AtomicU32,
        requires: Vec<Output>,
        error: fn() -> WorkflowError,
    }

    impl Flaky {
        fn new(name: &'static str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures,
                calls: AtomicU32::new(0),
                requires: vec![],
                error: || WorkflowError::external("cmd", "exit 1"),
            })
        }

        fn always_failing(name: &'static str) -> Arc<Self> {
            Self::new(name, u32::MAX)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Step for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        fn requires(&self) -> &[Output] {
            &self.requires
        }

        async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err((self.error)());
            }
            if self.name == "analyze" {
                state.analyze_result = Some(AnalyzeResult {
                    language: "go".to_string(),
                    framework: None,
                    port: Some(8080),
                    dependencies: vec![],
                    repo_path: PathBuf::from("/repo"),
                    evidence: vec![],
                });
            }
            Ok(StepResult::ok(format!("{} done", self.name)))
        }
    }

    #[derive(Default)]
    struct RecordingCheckpoint {
        saves: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Checkpoint for RecordingCheckpoint {
        async fn save(&self, state: &WorkflowState) -> WorkflowResult<()> {
            self.saves.lock().unwrap().push(state.stage_history.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_budget_invokes_exactly_four_times() {
        let step = Flaky::always_failing("build");
        let pipeline =
            Pipeline::new(vec![PipelineEntry::new(step.clone()).with_max_retries(3)]).unwrap();
        let mut state = WorkflowState::new("s1", "/repo");

        let err = Executor::new(2).run(&pipeline, &mut state).await.unwrap_err();

        assert_eq!(step.calls(), 4);
        match err {
            WorkflowError::StepFailed { step, attempts, .. } => {
                assert_eq!(step, "build");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(state.stage_history.len(), 4);
        assert!(state.stage_history.iter().all(|e| !e.success));
    }

    #[tokio::test]
    async fn test_reroute_cycle_terminates() {
        let a = Flaky::always_failing("a");
        let b = Flaky::always_failing("b");
        let pipeline = Pipeline::new(vec![
            PipelineEntry::new(b.clone()).on_fail_goto("a"),
            PipelineEntry::new(a.clone()).on_fail_goto("b"),
        ])
        .unwrap();
        let mut state = WorkflowState::new("s1", "/repo");

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            Executor::new(2).run(&pipeline, &mut state),
        )
        .await
        .expect("executor must terminate");

        assert!(result.is_err());
        assert_eq!(state.iteration_count, 2);
        // b fails -> a, a fails -> b, b fails -> budget exhausted
        assert_eq!(b.calls(), 2);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_analyze_then_flaky_build_succeeds() {
        let analyze = Flaky::new("analyze", 0);
        let build = Flaky::new("build", 2);
        let pipeline = Pipeline::new(vec![
            PipelineEntry::new(analyze).with_max_retries(0),
            PipelineEntry::new(build).with_max_retries(2),
        ])
        .unwrap();
        let mut state = WorkflowState::new("s1", "/repo");

        Executor::new(2).run(&pipeline, &mut state).await.unwrap();

        assert_eq!(state.history_for("analyze").len(), 1);
        let builds = state.history_for("build");
        assert_eq!(builds.len(), 3);
        assert_eq!(
            builds.iter().map(|e| e.success).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(
            builds.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(builds.iter().all(|e| e.ended_at.is_some()));
    }

    #[tokio::test]
    async fn test_missing_predecessor_is_invalid_state() {
        let build = Arc::new(Flaky {
            name: "build",
            failures: 0,
            calls: AtomicU32::new(0),
            requires: vec![Output::Analyze],
            error: || WorkflowError::external("cmd", "exit 1"),
        });
        let pipeline = Pipeline::new(vec![PipelineEntry::new(build.clone())]).unwrap();
        let mut state = WorkflowState::new("s1", "/repo");

        let err = Executor::new(2).run(&pipeline, &mut state).await.unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::InvalidState { ref field, .. } if field == "analyze_result"
        ));
        assert_eq!(build.calls(), 0);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried_or_rerouted() {
        let first = Flaky::new("first", 0);
        let bad = Arc::new(Flaky {
            name: "bad",
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            requires: vec![],
            error: || WorkflowError::validation("image_ref", "uppercase letters"),
        });
        let pipeline = Pipeline::new(vec![
            PipelineEntry::new(first.clone()),
            PipelineEntry::new(bad.clone())
                .with_max_retries(5)
                .on_fail_goto("first"),
        ])
        .unwrap();
        let mut state = WorkflowState::new("s1", "/repo");

        let err = Executor::new(3).run(&pipeline, &mut state).await.unwrap_err();

        assert_eq!(bad.calls(), 1);
        assert_eq!(first.calls(), 1);
        assert_eq!(state.iteration_count, 0);
        assert!(err.to_string().contains("image_ref"));
    }

    #[tokio::test]
    async fn test_reroute_keeps_prior_outputs() {
        let analyze = Flaky::new("analyze", 0);
        let dockerfile = Flaky::new("dockerfile", 0);
        // Fails once (no retries), reroutes to dockerfile, then succeeds
        let build = Flaky::new("build", 1);
        let pipeline = Pipeline::new(vec![
            PipelineEntry::new(analyze.clone()),
            PipelineEntry::new(dockerfile.clone()),
            PipelineEntry::new(build.clone()).on_fail_goto("dockerfile"),
        ])
        .unwrap();
        let mut state = WorkflowState::new("s1", "/repo");

        Executor::new(2).run(&pipeline, &mut state).await.unwrap();

        assert_eq!(analyze.calls(), 1);
        assert_eq!(dockerfile.calls(), 2);
        assert_eq!(build.calls(), 2);
        assert_eq!(state.iteration_count, 1);
        assert!(state.analyze_result.is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_after_each_stage() {
        let checkpoint = Arc::new(RecordingCheckpoint::default());
        let pipeline = Pipeline::new(vec![
            PipelineEntry::new(Flaky::new("analyze", 0)),
            PipelineEntry::new(Flaky::new("build", 1)).with_max_retries(1),
        ])
        .unwrap();
        let mut state = WorkflowState::new("s1", "/repo");

        Executor::new(2)
            .with_checkpoint(checkpoint.clone())
            .run(&pipeline, &mut state)
            .await
            .unwrap();

        assert_eq!(*checkpoint.saves.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_timeout_leaves_in_flight_entry_open() {
        struct Slow;

        #[async_trait]
        impl Step for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            async fn execute(&self, _state: &mut WorkflowState) -> WorkflowResult<StepResult> {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(StepResult::ok("never"))
            }
        }

        let pipeline = Pipeline::new(vec![PipelineEntry::new(Arc::new(Slow))]).unwrap();
        let mut state = WorkflowState::new("s1", "/repo");
        let executor = Executor::new(0);

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            executor.run(&pipeline, &mut state),
        )
        .await;

        assert!(result.is_err());
        let last = state.stage_history.last().unwrap();
        assert_eq!(last.step, "slow");
        assert!(last.ended_at.is_none());
    }

    #[test]
    fn test_pipeline_rejects_unknown_reroute_target() {
        let result = Pipeline::new(vec![
            PipelineEntry::new(Flaky::new("build", 0)).on_fail_goto("nowhere")
        ]);
        assert!(matches!(
            result.err(),
            Some(RegistryError::UnknownRerouteTarget { .. })
        ));
    }

    #[test]
    fn test_pipeline_rejects_duplicate_stage_ids() {
        let result = Pipeline::new(vec![
            PipelineEntry::new(Flaky::new("build", 0)),
            PipelineEntry::new(Flaky::new("build", 0)),
        ]);
        assert_eq!(
            result.err(),
            Some(RegistryError::DuplicateStage("build".to_string()))
        );

        // The same step may appear twice under distinct stage ids
        let pipeline = Pipeline::new(vec![
            PipelineEntry::new(Flaky::new("build", 0)),
            PipelineEntry::new(Flaky::new("build", 0)).with_id("rebuild"),
        ])
        .unwrap();
        assert_eq!(pipeline.entries()[1].step_id, "rebuild");
    }
}
