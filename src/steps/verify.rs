//! Verify the deployment, recovering within a bounded number of attempts.

use async_trait::async_trait;

use crate::error::WorkflowResult;
use crate::verify::RecoveryLoop;
use crate::workflow::state::{Output, WorkflowState};
use crate::workflow::step::{Step, StepResult};

pub struct VerifyStep {
    recovery: RecoveryLoop,
}

impl VerifyStep {
    pub fn new(recovery: RecoveryLoop) -> Self {
        Self { recovery }
    }
}

#[async_trait]
impl Step for VerifyStep {
    fn name(&self) -> &str {
        super::VERIFY
    }

    fn requires(&self) -> &[Output] {
        &[Output::K8s]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let result = self.recovery.run(state).await?;
        let mut step = StepResult::ok(
            result
                .messages
                .last()
                .cloned()
                .unwrap_or_else(|| "deployment verified".to_string()),
        )
        .with_data("pods_ready", result.diagnostics.pods_ready);
        if let Some(url) = &result.access_url {
            step = step.with_data("access_url", url);
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use crate::runner::MockRunner;
    use crate::verify::diagnostics::fixtures;
    use crate::verify::port_forward::PortForwarder;
    use crate::verify::ClusterVerifier;
    use crate::config::VerificationConfig;
    use crate::workflow::state::K8sResult;
    use std::sync::Arc;
    use std::time::Duration;

    fn state() -> WorkflowState {
        let mut state = WorkflowState::new("abc12345", "/repo");
        state.k8s_result = Some(K8sResult {
            namespace: "default".to_string(),
            service_name: "web".to_string(),
            ..Default::default()
        });
        state
    }

    #[tokio::test]
    async fn test_crashing_deployment_fails_with_diagnostics() {
        let runner = Arc::new(MockRunner::new());
        fixtures::crashing_cluster(&runner);
        let verifier = ClusterVerifier::new(runner, VerificationConfig::default());
        let step = VerifyStep::new(
            RecoveryLoop::new(Arc::new(verifier), 2).with_settle(Duration::from_millis(1)),
        );
        let mut state = state();

        match step.execute(&mut state).await.unwrap_err() {
            WorkflowError::DeploymentFailed { attempts, .. } => {
                assert_eq!(attempts.len(), 1);
                assert!(attempts[0].diagnostics.logs.contains_key("web-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ready_deployment_without_forward_passes() {
        let runner = Arc::new(MockRunner::new());
        fixtures::healthy_cluster(&runner);
        let mut config = VerificationConfig::default();
        config.establish_window_ms = 500;
        let verifier = ClusterVerifier::new(runner, config)
            .with_forwarder(PortForwarder::with_command("sh", vec!["-c".into(), "exit 1".into()]));
        let step = VerifyStep::new(RecoveryLoop::new(Arc::new(verifier), 1));
        let mut state = state();

        let result = step.execute(&mut state).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data["pods_ready"], "1");
    }
}
