//! One verification pass: diagnostics, then port-forward and health probe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::config::VerificationConfig;
use crate::runner::ProcessRunner;
use crate::verify::diagnostics::{DeploymentDiagnostics, DiagnosticsCollector};
use crate::verify::health::{HealthCheckConfig, HealthCheckResult, HealthChecker};
use crate::verify::port_forward::{
    PortForwardConfig, PortForwardHandle, PortForwardInfo, PortForwarder,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub deployment_ok: bool,
    pub diagnostics: DeploymentDiagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forward: Option<PortForwardInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_url: Option<String>,
    pub messages: Vec<String>,
    pub next_steps: Vec<String>,
}

impl VerificationResult {
    /// Short reason the deployment is not healthy
    pub fn failure_reason(&self) -> String {
        if !self.diagnostics.deployment_ok {
            return self.diagnostics.summary();
        }
        match &self.health {
            Some(h) if !h.success => format!(
                "health check failed: {}",
                h.error.as_deref().unwrap_or("unhealthy response")
            ),
            _ => "deployment not verified".to_string(),
        }
    }
}

#[async_trait]
pub trait DeploymentVerifier: Send + Sync {
    async fn verify(&self, namespace: &str, app: &str) -> VerificationResult;
}

/// Verifies against a live cluster.
///
/// Established port-forwards are kept alive until their own timeout so the
/// reported access URL stays usable after verification returns.
pub struct ClusterVerifier {
    collector: DiagnosticsCollector,
    forwarder: PortForwarder,
    config: VerificationConfig,
    forwards: Mutex<Vec<PortForwardHandle>>,
}

impl ClusterVerifier {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: VerificationConfig) -> Self {
        Self {
            collector: DiagnosticsCollector::new(runner),
            forwarder: PortForwarder::new(),
            config,
            forwards: Mutex::new(Vec::new()),
        }
    }

    pub fn with_forwarder(mut self, forwarder: PortForwarder) -> Self {
        self.forwarder = forwarder;
        self
    }

    /// Forwards that are still running
    pub fn active_forwards(&self) -> Vec<PortForwardInfo> {
        let mut forwards = self.forwards.lock().unwrap_or_else(PoisonError::into_inner);
        forwards.retain(|f| f.is_running());
        forwards.iter().map(|f| f.info().clone()).collect()
    }

    /// Drop every forward, which stops the processes
    pub fn stop_all(&self) {
        self.forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl DeploymentVerifier for ClusterVerifier {
    async fn verify(&self, namespace: &str, app: &str) -> VerificationResult {
        let diagnostics = self.collector.collect(namespace, app).await;
        let mut result = VerificationResult {
            deployment_ok: diagnostics.deployment_ok,
            diagnostics,
            ..Default::default()
        };

        if !result.deployment_ok {
            result.messages.push(format!(
                "Deployment {namespace}/{app} is not ready: {}",
                result.diagnostics.summary()
            ));
            result.next_steps.push(format!(
                "kubectl describe deployment {app} -n {namespace}"
            ));
            result
                .next_steps
                .push(format!("kubectl logs -l app={app} -n {namespace}"));
            return result;
        }
        result.messages.push(format!(
            "Deployment {namespace}/{app} ready ({}/{} pods)",
            result.diagnostics.pods_ready, result.diagnostics.pods_total
        ));

        let target_port = self.collector.service_port(namespace, app).await;
        let pf_config = PortForwardConfig::from_verification(&self.config, target_port);
        let handle = match self.forwarder.start(namespace, app, &pf_config).await {
            Ok(handle) => handle,
            Err(e) => {
                // Pods are ready, so an unreachable forward is only a warning
                warn!("Port-forward unavailable: {}", e);
                result
                    .messages
                    .push(format!("Port-forward could not be established: {e}"));
                result.next_steps.push(format!(
                    "kubectl port-forward -n {namespace} service/{app} 8080:{target_port}"
                ));
                return result;
            }
        };

        let url = format!(
            "{}/{}",
            handle.access_url(),
            self.config.health_path.trim_start_matches('/')
        );
        let health = HealthChecker::new(HealthCheckConfig::from_verification(&self.config))
            .check(&url)
            .await;

        if health.success {
            info!(url = %url, "Deployment is healthy");
            result.messages.push(format!("Health check passed at {url}"));
        } else {
            result.deployment_ok = false;
            result.messages.push(format!(
                "Health check failed at {url}: {}",
                health.error.as_deref().unwrap_or("unhealthy response")
            ));
        }
        result.access_url = Some(handle.access_url().to_string());
        result.port_forward = Some(handle.info().clone());
        let healthy = health.success;
        result.health = Some(health);

        // Dropping the handle of an unhealthy forward stops it
        if healthy {
            self.forwards
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use crate::verify::diagnostics::fixtures;

    fn config() -> VerificationConfig {
        let mut config = VerificationConfig::default();
        config.establish_window_ms = 2000;
        config.health_attempts = 1;
        config.health_backoff_ms = 10;
        config.health_timeout_secs = 1;
        config.candidate_ports = vec![18180, 18181, 18182];
        config
    }

    #[tokio::test]
    async fn test_unready_deployment_skips_port_forward() {
        let runner = Arc::new(MockRunner::new());
        fixtures::crashing_cluster(&runner);
        let verifier = ClusterVerifier::new(runner, config()).with_forwarder(
            PortForwarder::with_command("sh", vec!["-c".into(), "exit 1".into()]),
        );

        let result = verifier.verify("default", "web").await;
        assert!(!result.deployment_ok);
        assert!(result.port_forward.is_none());
        assert!(!result.next_steps.is_empty());
        assert!(result.failure_reason().contains("0/1"));
    }

    #[tokio::test]
    async fn test_failed_forward_is_a_warning() {
        let runner = Arc::new(MockRunner::new());
        fixtures::healthy_cluster(&runner);
        let verifier = ClusterVerifier::new(runner, config()).with_forwarder(
            PortForwarder::with_command("sh", vec!["-c".into(), "exit 1".into()]),
        );

        let result = verifier.verify("default", "web").await;
        assert!(result.deployment_ok);
        assert!(result.health.is_none());
        assert!(result
            .messages
            .iter()
            .any(|m| m.contains("could not be established")));
    }

    #[tokio::test]
    async fn test_unhealthy_endpoint_fails_verification() {
        let runner = Arc::new(MockRunner::new());
        fixtures::healthy_cluster(&runner);
        // Claims to forward but nothing listens on the port
        let verifier = ClusterVerifier::new(runner, config()).with_forwarder(
            PortForwarder::with_command(
                "sh",
                vec![
                    "-c".into(),
                    "echo 'Forwarding from 127.0.0.1:{port}'; exec sleep 30".into(),
                ],
            ),
        );

        let result = verifier.verify("default", "web").await;
        assert!(!result.deployment_ok);
        assert!(result.port_forward.is_some());
        assert!(!result.health.as_ref().unwrap().success);
        // The forward of a failed check is not kept
        assert!(verifier.active_forwards().is_empty());
        verifier.stop_all();
    }
}
