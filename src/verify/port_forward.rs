//! Ephemeral `kubectl port-forward` with a hard lifetime.
//!
//! Every forward is owned by a background task that kills the process when
//! the timeout elapses, when the handle asks it to stop, or when the handle is
//! dropped. Abandoned forwards therefore never outlive their timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::VerificationConfig;
use crate::error::{WorkflowError, WorkflowResult};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ESTABLISHED_MARKER: &str = "Forwarding from";
const FAILURE_MARKERS: &[&str] = &["error", "not found", "failed"];

#[derive(Debug, Clone)]
pub struct PortForwardConfig {
    /// Chosen from `candidate_ports` when unset
    pub local_port: Option<u16>,
    pub target_port: u16,
    pub timeout: Duration,
    pub establish_window: Duration,
    pub candidate_ports: Vec<u16>,
}

impl PortForwardConfig {
    pub fn from_verification(config: &VerificationConfig, target_port: u16) -> Self {
        Self {
            local_port: None,
            target_port,
            timeout: config.port_forward_timeout(),
            establish_window: config.establish_window(),
            candidate_ports: config.candidate_ports.clone(),
        }
    }
}

/// Serializable description of an established forward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortForwardInfo {
    pub local_port: u16,
    pub access_url: String,
    pub pid: Option<u32>,
    pub expires_at: DateTime<Utc>,
}

enum Signal {
    Established,
    Failed(String),
}

/// Starts port-forward processes
#[derive(Debug, Clone)]
pub struct PortForwarder {
    program: String,
    /// Replaces the kubectl arguments; `{port}` expands to the local port
    args_override: Option<Vec<String>>,
}

impl Default for PortForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl PortForwarder {
    pub fn new() -> Self {
        Self {
            program: "kubectl".to_string(),
            args_override: None,
        }
    }

    /// Run an arbitrary command instead of kubectl
    pub fn with_command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args_override: Some(args),
        }
    }

    fn args(&self, namespace: &str, service: &str, local: u16, target: u16) -> Vec<String> {
        match &self.args_override {
            Some(args) => args
                .iter()
                .map(|a| a.replace("{port}", &local.to_string()))
                .collect(),
            None => vec![
                "port-forward".to_string(),
                "-n".to_string(),
                namespace.to_string(),
                format!("service/{service}"),
                format!("{local}:{target}"),
            ],
        }
    }

    /// Start a forward and wait until it is established or has clearly failed
    #[instrument(skip(self, config), fields(target_port = config.target_port))]
    pub async fn start(
        &self,
        namespace: &str,
        service: &str,
        config: &PortForwardConfig,
    ) -> WorkflowResult<PortForwardHandle> {
        let local_port = match config.local_port {
            Some(port) => port,
            None => select_local_port(&config.candidate_ports).ok_or_else(|| {
                WorkflowError::resource_limit(
                    "local port",
                    format!("no free port among candidates {:?}", config.candidate_ports),
                )
            })?,
        };
        let started = Instant::now();

        let mut child = Command::new(&self.program)
            .args(self.args(namespace, service, local_port, config.target_port))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkflowError::external("port-forward", format!("failed to start {}: {e}", self.program))
            })?;
        let pid = child.id();

        let (signal_tx, mut signal_rx) = mpsc::channel::<Signal>(4);
        watch_output(&mut child, signal_tx);

        let deadline = started + config.establish_window;
        let outcome = loop {
            if Instant::now() >= deadline {
                break Err(format!(
                    "not established within {:?}",
                    config.establish_window
                ));
            }
            tokio::select! {
                signal = signal_rx.recv() => match signal {
                    Some(Signal::Established) => break Ok(()),
                    Some(Signal::Failed(msg)) => break Err(msg),
                    // Both pipes closed; the process exit is picked up below
                    None => tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await,
                },
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            if let Ok(Some(status)) = child.try_wait() {
                break Err(format!("process exited early with {status}"));
            }
            if is_listening(local_port).await {
                break Ok(());
            }
        };

        if let Err(message) = outcome {
            let _ = child.kill().await;
            warn!(local_port, "Port-forward failed: {}", message);
            return Err(WorkflowError::external(
                format!("port-forward {namespace}/{service}"),
                message,
            ));
        }

        let remaining = config.timeout.saturating_sub(started.elapsed());
        let expires_at = Utc::now()
            + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
        let (stop_tx, stop_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(supervise(child, remaining, stop_rx, exited.clone()));

        info!(local_port, ?pid, "Port-forward established");
        Ok(PortForwardHandle {
            info: PortForwardInfo {
                local_port,
                access_url: format!("http://localhost:{local_port}"),
                pid,
                expires_at,
            },
            stop_tx: Some(stop_tx),
            exited,
            task: Some(task),
        })
    }
}

/// Forward stdout/stderr lines as establishment signals
fn watch_output(child: &mut Child, tx: mpsc::Sender<Signal>) {
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "port-forward stdout");
                if line.contains(ESTABLISHED_MARKER) {
                    let _ = tx.send(Signal::Established).await;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let lower = line.to_lowercase();
                if FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
                    let _ = tx.send(Signal::Failed(line)).await;
                }
            }
        });
    }
}

/// Own the child until the timeout, a stop request, or its own exit
async fn supervise(
    mut child: Child,
    timeout: Duration,
    stop_rx: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            info!(pid = ?child.id(), "Port-forward timed out, stopping it");
        }
        _ = stop_rx => {
            debug!(pid = ?child.id(), "Port-forward stop requested");
        }
        status = child.wait() => {
            debug!(?status, "Port-forward process exited");
        }
    }
    // Errors here only mean the process is already gone
    let _ = child.kill().await;
    exited.store(true, Ordering::SeqCst);
}

/// First candidate port that can be bound locally. An empty list tries the default port.
pub fn select_local_port(candidates: &[u16]) -> Option<u16> {
    let fallback = [crate::verify::diagnostics::DEFAULT_TARGET_PORT];
    let candidates = if candidates.is_empty() {
        &fallback[..]
    } else {
        candidates
    };
    candidates
        .iter()
        .copied()
        .find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
}

async fn is_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(200),
            TcpStream::connect(("127.0.0.1", port))
        )
        .await,
        Ok(Ok(_))
    )
}

/// A running forward. Dropping it stops the process.
#[derive(Debug)]
pub struct PortForwardHandle {
    info: PortForwardInfo,
    stop_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl PortForwardHandle {
    pub fn info(&self) -> &PortForwardInfo {
        &self.info
    }

    pub fn local_port(&self) -> u16 {
        self.info.local_port
    }

    pub fn access_url(&self) -> &str {
        &self.info.access_url
    }

    /// False once the process has been killed or has exited
    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// Kill the process and wait for cleanup to finish
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PortForwardHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(timeout: Duration) -> PortForwardConfig {
        PortForwardConfig {
            local_port: None,
            target_port: 80,
            timeout,
            establish_window: Duration::from_secs(3),
            candidate_ports: vec![18080, 18081, 18082, 18083],
        }
    }

    fn fake(script: &str) -> PortForwarder {
        PortForwarder::with_command("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let forwarder = fake("echo 'Forwarding from 127.0.0.1:{port} -> 80'; exec sleep 30");

        let handle = forwarder
            .start("default", "web", &config(Duration::from_millis(100)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_running());

        #[cfg(target_os = "linux")]
        if let Some(pid) = handle.info().pid {
            assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        }
    }

    #[tokio::test]
    async fn test_stop_kills_process() {
        let forwarder = fake("echo 'Forwarding from 127.0.0.1:{port}'; exec sleep 30");
        let mut handle = forwarder
            .start("default", "web", &config(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(handle.is_running());
        assert!(handle.access_url().starts_with("http://localhost:"));
        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_stderr_error_fails_fast() {
        let forwarder = fake("echo 'error: services \"web\" not found' >&2; exec sleep 30");
        let started = std::time::Instant::now();

        let err = forwarder
            .start("default", "web", &config(Duration::from_secs(60)))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_early_exit_fails() {
        let forwarder = fake("exit 1");
        assert!(forwarder
            .start("default", "web", &config(Duration::from_secs(60)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_established_by_connectable_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let forwarder = fake("exec sleep 30");

        let mut cfg = config(Duration::from_secs(60));
        cfg.local_port = Some(port);
        let mut handle = forwarder.start("default", "web", &cfg).await.unwrap();
        assert_eq!(handle.local_port(), port);
        handle.stop().await;
    }

    #[test]
    fn test_select_local_port_skips_busy() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);

        assert_eq!(select_local_port(&[busy_port, free_port]), Some(free_port));
    }

    #[tokio::test]
    async fn test_start_fails_when_every_candidate_is_busy() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let second = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let ports = vec![
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port(),
        ];
        assert_eq!(select_local_port(&ports), None);

        let forwarder = fake("exec sleep 5");
        let mut cfg = config(Duration::from_secs(1));
        cfg.candidate_ports = ports;
        let err = forwarder.start("default", "web", &cfg).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ResourceLimit { .. }));
    }

    #[test]
    fn test_kubectl_args() {
        let args = PortForwarder::new().args("apps", "web", 8081, 80);
        assert_eq!(args, vec!["port-forward", "-n", "apps", "service/web", "8081:80"]);
    }
}
