//! Best-effort cluster diagnostics for a deployed application.
//!
//! Every probe runs independently: a failing `kubectl` call is recorded as an
//! error or warning and collection carries on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::runner::{CommandSpec, ProcessRunner};

/// Recent events kept per snapshot
const MAX_EVENTS: usize = 20;
const LOG_TAIL_LINES: u32 = 100;
/// Used when the service does not report a port
pub const DEFAULT_TARGET_PORT: u16 = 8080;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    pub ready: bool,
    pub phase: String,
    pub restarts: u32,
    pub node: String,
    pub ip: String,
    pub container_states: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub service_type: String,
    pub cluster_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    /// `port:target[:node]/proto`
    pub ports: Vec<String>,
    pub endpoints: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: String,
    pub memory: String,
}

/// Snapshot of a deployment's state in the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDiagnostics {
    pub timestamp: DateTime<Utc>,
    pub namespace: String,
    pub app_name: String,
    pub deployment_ok: bool,
    pub pods_ready: u32,
    pub pods_total: u32,
    pub pod_statuses: Vec<PodStatus>,
    pub services: Vec<ServiceStatus>,
    pub events: Vec<String>,
    /// Keyed by pod name; `<pod>_previous` holds the previous container's logs
    pub logs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<BTreeMap<String, ResourceUsage>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DeploymentDiagnostics {
    pub fn new(namespace: &str, app_name: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            namespace: namespace.to_string(),
            app_name: app_name.to_string(),
            ..Default::default()
        }
    }

    /// Healthy iff every pod is ready, there is at least one, and nothing hard failed
    pub fn evaluate(&mut self) -> bool {
        self.deployment_ok =
            self.pods_total > 0 && self.pods_ready == self.pods_total && self.errors.is_empty();
        self.deployment_ok
    }

    pub fn unready_pods(&self) -> impl Iterator<Item = &PodStatus> {
        self.pod_statuses.iter().filter(|p| !p.ready || p.restarts > 0)
    }

    /// One line for logs and error messages
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}/{}: {}/{} pods ready",
            self.namespace, self.app_name, self.pods_ready, self.pods_total
        );
        if let Some(err) = self.errors.first() {
            let _ = write!(line, ", {err}");
        }
        if let Some(pod_err) = self.pod_statuses.iter().find_map(|p| p.last_error.as_deref()) {
            let _ = write!(line, ", pod error: {pod_err}");
        }
        line
    }

    /// Plain-text diagnostic report
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Deployment diagnostics for {}/{}", self.namespace, self.app_name);
        let _ = writeln!(out, "Collected at {}", self.timestamp.to_rfc3339());
        let _ = writeln!(
            out,
            "Status: {} ({}/{} pods ready)",
            if self.deployment_ok { "OK" } else { "NOT READY" },
            self.pods_ready,
            self.pods_total
        );

        if !self.pod_statuses.is_empty() {
            let _ = writeln!(out, "\nPods:");
            for pod in &self.pod_statuses {
                let _ = writeln!(
                    out,
                    "  {} [{}] ready={} restarts={} node={} ip={}",
                    pod.name, pod.phase, pod.ready, pod.restarts, pod.node, pod.ip
                );
                for state in &pod.container_states {
                    let _ = writeln!(out, "    {state}");
                }
                if let Some(err) = &pod.last_error {
                    let _ = writeln!(out, "    last error: {err}");
                }
            }
        }

        if !self.services.is_empty() {
            let _ = writeln!(out, "\nServices:");
            for svc in &self.services {
                let _ = writeln!(
                    out,
                    "  {} ({}) cluster-ip={} ports={} endpoints={}",
                    svc.name,
                    svc.service_type,
                    svc.cluster_ip,
                    svc.ports.join(","),
                    svc.endpoints
                );
                if let Some(ip) = &svc.external_ip {
                    let _ = writeln!(out, "    external-ip={ip}");
                }
            }
        }

        if let Some(usage) = &self.resource_usage {
            let _ = writeln!(out, "\nResource usage:");
            for (pod, u) in usage {
                let _ = writeln!(out, "  {pod}: cpu={} memory={}", u.cpu, u.memory);
            }
        }

        if !self.events.is_empty() {
            let _ = writeln!(out, "\nRecent events:");
            for event in &self.events {
                let _ = writeln!(out, "  {event}");
            }
        }

        for (pod, logs) in &self.logs {
            let _ = writeln!(out, "\nLogs ({pod}):");
            for line in logs.lines() {
                let _ = writeln!(out, "  {line}");
            }
        }

        for (title, items) in [("Errors", &self.errors), ("Warnings", &self.warnings)] {
            if !items.is_empty() {
                let _ = writeln!(out, "\n{title}:");
                for item in items {
                    let _ = writeln!(out, "  - {item}");
                }
            }
        }
        out
    }
}

// Subset of the kubectl JSON we read

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    metadata: ObjectMeta,
    spec: PodSpec,
    status: PodStatusJson,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ObjectMeta {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodSpec {
    node_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodStatusJson {
    phase: String,
    #[serde(rename = "podIP")]
    pod_ip: String,
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ContainerStatus {
    name: String,
    ready: bool,
    restart_count: u32,
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContainerState {
    running: Option<serde_json::Value>,
    waiting: Option<StateReason>,
    terminated: Option<StateReason>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StateReason {
    reason: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Service {
    spec: ServiceSpec,
    status: ServiceStatusJson,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ServiceSpec {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(rename = "clusterIP")]
    cluster_ip: String,
    ports: Vec<ServicePort>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ServicePort {
    port: u16,
    target_port: serde_json::Value,
    node_port: Option<u16>,
    protocol: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ServiceStatusJson {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoadBalancer {
    ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoadBalancerIngress {
    ip: String,
}

fn pod_status(pod: Pod) -> PodStatus {
    let mut status = PodStatus {
        name: pod.metadata.name,
        ready: !pod.status.container_statuses.is_empty(),
        phase: pod.status.phase,
        node: pod.spec.node_name,
        ip: pod.status.pod_ip,
        ..Default::default()
    };

    for container in pod.status.container_statuses {
        status.restarts += container.restart_count;
        status.ready &= container.ready;

        let state = if container.state.running.is_some() {
            "Running".to_string()
        } else if let Some(waiting) = &container.state.waiting {
            format!("Waiting: {}", waiting.reason)
        } else if let Some(terminated) = &container.state.terminated {
            format!("Terminated: {}", terminated.reason)
        } else {
            "Unknown".to_string()
        };

        let reason = container
            .state
            .waiting
            .or(container.state.terminated)
            .filter(|r| !r.message.is_empty() || !r.reason.is_empty());
        if let Some(r) = reason {
            status.last_error = Some(if r.message.is_empty() {
                r.reason
            } else {
                r.message
            });
        }

        status.container_states.push(format!("{}: {}", container.name, state));
    }
    status
}

fn service_status(name: &str, service: Service) -> ServiceStatus {
    let ports = service
        .spec
        .ports
        .iter()
        .map(|p| {
            let target = match &p.target_port {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => p.port.to_string(),
            };
            match p.node_port {
                Some(node) => format!("{}:{}:{}/{}", p.port, target, node, p.protocol),
                None => format!("{}:{}/{}", p.port, target, p.protocol),
            }
        })
        .collect();

    ServiceStatus {
        name: name.to_string(),
        service_type: service.spec.service_type,
        cluster_ip: service.spec.cluster_ip,
        external_ip: service
            .status
            .load_balancer
            .ingress
            .into_iter()
            .map(|i| i.ip)
            .find(|ip| !ip.is_empty()),
        ports,
        endpoints: 0,
    }
}

/// Parse `ready/total` as printed by the readiness jsonpath
fn parse_replicas(output: &str) -> Option<(u32, u32)> {
    let (ready, total) = output.trim().split_once('/')?;
    let ready = if ready.trim().is_empty() {
        0
    } else {
        ready.trim().parse().ok()?
    };
    Some((ready, total.trim().parse().ok()?))
}

/// Collects diagnostics by shelling out to `kubectl`
pub struct DiagnosticsCollector {
    runner: Arc<dyn ProcessRunner>,
}

impl DiagnosticsCollector {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String, String> {
        self.runner
            .run(&CommandSpec::new("kubectl").args(args.iter().copied()))
            .await
            .map(|out| out.stdout)
            .map_err(|e| match e.output() {
                Some(output) if !output.trim().is_empty() => format!("{e}: {}", output.trim()),
                _ => e.to_string(),
            })
    }

    /// Collect a full snapshot. Never fails; problems land in `errors`/`warnings`.
    #[instrument(skip(self))]
    pub async fn collect(&self, namespace: &str, app: &str) -> DeploymentDiagnostics {
        let mut diag = DeploymentDiagnostics::new(namespace, app);

        self.check_deployment(&mut diag).await;
        self.collect_pods(&mut diag).await;
        self.collect_service(&mut diag).await;
        self.collect_events(&mut diag).await;
        if diag.pods_total == 0 || diag.pods_ready < diag.pods_total {
            self.collect_logs(&mut diag).await;
        }
        self.collect_resource_usage(&mut diag).await;

        diag.evaluate();
        debug!(
            ok = diag.deployment_ok,
            errors = diag.errors.len(),
            warnings = diag.warnings.len(),
            "Collected deployment diagnostics"
        );
        diag
    }

    async fn check_deployment(&self, diag: &mut DeploymentDiagnostics) {
        let jsonpath = "jsonpath={.status.readyReplicas}/{.spec.replicas}";
        let args: &[&str] = &[
            "get", "deployment", &diag.app_name, "-n", &diag.namespace, "-o", jsonpath,
        ];
        match self.kubectl(args).await {
            Ok(output) => match parse_replicas(&output) {
                Some((ready, total)) => {
                    diag.pods_ready = ready;
                    diag.pods_total = total;
                }
                None => diag
                    .errors
                    .push(format!("unexpected deployment status output: '{}'", output.trim())),
            },
            Err(e) => diag.errors.push(format!("deployment lookup failed: {e}")),
        }
    }

    async fn collect_pods(&self, diag: &mut DeploymentDiagnostics) {
        let selector = format!("app={}", diag.app_name);
        let args: &[&str] = &["get", "pods", "-n", &diag.namespace, "-l", &selector, "-o", "json"];
        let output = match self.kubectl(args).await {
            Ok(output) => output,
            Err(e) => {
                diag.errors.push(format!("pod lookup failed: {e}"));
                return;
            }
        };
        match serde_json::from_str::<PodList>(&output) {
            Ok(list) => diag.pod_statuses = list.items.into_iter().map(pod_status).collect(),
            Err(e) => diag.errors.push(format!("failed to parse pod list: {e}")),
        }
    }

    async fn collect_service(&self, diag: &mut DeploymentDiagnostics) {
        let args: &[&str] = &["get", "service", &diag.app_name, "-n", &diag.namespace, "-o", "json"];
        let service = match self.kubectl(args).await {
            Ok(output) => match serde_json::from_str::<Service>(&output) {
                Ok(service) => service,
                Err(e) => {
                    diag.warnings.push(format!("failed to parse service: {e}"));
                    return;
                }
            },
            Err(e) => {
                diag.warnings.push(format!("service lookup failed: {e}"));
                return;
            }
        };

        let mut status = service_status(&diag.app_name, service);
        let jsonpath = "jsonpath={.subsets[*].addresses[*].ip}";
        let args: &[&str] = &["get", "endpoints", &diag.app_name, "-n", &diag.namespace, "-o", jsonpath];
        match self.kubectl(args).await {
            Ok(output) => status.endpoints = output.split_whitespace().count(),
            Err(e) => diag.warnings.push(format!("endpoint lookup failed: {e}")),
        }
        diag.services.push(status);
    }

    async fn collect_events(&self, diag: &mut DeploymentDiagnostics) {
        let args: &[&str] = &[
            "get",
            "events",
            "-n",
            &diag.namespace,
            "--sort-by=.lastTimestamp",
            "--no-headers",
        ];
        match self.kubectl(args).await {
            Ok(output) => {
                let lines: Vec<&str> = output
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                let start = lines.len().saturating_sub(MAX_EVENTS);
                diag.events = lines[start..].iter().map(|l| l.to_string()).collect();
            }
            Err(e) => diag.warnings.push(format!("event lookup failed: {e}")),
        }
    }

    async fn collect_logs(&self, diag: &mut DeploymentDiagnostics) {
        let tail = format!("--tail={LOG_TAIL_LINES}");
        let pods: Vec<String> = diag.unready_pods().map(|p| p.name.clone()).collect();

        for pod in pods {
            let args: &[&str] = &[
                "logs", &pod, "-n", &diag.namespace, &tail, "--all-containers=true",
            ];
            match self.kubectl(args).await {
                Ok(output) if !output.trim().is_empty() => {
                    diag.logs.insert(pod, output);
                }
                Ok(_) => {}
                Err(current_err) => {
                    let args: &[&str] = &[
                        "logs",
                        &pod,
                        "-n",
                        &diag.namespace,
                        &tail,
                        "--previous",
                        "--all-containers=true",
                    ];
                    match self.kubectl(args).await {
                        Ok(output) if !output.trim().is_empty() => {
                            diag.logs.insert(format!("{pod}_previous"), output);
                        }
                        _ => diag
                            .warnings
                            .push(format!("logs unavailable for {pod}: {current_err}")),
                    }
                }
            }
        }
    }

    /// Needs metrics-server; silently omitted without it
    async fn collect_resource_usage(&self, diag: &mut DeploymentDiagnostics) {
        let selector = format!("app={}", diag.app_name);
        let args: &[&str] = &["top", "pods", "-n", &diag.namespace, "-l", &selector, "--no-headers"];
        let Ok(output) = self.kubectl(args).await else {
            return;
        };
        let usage: BTreeMap<String, ResourceUsage> = output
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.as_slice() {
                    [pod, cpu, memory, ..] => Some((
                        pod.to_string(),
                        ResourceUsage {
                            cpu: cpu.to_string(),
                            memory: memory.to_string(),
                        },
                    )),
                    _ => None,
                }
            })
            .collect();
        if !usage.is_empty() {
            diag.resource_usage = Some(usage);
        }
    }

    /// First port exposed by the service, or 8080
    pub async fn service_port(&self, namespace: &str, service: &str) -> u16 {
        let args: &[&str] = &[
            "get",
            "service",
            service,
            "-n",
            namespace,
            "-o",
            "jsonpath={.spec.ports[0].port}",
        ];
        self.kubectl(args)
            .await
            .ok()
            .and_then(|out| out.trim().parse().ok())
            .unwrap_or(DEFAULT_TARGET_PORT)
    }
}
