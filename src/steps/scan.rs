//! Vulnerability scan of the built image with trivy.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::runner::{CommandSpec, ProcessRunner};
use crate::workflow::state::{
    MetadataKey, MetadataValue, Output, ScanReport, ScanStatus, VulnerabilityCounts, WorkflowState,
};
use crate::workflow::step::{Step, StepResult};

const SCANNER: &str = "trivy";

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct TrivyReport {
    #[serde(default)]
    results: Vec<TrivyResult>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct TrivyResult {
    #[serde(default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
    severity: String,
}

/// Count findings by severity in `trivy image --format json` output
pub fn parse_trivy(json: &str) -> WorkflowResult<VulnerabilityCounts> {
    let report: TrivyReport = serde_json::from_str(json)
        .map_err(|e| WorkflowError::external("trivy", format!("unreadable report: {e}")))?;
    let mut counts = VulnerabilityCounts::default();
    for vuln in report
        .results
        .iter()
        .flat_map(|r| r.vulnerabilities.iter().flatten())
    {
        counts.record(&vuln.severity);
    }
    Ok(counts)
}

pub struct ScanStep {
    runner: Arc<dyn ProcessRunner>,
}

impl ScanStep {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Step for ScanStep {
    fn name(&self) -> &str {
        super::SCAN
    }

    fn max_retries(&self) -> u32 {
        1
    }

    fn requires(&self) -> &[Output] {
        &[Output::Build]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult> {
        let image_ref = state
            .build_result
            .as_ref()
            .map(|b| b.image_ref.clone())
            .ok_or_else(|| WorkflowError::invalid_state(self.name(), Output::Build.field_name()))?;

        if !self.runner.is_available(SCANNER) {
            let reason = format!("{SCANNER} is not installed");
            warn!("Skipping image scan: {}", reason);
            state.set_metadata(MetadataKey::ScanSkippedReason, MetadataValue::Text(reason.clone()));
            state.scan_report = Some(ScanReport {
                scanner: SCANNER.to_string(),
                vulnerability_counts: VulnerabilityCounts::default(),
                status: ScanStatus::Skipped,
            });
            return Ok(StepResult::ok(format!("scan skipped: {reason}")));
        }

        let output = self
            .runner
            .run(&CommandSpec::new(SCANNER).args([
                "image",
                "--format",
                "json",
                "--quiet",
                image_ref.as_str(),
            ]))
            .await?;
        let counts = parse_trivy(&output.stdout)?;

        let status = if counts.critical > 0 {
            ScanStatus::Blocked
        } else if counts.total() > 0 {
            ScanStatus::Warnings
        } else {
            ScanStatus::Clean
        };
        if status == ScanStatus::Blocked {
            warn!(critical = counts.critical, image_ref = %image_ref, "Image has critical vulnerabilities");
        } else {
            info!(total = counts.total(), image_ref = %image_ref, "Image scanned");
        }

        let message = format!(
            "{} vulnerabilities ({} critical, {} high)",
            counts.total(),
            counts.critical,
            counts.high
        );
        state.scan_report = Some(ScanReport {
            scanner: SCANNER.to_string(),
            vulnerability_counts: counts,
            status,
        });
        Ok(StepResult::ok(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockRunner};
    use crate::steps::testing::built_state;
    use tempfile::TempDir;

    const REPORT: &str = r#"{"Results":[
        {"Target":"web","Vulnerabilities":[{"Severity":"HIGH"},{"Severity":"LOW"},{"Severity":"CRITICAL"}]},
        {"Target":"os","Vulnerabilities":null}
    ]}"#;

    #[test]
    fn test_parse_trivy() {
        let counts = parse_trivy(REPORT).unwrap();
        assert_eq!(counts.critical, 1);
        assert_eq!(counts.high, 1);
        assert_eq!(counts.low, 1);
        assert_eq!(counts.total(), 3);
        assert!(parse_trivy("not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_scanner_is_skipped() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.mark_missing("trivy");
        let mut state = built_state(dir.path(), dir.path());

        let result = ScanStep::new(runner).execute(&mut state).await.unwrap();
        assert!(result.success);
        assert_eq!(state.scan_report.as_ref().unwrap().status, ScanStatus::Skipped);
        assert!(state.metadata_text(MetadataKey::ScanSkippedReason).is_some());
    }

    #[tokio::test]
    async fn test_critical_findings_block() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.on("trivy image", Ok(CommandOutput::ok(REPORT)));
        let mut state = built_state(dir.path(), dir.path());

        ScanStep::new(runner.clone()).execute(&mut state).await.unwrap();
        assert_eq!(state.scan_report.unwrap().status, ScanStatus::Blocked);
        assert_eq!(runner.calls("trivy image --format json --quiet web:abc12345").len(), 1);
    }

    #[tokio::test]
    async fn test_clean_image() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.on("trivy image", Ok(CommandOutput::ok(r#"{"Results":[]}"#)));
        let mut state = built_state(dir.path(), dir.path());

        ScanStep::new(runner).execute(&mut state).await.unwrap();
        assert_eq!(state.scan_report.unwrap().status, ScanStatus::Clean);
    }
}
