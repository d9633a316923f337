//! Validation applied before a session mutation is accepted.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path};

use crate::error::{WorkflowError, WorkflowResult};
use crate::session::model::Session;

static SESSION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{8,128}$").expect("valid session id regex"));

// name segment: lowercase alphanumerics separated by . _ __ or -
static IMAGE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:(?P<registry>[a-zA-Z0-9.-]+(?::[0-9]+)?)/)?(?P<name>[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*)(?::(?P<tag>[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}))?(?:@sha256:[a-f0-9]{64})?$",
    )
    .expect("valid image reference regex")
});

static K8S_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("valid k8s name regex")
});

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("valid dns subdomain regex")
});

/// Directories a workspace must never be
const SYSTEM_ROOTS: &[&str] = &["/", "/root", "/etc", "/usr", "/var", "/bin", "/sbin"];

const MAX_LABEL_LEN: usize = 128;
const K8S_MAX_NAME_LEN: usize = 63;
const K8S_MAX_PREFIX_LEN: usize = 253;
/// Tolerated clock skew for `created_at`
const CLOCK_SKEW_SECS: i64 = 5;
const LONG_RUNNING_JOB_SECS: i64 = 3600;

pub fn validate_session_id(id: &str) -> WorkflowResult<()> {
    if SESSION_ID.is_match(id) {
        Ok(())
    } else {
        Err(WorkflowError::validation(
            "session_id",
            format!("'{id}' must be 8-128 characters of [A-Za-z0-9_-]"),
        ))
    }
}

/// Workspace must be an absolute, existing directory without `..` segments
pub fn validate_workspace(path: &Path) -> WorkflowResult<()> {
    let field = "workspace_dir";
    if !path.is_absolute() {
        return Err(WorkflowError::validation(
            field,
            format!("{} is not absolute", path.display()),
        ));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(WorkflowError::validation(
            field,
            format!("{} contains path traversal", path.display()),
        ));
    }
    if SYSTEM_ROOTS.iter().any(|root| path == Path::new(root)) {
        return Err(WorkflowError::validation(
            field,
            format!("{} is a system directory", path.display()),
        ));
    }
    if !path.is_dir() {
        return Err(WorkflowError::validation(
            field,
            format!("{} does not exist or is not a directory", path.display()),
        ));
    }
    Ok(())
}

/// Check an image reference; returns warnings (missing or `latest` tag)
pub fn validate_image_ref(image_ref: &str) -> WorkflowResult<Vec<String>> {
    let captures = IMAGE_REF.captures(image_ref).ok_or_else(|| {
        WorkflowError::validation("image_ref", format!("'{image_ref}' is not a valid image reference"))
    })?;

    let mut warnings = Vec::new();
    match captures.name("tag").map(|m| m.as_str()) {
        None if !image_ref.contains('@') => {
            warnings.push(format!("image '{image_ref}' has no tag, 'latest' is implied"));
        }
        Some("latest") => warnings.push(format!("image '{image_ref}' uses the 'latest' tag")),
        _ => {}
    }
    Ok(warnings)
}

/// Manifest paths must be YAML files without `..` segments
pub fn validate_manifest_path(path: &Path) -> WorkflowResult<()> {
    let field = "manifest_path";
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(WorkflowError::validation(
            field,
            format!("{} contains path traversal", path.display()),
        ));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => Ok(()),
        _ => Err(WorkflowError::validation(
            field,
            format!("{} is not a .yaml/.yml file", path.display()),
        )),
    }
}

/// Trim and lowercase a label, rejecting empty or oversized ones
pub fn normalize_label(label: &str) -> WorkflowResult<String> {
    let normalized = label.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(WorkflowError::validation("label", "label cannot be empty"));
    }
    if normalized.chars().count() > MAX_LABEL_LEN {
        return Err(WorkflowError::validation(
            "label",
            format!("label exceeds {MAX_LABEL_LEN} characters"),
        ));
    }
    if normalized.chars().any(char::is_control) {
        return Err(WorkflowError::validation(
            "label",
            "label contains control characters",
        ));
    }
    Ok(normalized)
}

/// Kubernetes label key: optional DNS-subdomain prefix, then a name of at most 63 chars
pub fn validate_k8s_label_key(key: &str) -> WorkflowResult<()> {
    let field = "k8s_label_key";
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > K8S_MAX_PREFIX_LEN || !DNS_SUBDOMAIN.is_match(prefix)
        {
            return Err(WorkflowError::validation(
                field,
                format!("'{key}' has an invalid prefix"),
            ));
        }
    }
    if name.is_empty() || name.len() > K8S_MAX_NAME_LEN || !K8S_NAME.is_match(name) {
        return Err(WorkflowError::validation(
            field,
            format!("'{key}' must be at most 63 characters of [A-Za-z0-9-_.], starting and ending alphanumeric"),
        ));
    }
    Ok(())
}

/// Kubernetes label value: empty, or at most 63 chars with the name charset
pub fn validate_k8s_label_value(value: &str) -> WorkflowResult<()> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > K8S_MAX_NAME_LEN || !K8S_NAME.is_match(value) {
        return Err(WorkflowError::validation(
            "k8s_label_value",
            format!("'{value}' must be at most 63 characters of [A-Za-z0-9-_.], starting and ending alphanumeric"),
        ));
    }
    Ok(())
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

/// Errors block the mutation, warnings are logged
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<WorkflowError>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn check(&mut self, result: WorkflowResult<()>) {
        if let Err(e) = result {
            self.errors.push(e);
        }
    }

    fn warn(&mut self, field: &str, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.to_string(),
            message: message.into(),
        });
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// First error, if any
    pub fn into_result(self) -> WorkflowResult<Vec<ValidationIssue>> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.warnings),
        }
    }
}

/// Validates whole session records against store limits
#[derive(Debug, Clone)]
pub struct SessionValidator {
    pub max_disk_per_session: u64,
}

impl SessionValidator {
    pub fn new(max_disk_per_session: u64) -> Self {
        Self {
            max_disk_per_session,
        }
    }

    pub fn validate(&self, session: &Session, now: DateTime<Utc>) -> ValidationReport {
        let mut report = ValidationReport::default();

        report.check(validate_session_id(&session.session_id));
        report.check(validate_workspace(&session.workspace_dir));
        self.validate_timestamps(session, now, &mut report);
        self.validate_disk(session, &mut report);

        for label in &session.labels {
            if normalize_label(label).ok().as_deref() != Some(label.as_str()) {
                report.check(Err(WorkflowError::validation(
                    "label",
                    format!("'{label}' is not normalized"),
                )));
            }
        }
        for (key, value) in &session.k8s_labels {
            report.check(validate_k8s_label_key(key));
            report.check(validate_k8s_label_value(value));
        }

        if let Some(workflow) = &session.workflow {
            let image_refs = workflow
                .build_result
                .as_ref()
                .map(|b| b.image_ref.clone())
                .into_iter()
                .chain(workflow.deploy_image_ref());
            for image_ref in image_refs {
                match validate_image_ref(&image_ref) {
                    Ok(warnings) => {
                        for w in warnings {
                            report.warn("image_ref", w);
                        }
                    }
                    Err(e) => report.errors.push(e),
                }
            }
            if let Some(k8s) = &workflow.k8s_result {
                for manifest in &k8s.manifests {
                    report.check(validate_manifest_path(manifest));
                }
            }
        }

        for job in session.active_jobs.values() {
            if let Some(started) = job.started_at {
                if job.status.is_outstanding()
                    && now - started > Duration::seconds(LONG_RUNNING_JOB_SECS)
                {
                    report.warn(
                        "active_jobs",
                        format!("job {} has been running for over an hour", job.job_id),
                    );
                }
            }
        }

        report
    }

    fn validate_timestamps(&self, session: &Session, now: DateTime<Utc>, report: &mut ValidationReport) {
        if session.created_at > now + Duration::seconds(CLOCK_SKEW_SECS) {
            report.check(Err(WorkflowError::validation(
                "created_at",
                "creation time is in the future",
            )));
        }
        if session.expires_at <= session.created_at {
            report.check(Err(WorkflowError::validation(
                "expires_at",
                "expiry must be after creation",
            )));
        }
        if session.last_accessed < session.created_at {
            report.check(Err(WorkflowError::validation(
                "last_accessed",
                "last access precedes creation",
            )));
        }
    }

    fn validate_disk(&self, session: &Session, report: &mut ValidationReport) {
        let limit = self.max_disk_per_session.min(session.max_disk_usage);
        if session.disk_usage > limit {
            report.errors.push(WorkflowError::resource_limit(
                "disk",
                format!(
                    "session {} uses {} bytes, limit is {}",
                    session.session_id, session.disk_usage, limit
                ),
            ));
        } else if limit > 0 && session.disk_usage * 10 > limit * 8 {
            report.warn(
                "disk_usage",
                format!("session {} is above 80% of its disk quota", session.session_id),
            );
        }
    }
}
