//! Error taxonomy for the workflow engine.
//!
//! Validation and invalid-state errors are caller bugs and never retried.
//! External-operation failures are retried up to a step's budget.

use thiserror::Error;

use crate::verify::recovery::AttemptRecord;

/// Result alias used throughout the engine
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    /// A step ran before the stage output it depends on was produced
    #[error("step '{step}' requires '{field}' which has not been produced yet")]
    InvalidState { step: String, field: String },

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Non-zero exit, non-2xx response, cluster API error
    #[error("{operation} failed: {message}")]
    ExternalOperation {
        operation: String,
        message: String,
        /// Captured subprocess output, if any
        output: Option<String>,
    },

    #[error("{resource} limit exceeded: {message}")]
    ResourceLimit { resource: String, message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("step '{step}' cancelled")]
    Cancelled { step: String },

    /// Terminal pipeline failure naming the step, attempt count and last error
    #[error("step '{step}' failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: String,
        attempts: u32,
        #[source]
        source: Box<WorkflowError>,
    },

    /// Deployment never became healthy; carries every attempt's diagnostics
    #[error("deployment failed after {} attempt(s): {last_error}", attempts.len())]
    DeploymentFailed {
        attempts: Vec<AttemptRecord>,
        last_error: String,
    },
}

impl WorkflowError {
    pub fn invalid_state(step: impl Into<String>, field: impl Into<String>) -> Self {
        WorkflowError::InvalidState {
            step: step.into(),
            field: field.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::ExternalOperation {
            operation: operation.into(),
            message: message.into(),
            output: None,
        }
    }

    pub fn external_with_output(
        operation: impl Into<String>,
        message: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        WorkflowError::ExternalOperation {
            operation: operation.into(),
            message: message.into(),
            output: Some(output.into()),
        }
    }

    pub fn resource_limit(resource: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::ResourceLimit {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        WorkflowError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        WorkflowError::Internal(message.into())
    }

    /// Whether the executor may retry the step that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::ExternalOperation { .. } | WorkflowError::DeploymentFailed { .. } => {
                true
            }
            WorkflowError::StepFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Captured command output attached to the innermost external failure
    pub fn output(&self) -> Option<&str> {
        match self {
            WorkflowError::ExternalOperation { output, .. } => output.as_deref(),
            WorkflowError::StepFailed { source, .. } => source.output(),
            _ => None,
        }
    }

    /// Short category name, used in stage history and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::InvalidState { .. } => "invalid_state",
            WorkflowError::Validation { .. } => "validation",
            WorkflowError::ExternalOperation { .. } => "external_operation",
            WorkflowError::ResourceLimit { .. } => "resource_limit",
            WorkflowError::NotFound { .. } => "not_found",
            WorkflowError::Internal(_) => "internal",
            WorkflowError::Cancelled { .. } => "cancelled",
            WorkflowError::StepFailed { .. } => "step_failed",
            WorkflowError::DeploymentFailed { .. } => "deployment_failed",
        }
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::Internal(err.to_string())
    }
}

impl From<crate::workflow::registry::RegistryError> for WorkflowError {
    fn from(err: crate::workflow::registry::RegistryError) -> Self {
        WorkflowError::validation("pipeline", err.to_string())
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Internal(format!("serialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WorkflowError::external("docker build", "exit 1").is_retryable());
        assert!(!WorkflowError::validation("session_id", "too short").is_retryable());
        assert!(!WorkflowError::invalid_state("build", "dockerfile_result").is_retryable());
        assert!(!WorkflowError::internal("corrupt").is_retryable());
    }

    #[test]
    fn test_step_failed_wraps_source() {
        let err = WorkflowError::StepFailed {
            step: "build".to_string(),
            attempts: 3,
            source: Box::new(WorkflowError::external_with_output(
                "docker build",
                "exit status 1",
                "COPY failed: no such file",
            )),
        };

        assert!(err.is_retryable());
        assert_eq!(err.output(), Some("COPY failed: no such file"));
        let msg = err.to_string();
        assert!(msg.contains("build"));
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("exit status 1"));
    }

    #[test]
    fn test_invalid_state_names_field() {
        let err = WorkflowError::invalid_state("build", "dockerfile_result");
        assert_eq!(err.kind(), "invalid_state");
        assert!(err.to_string().contains("dockerfile_result"));
    }
}
