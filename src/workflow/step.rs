//! Step contract.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::WorkflowResult;
use crate::workflow::state::{Output, WorkflowState};

/// Small reporting payload returned by a step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    pub data: BTreeMap<String, String>,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }

    /// A step that finished without error but did not achieve its goal
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.data.insert(key.into(), value.to_string());
        self
    }
}

/// One named unit of pipeline work.
///
/// Steps are stateless; everything they produce goes into the
/// [`WorkflowState`] handed to them by the executor.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique name used for registration and stage history
    fn name(&self) -> &str;

    /// Default retry budget (exclusive of the first attempt)
    fn max_retries(&self) -> u32 {
        0
    }

    /// Stage outputs that must exist before this step may run
    fn requires(&self) -> &[Output] {
        &[]
    }

    async fn execute(&self, state: &mut WorkflowState) -> WorkflowResult<StepResult>;
}
