//! Step-based workflow engine.

pub mod executor;
pub mod registry;
pub mod state;
pub mod step;

pub use executor::{Checkpoint, Executor, Pipeline, PipelineEntry};
pub use registry::{RegistryError, StepRegistry, StepRegistryBuilder};
pub use state::{
    AnalyzeResult, BuildResult, DockerfileResult, K8sResult, MetadataKey, MetadataValue, Output,
    ScanReport, ScanStatus, StageExecution, TokenUsage, WorkflowState,
};
pub use step::{Step, StepResult};
