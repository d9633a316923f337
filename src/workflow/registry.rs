//! Step registry built once at startup and injected into pipelines.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::workflow::step::Step;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("step '{0}' is already registered")]
    DuplicateStep(String),

    #[error("step '{0}' is not registered")]
    UnknownStep(String),

    #[error("stage id '{0}' appears more than once in the pipeline")]
    DuplicateStage(String),

    #[error("stage '{from}' reroutes to unknown stage '{to}'")]
    UnknownRerouteTarget { from: String, to: String },
}

/// Collects steps; duplicate names are rejected at construction time
#[derive(Default)]
pub struct StepRegistryBuilder {
    steps: HashMap<String, Arc<dyn Step>>,
    order: Vec<String>,
}

impl StepRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Step + 'static>(self, step: S) -> Result<Self, RegistryError> {
        self.register_arc(Arc::new(step))
    }

    pub fn register_arc(mut self, step: Arc<dyn Step>) -> Result<Self, RegistryError> {
        let name = step.name().to_string();
        if self.steps.contains_key(&name) {
            return Err(RegistryError::DuplicateStep(name));
        }
        self.order.push(name.clone());
        self.steps.insert(name, step);
        Ok(self)
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry {
            steps: self.steps,
            order: self.order,
        }
    }
}

/// Immutable name → step map. Cloning shares the underlying steps.
#[derive(Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
    order: Vec<String>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn Step>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::UnknownStep(name.to_string()))
    }

    /// Registered names in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
