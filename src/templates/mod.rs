//! Embedded Dockerfile and Kubernetes manifest templates.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{WorkflowError, WorkflowResult};

pub const DEPLOYMENT: &str = include_str!("k8s/deployment.yaml.hbs");
pub const SERVICE: &str = include_str!("k8s/service.yaml.hbs");

/// Dockerfile template for a detected language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerfileTemplate {
    Go,
    Node,
    Python,
    Java,
    Rust,
    Generic,
}

impl DockerfileTemplate {
    pub fn for_language(language: &str) -> Self {
        match language.to_ascii_lowercase().as_str() {
            "go" | "golang" => DockerfileTemplate::Go,
            "javascript" | "typescript" | "node" | "nodejs" => DockerfileTemplate::Node,
            "python" => DockerfileTemplate::Python,
            "java" | "kotlin" => DockerfileTemplate::Java,
            "rust" => DockerfileTemplate::Rust,
            _ => DockerfileTemplate::Generic,
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            DockerfileTemplate::Go => include_str!("dockerfile/go.hbs"),
            DockerfileTemplate::Node => include_str!("dockerfile/node.hbs"),
            DockerfileTemplate::Python => include_str!("dockerfile/python.hbs"),
            DockerfileTemplate::Java => include_str!("dockerfile/java.hbs"),
            DockerfileTemplate::Rust => include_str!("dockerfile/rust.hbs"),
            DockerfileTemplate::Generic => include_str!("dockerfile/generic.hbs"),
        }
    }

    /// Toolchain version used in the base image tag
    pub fn default_version(self) -> &'static str {
        match self {
            DockerfileTemplate::Go => "1.22",
            DockerfileTemplate::Node => "20",
            DockerfileTemplate::Python => "3.12",
            DockerfileTemplate::Java => "21",
            DockerfileTemplate::Rust => "1.80",
            DockerfileTemplate::Generic => "",
        }
    }
}

/// Render a template without HTML escaping
pub fn render<T: Serialize>(name: &str, template: &str, data: &T) -> WorkflowResult<String> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_template_string(name, template)
        .map_err(|e| WorkflowError::internal(format!("invalid template {name}: {e}")))?;
    hb.render(name, data)
        .map_err(|e| WorkflowError::internal(format!("failed to render {name}: {e}")))
}
