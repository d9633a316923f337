//! Kubernetes manifest generation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{WorkflowError, WorkflowResult};
use crate::templates;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_request: "100m".to_string(),
            memory_request: "128Mi".to_string(),
            cpu_limit: "500m".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

/// Everything the manifest templates need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestOptions {
    pub app_name: String,
    pub image: String,
    pub namespace: String,
    /// Container port
    pub port: u16,
    pub service_port: u16,
    pub replicas: u32,
    pub service_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Option<ResourceLimits>,
    #[serde(default)]
    pub probes: bool,
}

impl ManifestOptions {
    pub fn new(app_name: &str, image: &str, namespace: &str, port: u16) -> Self {
        Self {
            app_name: app_name.to_string(),
            image: image.to_string(),
            namespace: namespace.to_string(),
            port,
            service_port: port,
            replicas: 1,
            service_type: "ClusterIP".to_string(),
            labels: BTreeMap::new(),
            resources: Some(ResourceLimits::default()),
            probes: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedManifest {
    pub file_name: String,
    pub content: String,
}

pub trait ManifestService: Send + Sync {
    fn render(&self, options: &ManifestOptions) -> WorkflowResult<Vec<RenderedManifest>>;

    /// Render and write every manifest into `dir`, returning the paths
    fn write(&self, options: &ManifestOptions, dir: &Path) -> WorkflowResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        self.render(options)?
            .into_iter()
            .map(|m| -> WorkflowResult<PathBuf> {
                let path = dir.join(&m.file_name);
                std::fs::write(&path, &m.content)?;
                debug!(path = %path.display(), "Wrote manifest");
                Ok(path)
            })
            .collect()
    }
}

/// Renders the embedded Deployment and Service templates
#[derive(Debug, Default, Clone)]
pub struct TemplateManifestService;

impl TemplateManifestService {
    pub fn new() -> Self {
        Self
    }
}

impl ManifestService for TemplateManifestService {
    fn render(&self, options: &ManifestOptions) -> WorkflowResult<Vec<RenderedManifest>> {
        if options.replicas == 0 {
            return Err(WorkflowError::validation("replicas", "must be at least 1"));
        }
        let manifests = [
            ("deployment.yaml", templates::DEPLOYMENT),
            ("service.yaml", templates::SERVICE),
        ];
        manifests
            .into_iter()
            .map(|(file_name, template)| -> WorkflowResult<RenderedManifest> {
                let content = templates::render(file_name, template, options)?;
                check_yaml(file_name, &content)?;
                Ok(RenderedManifest {
                    file_name: file_name.to_string(),
                    content,
                })
            })
            .collect()
    }
}

/// Every document in `content` must parse as YAML
pub fn check_yaml(name: &str, content: &str) -> WorkflowResult<()> {
    for document in serde_yaml::Deserializer::from_str(content) {
        serde_yaml::Value::deserialize(document).map_err(|e| {
            WorkflowError::validation("manifest", format!("{name} is not valid YAML: {e}"))
        })?;
    }
    Ok(())
}
