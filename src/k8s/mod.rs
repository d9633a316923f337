//! Kubernetes collaborators: manifest rendering, applying and the local kind cluster.

pub mod cluster;
pub mod kind;
pub mod manifest;

pub use cluster::{ClusterService, KubectlCluster};
pub use kind::KindCluster;
pub use manifest::{ManifestOptions, ManifestService, ResourceLimits, TemplateManifestService};
