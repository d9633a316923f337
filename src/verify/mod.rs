//! Deployment verification and recovery.

pub mod diagnostics;
pub mod health;
pub mod port_forward;
pub mod recovery;
pub mod verifier;

pub use diagnostics::{DeploymentDiagnostics, DiagnosticsCollector};
pub use health::{HealthCheckConfig, HealthCheckResult, HealthChecker};
pub use port_forward::{PortForwardConfig, PortForwardHandle, PortForwardInfo, PortForwarder};
pub use recovery::{AttemptRecord, DeploymentFixer, ManifestFixer, RecoveryLoop, RecoveryPhase};
pub use verifier::{ClusterVerifier, DeploymentVerifier, VerificationResult};
