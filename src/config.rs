use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub sessions: SessionsConfig,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for logs and other local state
    pub state: String,
    /// One JSON record per session lives here
    pub sessions: String,
    /// Session-scoped workspace directories are created under this root
    pub workspaces: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Session lifetime in seconds (default: 86400 = 24h)
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    /// Maximum number of sessions held by the store (default: 100)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-session disk limit in bytes (default: 1 GiB)
    #[serde(default = "default_max_disk_per_session")]
    pub max_disk_per_session: u64,
    /// Aggregate disk limit across sessions in bytes (default: 10 GiB)
    #[serde(default = "default_total_disk_limit")]
    pub total_disk_limit: u64,
    /// How long completed/failed sessions are kept (default: 7 days)
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// How long deleted sessions linger before removal (default: 1h)
    #[serde(default = "default_deleted_grace")]
    pub deleted_grace_secs: u64,
    /// Interval between garbage collection passes (default: 1h)
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

fn default_session_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_max_sessions() -> usize {
    100
}

fn default_max_disk_per_session() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_total_disk_limit() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_retention() -> u64 {
    7 * 86_400 // 7 days
}

fn default_deleted_grace() -> u64 {
    3600 // 1 hour
}

fn default_gc_interval() -> u64 {
    3600 // 1 hour
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How many times the whole pipeline may jump back to an earlier stage
    #[serde(default = "default_complete_loop_max_iterations")]
    pub complete_loop_max_iterations: u32,
    /// Retry budget overrides keyed by step name
    #[serde(default)]
    pub max_retries: BTreeMap<String, u32>,
    /// Overall pipeline timeout in seconds (default: 1800 = 30 min)
    #[serde(default = "default_pipeline_timeout")]
    pub timeout_secs: u64,
    /// Always render a fresh Dockerfile even when the repo has one
    #[serde(default)]
    pub draft_dockerfile: bool,
    /// Persist the workflow state after every stage
    #[serde(default = "default_true")]
    pub snapshot: bool,
    /// Write report.json into the session workspace when done
    #[serde(default)]
    pub report: bool,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Registry images are pushed to; empty skips the push stage
    #[serde(default = "default_registry")]
    pub registry_url: String,
    #[serde(default = "default_kind_cluster")]
    pub kind_cluster: String,
}

fn default_complete_loop_max_iterations() -> u32 {
    2
}

fn default_pipeline_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_registry() -> String {
    "localhost:5001".to_string()
}

fn default_kind_cluster() -> String {
    "stevedore".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Port-forwards are killed after this many seconds (default: 1800 = 30 min)
    #[serde(default = "default_port_forward_timeout")]
    pub port_forward_timeout_secs: u64,
    /// How long to wait for a port-forward to come up (default: 5000 ms)
    #[serde(default = "default_establish_window")]
    pub establish_window_ms: u64,
    #[serde(default = "default_candidate_ports")]
    pub candidate_ports: Vec<u16>,
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,
    /// Backoff unit between health probes; attempt n waits n units (default: 1000 ms)
    #[serde(default = "default_health_backoff")]
    pub health_backoff_ms: u64,
    /// Per-request health probe timeout (default: 30s)
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_healthy_statuses")]
    pub healthy_statuses: Vec<u16>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Bounded attempts for the deployment recovery loop
    #[serde(default = "default_recovery_attempts")]
    pub recovery_max_attempts: u32,
    /// Settle time after an auto-fix is applied (default: 200 ms)
    #[serde(default = "default_fix_settle")]
    pub fix_settle_ms: u64,
}

fn default_port_forward_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_establish_window() -> u64 {
    5000
}

fn default_candidate_ports() -> Vec<u16> {
    (8080..=8085).collect()
}

fn default_health_attempts() -> u32 {
    3
}

fn default_health_backoff() -> u64 {
    1000
}

fn default_health_timeout() -> u64 {
    30
}

fn default_healthy_statuses() -> Vec<u16> {
    vec![200, 201, 204]
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_recovery_attempts() -> u32 {
    3
}

fn default_fix_settle() -> u64 {
    200
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            port_forward_timeout_secs: default_port_forward_timeout(),
            establish_window_ms: default_establish_window(),
            candidate_ports: default_candidate_ports(),
            health_attempts: default_health_attempts(),
            health_backoff_ms: default_health_backoff(),
            health_timeout_secs: default_health_timeout(),
            healthy_statuses: default_healthy_statuses(),
            health_path: default_health_path(),
            recovery_max_attempts: default_recovery_attempts(),
            fix_settle_ms: default_fix_settle(),
        }
    }
}

impl VerificationConfig {
    pub fn port_forward_timeout(&self) -> Duration {
        Duration::from_secs(self.port_forward_timeout_secs)
    }

    pub fn establish_window(&self) -> Duration {
        Duration::from_millis(self.establish_window_ms)
    }

    pub fn health_backoff(&self) -> Duration {
        Duration::from_millis(self.health_backoff_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Use the AI client when an API key is available
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
}

fn default_llm_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_llm_max_tokens() -> u32 {
    2048
}

fn default_llm_temperature() -> f32 {
    0.3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write logs to <state>/logs instead of stderr for long-running commands
    #[serde(default = "default_true")]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    7018
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

impl Config {
    /// Project-local config file
    pub fn local_config_path() -> PathBuf {
        PathBuf::from(".stevedore").join("config.toml")
    }

    /// Load configuration from defaults, config files, and environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        let local_config = Self::local_config_path();
        if local_config.exists() {
            builder = builder.add_source(config::File::from(local_config));
        }

        // User config in ~/.config/stevedore/ (optional global overrides)
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("stevedore").join("config.toml");
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // STEVEDORE__PIPELINE__NAMESPACE=apps and friends
        builder = builder.add_source(
            config::Environment::with_prefix("STEVEDORE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Save config to .stevedore/config.toml
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::local_config_path();
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create stevedore config directory")?;
        }

        let toml_str =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(config_path, toml_str).context("Failed to write config file")?;

        Ok(())
    }

    fn resolve(path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        }
    }

    /// Get absolute path to state directory
    pub fn state_path(&self) -> PathBuf {
        Self::resolve(&self.paths.state)
    }

    /// Get absolute path to the session record directory
    pub fn sessions_path(&self) -> PathBuf {
        Self::resolve(&self.paths.sessions)
    }

    /// Get absolute path to the workspace root
    pub fn workspaces_path(&self) -> PathBuf {
        Self::resolve(&self.paths.workspaces)
    }

    /// Get absolute path to logs directory
    pub fn logs_path(&self) -> PathBuf {
        self.state_path().join("logs")
    }

    /// Retry budget for a step, falling back to the step's own default
    pub fn max_retries_for(&self, step: &str, default: u32) -> u32 {
        self.pipeline
            .max_retries
            .get(step)
            .copied()
            .unwrap_or(default)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                state: ".stevedore".to_string(), // Relative to cwd
                sessions: ".stevedore/sessions".to_string(),
                workspaces: ".stevedore/workspaces".to_string(),
            },
            sessions: SessionsConfig {
                ttl_secs: default_session_ttl(),
                max_sessions: default_max_sessions(),
                max_disk_per_session: default_max_disk_per_session(),
                total_disk_limit: default_total_disk_limit(),
                retention_secs: default_retention(),
                deleted_grace_secs: default_deleted_grace(),
                gc_interval_secs: default_gc_interval(),
            },
            pipeline: PipelineConfig {
                complete_loop_max_iterations: default_complete_loop_max_iterations(),
                max_retries: BTreeMap::new(),
                timeout_secs: default_pipeline_timeout(),
                draft_dockerfile: false,
                snapshot: true,
                report: false,
                namespace: default_namespace(),
                registry_url: default_registry(),
                kind_cluster: default_kind_cluster(),
            },
            verification: VerificationConfig::default(),
            llm: LlmConfig::default(),
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
        }
    }
}
