use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stevedore::api::{AiClient, AnthropicClient};
use stevedore::config::Config;
use stevedore::error::WorkflowError;
use stevedore::logging;
use stevedore::pipeline::{ContainerizeRunner, PipelineOptions};
use stevedore::rest;
use stevedore::session::{FilePersistence, SessionStore, StoreSettings};
use stevedore::steps::StepDeps;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(about = "Containerize a repository and deploy it to Kubernetes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the containerize pipeline against a directory or git URL
    Run {
        /// Local directory or git URL
        target: String,

        /// Registry to push to (empty string skips tag and push)
        #[arg(long)]
        registry: Option<String>,

        /// Image name (default: derived from the target)
        #[arg(long)]
        image: Option<String>,

        /// Reuse or create the session with this id
        #[arg(long)]
        session: Option<String>,

        /// Kubernetes namespace to deploy into
        #[arg(short, long)]
        namespace: Option<String>,

        /// Generate a fresh Dockerfile even if the repo has one
        #[arg(long)]
        draft_dockerfile: bool,

        /// Do not checkpoint the workflow after each stage
        #[arg(long)]
        no_snapshot: bool,

        /// Write report.json into the session workspace
        #[arg(long)]
        report: bool,

        /// How many times the pipeline may jump back to an earlier stage
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Per-stage retry budget, e.g. --max-retries build=4 (repeatable)
        #[arg(long = "max-retries", value_parser = parse_retry_budget)]
        max_retries: Vec<(String, u32)>,

        /// Overall pipeline timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Extra context passed to the AI client
        #[arg(long)]
        context: Option<String>,

        /// Labels to attach to the session (repeatable)
        #[arg(short, long)]
        label: Vec<String>,
    },

    /// Inspect and manage sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Write the effective configuration to .stevedore/config.toml
    Init {
        /// Overwrite an existing project config
        #[arg(long)]
        force: bool,
    },

    /// Start the REST API server for session management
    Serve {
        /// Port to listen on (default: 7018)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions, newest first
    List,
    /// Show one session as JSON
    Show { id: String },
    /// Delete a session and its workspace
    Delete { id: String },
    /// Add a label to a session
    Label { id: String, label: String },
    /// Remove a label from a session
    Unlabel { id: String, label: String },
    /// List sessions carrying a label
    ByLabel { label: String },
    /// Aggregate store statistics
    Stats,
    /// Remove expired, finished and deleted sessions now
    Gc,
}

fn parse_retry_budget(s: &str) -> Result<(String, u32), String> {
    let (stage, budget) = s
        .split_once('=')
        .ok_or_else(|| format!("expected STAGE=N, got '{s}'"))?;
    let budget = budget
        .trim()
        .parse()
        .map_err(|_| format!("invalid retry budget '{budget}'"))?;
    Ok((stage.trim().to_string(), budget))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first (needed for logging setup)
    let config = Config::load(cli.config.as_deref())?;

    let long_running = matches!(cli.command, Commands::Run { .. } | Commands::Serve { .. });
    let logging_handle = logging::init_logging(&config, long_running, cli.debug)?;
    if let Some(path) = &logging_handle.log_file_path {
        eprintln!("Logging to {}", path.display());
    }

    if let Commands::Init { force } = cli.command {
        return cmd_init(&config, force);
    }

    let store = open_store(&config)?;

    match cli.command {
        Commands::Run {
            target,
            registry,
            image,
            session,
            namespace,
            draft_dockerfile,
            no_snapshot,
            report,
            max_iterations,
            max_retries,
            timeout_secs,
            context,
            label,
        } => {
            let options = PipelineOptions {
                target,
                registry_url: registry,
                image_name: image,
                session_id: session,
                namespace,
                draft_dockerfile: draft_dockerfile.then_some(true),
                snapshot: no_snapshot.then_some(false),
                report: report.then_some(true),
                max_iterations,
                max_retries: max_retries.into_iter().collect::<BTreeMap<_, _>>(),
                timeout: timeout_secs.map(Duration::from_secs),
                extra_context: context,
                labels: label,
            };
            cmd_run(config, store, options).await?;
        }
        Commands::Sessions { command } => cmd_sessions(&store, command)?,
        Commands::Serve { port } => cmd_serve(config, store, port).await?,
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn cmd_init(config: &Config, force: bool) -> Result<()> {
    if Config::local_config_path().exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            Config::local_config_path().display()
        );
    }
    let path = config.save()?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<SessionStore>> {
    let persistence = FilePersistence::new(config.sessions_path())
        .context("Failed to open session directory")?;
    let store = SessionStore::open(StoreSettings::from_config(config), Arc::new(persistence))
        .context("Failed to open session store")?;
    Ok(Arc::new(store))
}

fn ai_client(config: &Config) -> Result<Option<Arc<dyn AiClient>>> {
    if !config.llm.enabled {
        return Ok(None);
    }
    let client = AnthropicClient::from_env(&config.llm.model)
        .map_err(|e| anyhow::anyhow!("Failed to create AI client: {e}"))?;
    if client.is_none() {
        tracing::info!("No API key configured, running without AI assistance");
    }
    Ok(client.map(|c| Arc::new(c) as Arc<dyn AiClient>))
}

async fn cmd_run(config: Config, store: Arc<SessionStore>, options: PipelineOptions) -> Result<()> {
    let config = Arc::new(config);
    let deps = StepDeps::system(config.clone()).with_ai(ai_client(&config)?);
    let runner = ContainerizeRunner::new(store, deps);

    println!("Containerizing {}", options.target);
    match runner.run(&options).await {
        Ok(state) => {
            println!("Session:  {}", state.session_id);
            if let Some(image) = state.deploy_image_ref() {
                println!("Image:    {image}");
            }
            if let Some(endpoint) = state.k8s_result.as_ref().and_then(|k| k.endpoint.as_deref()) {
                println!("Endpoint: {endpoint}");
            }
            for stage in &state.stage_history {
                let mark = if stage.success { "ok" } else { "failed" };
                println!(
                    "  {:<10} attempt {} {:>6}ms {}",
                    stage.step,
                    stage.attempt,
                    stage.duration_ms.unwrap_or(0),
                    mark
                );
            }
            Ok(())
        }
        Err(err) => {
            if let Some(WorkflowError::DeploymentFailed { attempts, .. }) = deployment_failure(&err) {
                if let Some(last) = attempts.last() {
                    eprintln!("{}", last.diagnostics.report());
                }
            }
            Err(anyhow::anyhow!(err)).context("Containerize pipeline failed")
        }
    }
}

/// The deployment failure wrapped by a failed verify stage, if any
fn deployment_failure(err: &WorkflowError) -> Option<&WorkflowError> {
    match err {
        WorkflowError::DeploymentFailed { .. } => Some(err),
        WorkflowError::StepFailed { source, .. } => deployment_failure(source),
        _ => None,
    }
}

fn cmd_sessions(store: &SessionStore, command: SessionCommands) -> Result<()> {
    match command {
        SessionCommands::List => {
            let summaries = store.list_summaries();
            if summaries.is_empty() {
                println!("No sessions");
            }
            for s in summaries {
                println!(
                    "{:<34} {:<10} {:>3} stages  {}{}",
                    s.session_id,
                    s.status.as_str(),
                    s.stages_completed,
                    s.repo_url.as_deref().unwrap_or("-"),
                    if s.expired { "  (expired)" } else { "" }
                );
            }
        }
        SessionCommands::Show { id } => {
            let session = store.get_session(&id)?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        SessionCommands::Delete { id } => {
            let cancelled = store.delete_session(&id)?;
            println!("Deleted {id} ({} job(s) cancelled)", cancelled.len());
        }
        SessionCommands::Label { id, label } => {
            let session = store.add_label(&id, &label)?;
            println!("{id}: {}", session.labels.iter().cloned().collect::<Vec<_>>().join(", "));
        }
        SessionCommands::Unlabel { id, label } => {
            let session = store.remove_label(&id, &label)?;
            println!("{id}: {}", session.labels.iter().cloned().collect::<Vec<_>>().join(", "));
        }
        SessionCommands::ByLabel { label } => {
            for session in store.get_sessions_by_label(&label)? {
                println!("{:<34} {}", session.session_id, session.status);
            }
        }
        SessionCommands::Stats => {
            println!("{}", serde_json::to_string_pretty(&store.stats())?);
        }
        SessionCommands::Gc => {
            let removed = store.collect_garbage(chrono::Utc::now())?;
            store.flush()?;
            println!("Removed {removed} session(s)");
        }
    }
    Ok(())
}

async fn cmd_serve(config: Config, store: Arc<SessionStore>, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.api.port);

    println!("Starting REST API server...");
    println!("  Port: {}", port);
    println!("  Endpoints:");
    println!("    GET    /api/v1/health                      Health check");
    println!("    GET    /api/v1/sessions                    List sessions");
    println!("    POST   /api/v1/sessions                    Create session");
    println!("    GET    /api/v1/sessions/:id                Get session");
    println!("    DELETE /api/v1/sessions/:id                Delete session");
    println!("    GET    /api/v1/labels/:label/sessions      Sessions by label");
    println!("    GET    /api/v1/stats                       Store statistics");
    println!();

    let mut gc = store.start_gc(Duration::from_secs(config.sessions.gc_interval_secs));
    let state = rest::ApiState::new(store.clone(), config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for shutdown signal: {}", e);
        }
    };
    let served = rest::serve(state, port, shutdown).await;

    gc.stop().await;
    if let Err(e) = store.flush() {
        tracing::warn!("Failed to flush sessions on shutdown: {}", e);
    }
    served
}
