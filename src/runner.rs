//! External command execution.
//!
//! Every `docker`, `kubectl`, `kind` and `trivy` invocation goes through
//! [`ProcessRunner`]. Children are spawned with `kill_on_drop`, so dropping
//! the future (pipeline timeout, cancelled request) terminates the process.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::WorkflowError;

/// A command to execute
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, then stdin is closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// `program arg1 arg2 ...`, used for logging and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// Successful output with the given stdout (handy for fakes)
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum CommandError {
    #[error("{0} is not installed or not in PATH")]
    NotInstalled(String),

    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("'{command}' exited with status {}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },
}

impl CommandError {
    /// Captured output of a failed command
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl From<CommandError> for WorkflowError {
    fn from(err: CommandError) -> Self {
        match &err {
            CommandError::Failed {
                command, output, ..
            } => WorkflowError::external_with_output(command.clone(), err.to_string(), output),
            // Retrying cannot install a missing binary
            CommandError::NotInstalled(program) => {
                WorkflowError::validation(program.clone(), err.to_string())
            }
            CommandError::Spawn { command, .. } => {
                WorkflowError::external(command.clone(), err.to_string())
            }
        }
    }
}

/// Trait for executing external commands
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion. Non-zero exit is an error carrying the output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Whether a program can be found on PATH
    fn is_available(&self, program: &str) -> bool;
}

/// Runs commands with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    #[instrument(skip_all, fields(command = %spec.display()))]
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(cwd = ?spec.cwd, "Running command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::NotInstalled(spec.program.clone())
            } else {
                CommandError::Spawn {
                    command: spec.display(),
                    message: e.to_string(),
                }
            }
        })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| CommandError::Spawn {
                    command: spec.display(),
                    message: format!("failed to write stdin: {e}"),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CommandError::Spawn {
                command: spec.display(),
                message: e.to_string(),
            })?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        };

        debug!(exit_code = ?result.exit_code, duration = ?result.duration, "Command finished");

        if result.success() {
            Ok(result)
        } else {
            Err(CommandError::Failed {
                command: spec.display(),
                exit_code: result.exit_code,
                output: result.combined(),
            })
        }
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Scripted = Result<CommandOutput, CommandError>;

/// Mock implementation for testing.
///
/// Responses are matched by command-line prefix. Each rule replays its queue
/// in order and keeps returning the last response once the queue is drained.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    /// Every command line executed, in order
    pub command_log: Mutex<Vec<String>>,
    /// Programs reported as missing by `is_available`
    pub missing: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for commands starting with `prefix`
    pub fn on(&self, prefix: &str, response: Scripted) -> &Self {
        let mut rules = lock(&self.rules);
        if let Some((_, queue)) = rules.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(response);
        } else {
            rules.push((prefix.to_string(), VecDeque::from([response])));
        }
        self
    }

    /// Shorthand for a failing command with the given output
    pub fn fail(command: &str, output: &str) -> Scripted {
        Err(CommandError::Failed {
            command: command.to_string(),
            exit_code: Some(1),
            output: output.to_string(),
        })
    }

    pub fn mark_missing(&self, program: &str) {
        lock(&self.missing).push(program.to_string());
    }

    /// Commands executed so far that start with `prefix`
    pub fn calls(&self, prefix: &str) -> Vec<String> {
        lock(&self.command_log)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let line = spec.display();
        lock(&self.command_log).push(line.clone());

        if lock(&self.missing).contains(&spec.program) {
            return Err(CommandError::NotInstalled(spec.program.clone()));
        }

        let mut rules = lock(&self.rules);
        // Longest matching prefix wins
        let rule = rules
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        match rule {
            Some((_, queue)) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::ok(""))),
            Some((_, queue)) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(CommandOutput::ok(""))),
            None => Ok(CommandOutput::ok("")),
        }
    }

    fn is_available(&self, program: &str) -> bool {
        !lock(&self.missing).iter().any(|p| p == program)
    }
}
