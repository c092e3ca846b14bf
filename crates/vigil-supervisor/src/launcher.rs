use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

/// What the supervisor needs launched; everything else about process
/// construction belongs to the collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub task_id: String,
    pub model: String,
    pub provider: String,
    pub prompt: String,
    /// Session to resume; the new invocation inherits its conversation.
    pub resume_session: Option<String>,
    pub workdir: Option<PathBuf>,
}

/// A ready-to-supervise subprocess handle.
///
/// Contract: stdout carries the agent's combined output stream, stdin is
/// piped for line-terminated answers, and the child is configured to die
/// with its handle (`kill_on_drop`).
#[derive(Debug)]
pub struct LaunchedAgent {
    pub child: Child,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Why the launch collaborator could not produce a usable subprocess.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn agent subprocess: {0}")]
    Spawn(String),
    #[error("agent subprocess misconfigured: {0}")]
    Misconfigured(String),
}

/// Supplies ready-to-supervise subprocess handles; executable
/// resolution, argument quoting, and environment construction all live
/// behind this boundary.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedAgent, LaunchError>;
}

/// Minimal launcher that runs a fixed executable and hands the spec over
/// via environment variables, sidestepping argument quoting entirely.
/// Production hosts supply their own launcher; this one primarily backs
/// the integration suite's script agents.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }
}

#[async_trait]
impl AgentLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedAgent, LaunchError> {
        let workdir = spec
            .workdir
            .clone()
            .or_else(|| self.workdir.clone())
            .or_else(|| std::env::current_dir().ok())
            .ok_or_else(|| LaunchError::Misconfigured("no working directory".to_string()))?;

        let mut env = self.env.clone();
        env.insert("VIGIL_TASK_ID".to_string(), spec.task_id.clone());
        env.insert("VIGIL_MODEL".to_string(), spec.model.clone());
        env.insert("VIGIL_PROVIDER".to_string(), spec.provider.clone());
        env.insert("VIGIL_PROMPT".to_string(), spec.prompt.clone());
        if let Some(session) = &spec.resume_session {
            env.insert("VIGIL_RESUME_SESSION".to_string(), session.clone());
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&env)
            .current_dir(&workdir)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        debug!(program = %self.program.display(), model = %spec.model, "spawning agent subprocess");
        let child = command
            .spawn()
            .map_err(|error| LaunchError::Spawn(error.to_string()))?;

        Ok(LaunchedAgent {
            child,
            workdir,
            env,
        })
    }
}
