use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use sockswatch_config::{Config, ServerId, ServerSpec, expand_tilde};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("SSH client binary '{binary}' was not found")]
    BinaryNotFound { binary: String },
    #[error("Failed to spawn SSH process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to terminate SSH process {pid}: {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// How a tunnel process ended, as far as the supervisor needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process was running and has been killed.
    Killed,
    /// Nothing to do: the process had already exited or was terminated before.
    AlreadyExited,
}

/// A handle to one spawned tunnel process, tagged with the generation it was spawned for.
///
/// Termination always goes through the handle, never through a process-table search.
#[derive(Debug)]
pub struct ProcessHandle {
    server: ServerId,
    generation: u64,
    pid: Option<u32>,
    child: Option<Child>,
    alive: bool,
}

impl ProcessHandle {
    pub fn from_child(server: ServerId, generation: u64, child: Child) -> Self {
        Self {
            server,
            generation,
            pid: child.id(),
            child: Some(child),
            alive: true,
        }
    }

    /// A handle for a process whose lifetime the launcher tracks itself.
    pub fn detached(server: ServerId, generation: u64, pid: Option<u32>) -> Self {
        Self {
            server,
            generation,
            pid,
            child: None,
            alive: true,
        }
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Records that the process is gone and releases the owned child, if any.
    pub fn mark_exited(&mut self) {
        self.alive = false;
        self.child = None;
    }

    fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }
}

#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub ssh_binary: PathBuf,
    pub server_alive_interval: u32,
    pub server_alive_count_max: u32,
    pub extra_args: Vec<String>,
    pub terminate_grace: Duration,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            server_alive_interval: 60,
            server_alive_count_max: 5,
            extra_args: Vec::new(),
            terminate_grace: Duration::from_millis(1500),
        }
    }
}

impl LauncherSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let ssh_binary = config
            .ssh_binary
            .as_deref()
            .and_then(expand_tilde)
            .unwrap_or(defaults.ssh_binary);
        Self {
            ssh_binary,
            server_alive_interval: config
                .server_alive_interval
                .unwrap_or(defaults.server_alive_interval),
            server_alive_count_max: config
                .server_alive_count_max
                .unwrap_or(defaults.server_alive_count_max),
            extra_args: config.ssh_extra_args.clone().unwrap_or_default(),
            terminate_grace: config
                .terminate_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.terminate_grace),
        }
    }
}

/// Starts and stops the external client process behind each tunnel.
///
/// Implementations never retry: a failed spawn is reported once and the
/// caller decides what happens next.
#[async_trait]
pub trait TunnelLauncher: Send + Sync + 'static {
    async fn spawn(&self, spec: &ServerSpec, generation: u64) -> Result<ProcessHandle, SshError>;

    /// Terminates exactly the process behind `handle`. Terminating a handle
    /// whose process is already gone is a no-op.
    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<TerminateOutcome, SshError>;

    /// Non-blocking check whether the process exited on its own.
    fn check_exit(&self, handle: &mut ProcessHandle) -> Option<ExitInfo>;
}

/// Arguments for a dynamic (SOCKS) forward on `spec.port` through `spec.host`.
pub fn ssh_args(spec: &ServerSpec, settings: &LauncherSettings) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-D".to_string(),
        spec.port.to_string(),
        "-o".to_string(),
        format!("ServerAliveInterval={}", settings.server_alive_interval),
        "-o".to_string(),
        format!("ServerAliveCountMax={}", settings.server_alive_count_max),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
    ];
    args.extend(settings.extra_args.iter().cloned());
    args.push(spec.host.clone());
    args
}

pub struct SshLauncher {
    settings: LauncherSettings,
}

impl SshLauncher {
    pub fn new(config: &Config) -> Self {
        Self::with_settings(LauncherSettings::from_config(config))
    }

    pub fn with_settings(settings: LauncherSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// The full command line `spawn` would run, for display.
    pub fn command_line(&self, spec: &ServerSpec) -> String {
        let mut parts = vec![self.settings.ssh_binary.to_string_lossy().into_owned()];
        parts.extend(ssh_args(spec, &self.settings));
        parts.join(" ")
    }
}

async fn forward_stderr(server: ServerId, generation: u64, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(server = %server, generation, "[ssh] {}", line);
    }
}

#[async_trait]
impl TunnelLauncher for SshLauncher {
    async fn spawn(&self, spec: &ServerSpec, generation: u64) -> Result<ProcessHandle, SshError> {
        let mut cmd = Command::new(&self.settings.ssh_binary);
        cmd.args(ssh_args(spec, &self.settings))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(server = %spec.id, generation, "Spawning SSH command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => SshError::BinaryNotFound {
                binary: self.settings.ssh_binary.to_string_lossy().into_owned(),
            },
            _ => SshError::Spawn(e),
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(spec.id, generation, stderr));
        }

        let handle = ProcessHandle::from_child(spec.id, generation, child);
        debug!(server = %spec.id, generation, pid = ?handle.pid(), "SSH process started");
        Ok(handle)
    }

    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<TerminateOutcome, SshError> {
        let pid = handle.pid().unwrap_or_default();
        let server = handle.server();
        let generation = handle.generation();
        let Some(child) = handle.child_mut() else {
            handle.mark_exited();
            return Ok(TerminateOutcome::AlreadyExited);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, "SSH process had already exited ({})", status);
                handle.mark_exited();
                return Ok(TerminateOutcome::AlreadyExited);
            }
            Ok(None) => {}
            Err(source) => return Err(SshError::Terminate { pid, source }),
        }

        info!(pid, server = %server, generation, "Terminating SSH process");
        if let Err(source) = child.start_kill() {
            if source.kind() == ErrorKind::InvalidInput {
                handle.mark_exited();
                return Ok(TerminateOutcome::AlreadyExited);
            }
            return Err(SshError::Terminate { pid, source });
        }

        // Reaping is best effort. A child that outlives the grace period is
        // dropped and left to the runtime's orphan reaper.
        match tokio::time::timeout(self.settings.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(pid, "SSH process reaped ({})", status),
            Ok(Err(e)) => warn!(pid, "Failed to reap SSH process: {}", e),
            Err(_) => warn!(pid, "SSH process not reaped within {:?}", self.settings.terminate_grace),
        }
        handle.mark_exited();
        Ok(TerminateOutcome::Killed)
    }

    fn check_exit(&self, handle: &mut ProcessHandle) -> Option<ExitInfo> {
        let polled = handle.child_mut()?.try_wait();
        let status = match polled {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                warn!(pid = ?handle.pid(), "Failed to poll SSH process: {}", e);
                return None;
            }
        };
        handle.mark_exited();
        Some(ExitInfo { code: status.code() })
    }
}
