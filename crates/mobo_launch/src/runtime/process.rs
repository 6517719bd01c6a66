//! Managed process abstraction

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

/// Identifier of a supervised process, unique per supervisor
pub type HandleId = u64;

/// Exit status of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Still running (or waiting to respawn)
    Pending,
    /// Exited with code 0
    Success,
    /// Exited with a non-zero code
    Failure(i32),
    /// Terminated by a signal
    Killed,
}

impl ExitStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExitStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(0) => ExitStatus::Success,
            Some(code) => ExitStatus::Failure(code),
            None => ExitStatus::Killed,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Pending => write!(f, "pending"),
            ExitStatus::Success => write!(f, "exit code 0"),
            ExitStatus::Failure(code) => write!(f, "exit code {}", code),
            ExitStatus::Killed => write!(f, "killed by signal"),
        }
    }
}

/// Where process output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Through the logger, prefixed with the process name
    #[default]
    Log,
    /// Straight to the terminal
    Screen,
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables layered over the inherited environment
    pub env: IndexMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    pub output: OutputMode,
    /// Restart after exit, waiting this long first
    pub respawn: Option<Duration>,
    /// Failure of this process is fatal to the launch
    pub critical: bool,
}

impl ProcessConfig {
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: IndexMap::new(),
            working_dir: None,
            output: OutputMode::default(),
            respawn: None,
            critical: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Event emitted by a managed process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// Process started
    Started { pid: u32 },
    /// Process output line (stdout or stderr)
    Output { line: String, is_stderr: bool },
    /// Process exited for good
    Exited { status: ExitStatus },
    /// Process exited and will be started again
    Respawning { attempt: u32 },
    /// Process failed to start
    Failed { error: String },
}

/// A [`ProcessEvent`] tagged with its origin
#[derive(Debug, Clone)]
pub struct ProcessMessage {
    pub id: HandleId,
    pub name: String,
    pub event: ProcessEvent,
}

pub type EventSender = mpsc::UnboundedSender<ProcessMessage>;

/// Live state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessState {
    pub pid: Option<u32>,
    pub status: ExitStatus,
    pub restarts: u32,
    /// No further restart will happen
    pub finished: bool,
}

/// Requests sent from the supervisor to a monitor task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopRequest {
    Run,
    /// Do not respawn; the caller has signalled the process
    Stop,
    /// Force-kill now
    Kill,
}

/// Cheap, cloneable view of a supervised process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: HandleId,
    pub name: String,
    pub command_line: String,
    pub critical: bool,
    state: watch::Receiver<ProcessState>,
}

impl ProcessHandle {
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.borrow().pid
    }

    pub fn status(&self) -> ExitStatus {
        self.state.borrow().status
    }

    pub fn restarts(&self) -> u32 {
        self.state.borrow().restarts
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Wait until the process has exited for good
    pub async fn wait(&self) -> ExitStatus {
        let mut state = self.state.clone();
        // A closed channel means the monitor is gone and the last state is final
        let _ = state.wait_for(|s| s.finished).await;
        let current = *state.borrow();
        current.status
    }
}

/// Spawn the OS process and its output readers
fn start_child(config: &ProcessConfig, id: HandleId, events: &EventSender) -> Result<Child, ProcessError> {
    let mut cmd = Command::new(&config.executable);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
        name: config.name.clone(),
        source: e,
    })?;

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, id, config, false, events.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, id, config, true, events.clone());
    }

    Ok(child)
}

fn forward_lines<R>(reader: R, id: HandleId, config: &ProcessConfig, is_stderr: bool, events: EventSender)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let name = config.name.clone();
    let output = config.output;
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match (output, is_stderr) {
                (OutputMode::Log, false) => log::info!("[{}] {}", name, line),
                (OutputMode::Log, true) => log::warn!("[{}] {}", name, line),
                (OutputMode::Screen, false) => println!("[{}] {}", name, line),
                (OutputMode::Screen, true) => eprintln!("[{}] {}", name, line),
            }
            let _ = events.send(ProcessMessage {
                id,
                name: name.clone(),
                event: ProcessEvent::Output { line, is_stderr },
            });
        }
    });
}

/// Resolves once the supervisor asks for at least `level`
async fn requested(stop: &mut watch::Receiver<StopRequest>, level: StopRequest) {
    loop {
        let current = *stop.borrow_and_update();
        let reached = match level {
            StopRequest::Run => true,
            StopRequest::Stop => current != StopRequest::Run,
            StopRequest::Kill => current == StopRequest::Kill,
        };
        if reached {
            return;
        }
        if stop.changed().await.is_err() {
            // Supervisor is gone; kill_on_drop takes over
            std::future::pending::<()>().await;
        }
    }
}

/// Spawn the process and a monitor task that owns it
pub(crate) fn spawn_supervised(
    id: HandleId,
    config: ProcessConfig,
    events: EventSender,
) -> Result<(ProcessHandle, watch::Sender<StopRequest>), ProcessError> {
    log::info!("[{}] Starting: {}", config.name, config.command_line());

    let child = match start_child(&config, id, &events) {
        Ok(child) => child,
        Err(e) => {
            log::error!("[{}] {}", config.name, e);
            let _ = events.send(ProcessMessage {
                id,
                name: config.name.clone(),
                event: ProcessEvent::Failed {
                    error: e.to_string(),
                },
            });
            return Err(e);
        }
    };

    let pid = child.id();
    let (state_tx, state_rx) = watch::channel(ProcessState {
        pid,
        status: ExitStatus::Pending,
        restarts: 0,
        finished: false,
    });
    let (stop_tx, stop_rx) = watch::channel(StopRequest::Run);

    let _ = events.send(ProcessMessage {
        id,
        name: config.name.clone(),
        event: ProcessEvent::Started {
            pid: pid.unwrap_or(0),
        },
    });

    let handle = ProcessHandle {
        id,
        name: config.name.clone(),
        command_line: config.command_line(),
        critical: config.critical,
        state: state_rx,
    };

    tokio::spawn(monitor(id, config, child, state_tx, stop_rx, events));

    Ok((handle, stop_tx))
}

/// Waits on the child, respawning it until stopped or its policy says no
async fn monitor(
    id: HandleId,
    config: ProcessConfig,
    mut child: Child,
    state_tx: watch::Sender<ProcessState>,
    mut stop_rx: watch::Receiver<StopRequest>,
    events: EventSender,
) {
    let send = |event: ProcessEvent| {
        let _ = events.send(ProcessMessage {
            id,
            name: config.name.clone(),
            event,
        });
    };

    loop {
        let exited = tokio::select! {
            result = child.wait() => Some(result),
            _ = requested(&mut stop_rx, StopRequest::Kill) => None,
        };

        let status = match exited {
            Some(Ok(status)) => ExitStatus::from(status),
            Some(Err(e)) => {
                log::error!("[{}] Error waiting for process: {}", config.name, e);
                ExitStatus::Killed
            }
            None => {
                log::warn!("[{}] Forcing kill", config.name);
                if let Err(e) = child.kill().await {
                    log::error!("[{}] Failed to kill process: {}", config.name, e);
                }
                ExitStatus::Killed
            }
        };

        let stopping = *stop_rx.borrow() != StopRequest::Run;
        let delay = match config.respawn {
            Some(delay) if !stopping => delay,
            _ => {
                log::info!("[{}] Process exited ({})", config.name, status);
                state_tx.send_modify(|s| {
                    s.pid = None;
                    s.status = status;
                    s.finished = true;
                });
                send(ProcessEvent::Exited { status });
                return;
            }
        };

        let mut attempt = 0;
        state_tx.send_modify(|s| {
            s.pid = None;
            s.status = ExitStatus::Pending;
            s.restarts += 1;
            attempt = s.restarts;
        });
        log::warn!(
            "[{}] Process exited ({}), respawning in {:?} (attempt {})",
            config.name,
            status,
            delay,
            attempt
        );
        send(ProcessEvent::Respawning { attempt });

        let stopped = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = requested(&mut stop_rx, StopRequest::Stop) => true,
        };
        if stopped {
            state_tx.send_modify(|s| {
                s.status = status;
                s.finished = true;
            });
            send(ProcessEvent::Exited { status });
            return;
        }

        match start_child(&config, id, &events) {
            Ok(new_child) => {
                let pid = new_child.id();
                child = new_child;
                state_tx.send_modify(|s| s.pid = pid);
                send(ProcessEvent::Started {
                    pid: pid.unwrap_or(0),
                });
            }
            Err(e) => {
                log::error!("[{}] {}", config.name, e);
                state_tx.send_modify(|s| {
                    s.status = status;
                    s.finished = true;
                });
                send(ProcessEvent::Failed {
                    error: e.to_string(),
                });
                send(ProcessEvent::Exited { status });
                return;
            }
        }
    }
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown process handle {0}")]
    UnknownHandle(HandleId),
}
