//! Child process supervisor - owns the MCP server subprocess.
//!
//! Lifecycle:
//! 1. `start()` spawns the child and wires stdin (writer task), stdout
//!    (framed reader publishing to the bus) and stderr (logged)
//! 2. A watcher task owns the `Child` and waits for it to exit
//! 3. On exit: publish `ChildExited` once stdout has drained, then restart
//!    after a fixed delay unless the exit code was 0
//! 4. `stop()` kills the child and leaves the supervisor stopped

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Frame, NdjsonCodec};
use crate::bridge::protocol::RpcMessage;
use crate::bus::{BusEvent, MessageBus};
use crate::config::{BridgeConfig, RESTART_DELAY};

/// How long the watcher waits for stdout to drain after the child exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
    pub restart_delay: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            restart_delay: RESTART_DELAY,
        }
    }

    /// `node <entry> <organization> -a <auth type>` with `NODE_ENV=production`.
    pub fn from_bridge(config: &BridgeConfig) -> Self {
        Self::new(config.node_bin.clone(), config.server_args())
            .with_env("NODE_ENV", "production")
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("MCP server is not running")]
    NotRunning,
    #[error("MCP server stdin is closed")]
    Closed,
}

/// Extension point for launching the child (tests substitute `sh`).
pub trait ChildSpawner: Send + Sync {
    fn spawn(&self, config: &SupervisorConfig) -> Result<Child, SpawnError>;
}

/// Spawns `config.program` with all three stdio streams piped.
pub struct CommandSpawner;

impl ChildSpawner for CommandSpawner {
    fn spawn(&self, config: &SupervisorConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&config.program)
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Never started, or the last spawn failed.
    Idle,
    Starting,
    Running,
    /// Child exited on its own. `None` means killed by a signal.
    Exited(Option<i32>),
    /// `stop()` was called.
    Stopped,
}

struct ChildHandle {
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<RpcMessage>,
    kill: CancellationToken,
}

struct Inner {
    state: SupervisorState,
    child: Option<ChildHandle>,
    /// Bumped on every spawn attempt; stale watchers and restarts compare it.
    generation: u64,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    spawner: Arc<dyn ChildSpawner>,
    bus: Arc<MessageBus>,
    inner: StdMutex<Inner>,
    spawn_count: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, bus: Arc<MessageBus>) -> Arc<Self> {
        Self::with_spawner(config, bus, Arc::new(CommandSpawner))
    }

    pub fn with_spawner(
        config: SupervisorConfig,
        bus: Arc<MessageBus>,
        spawner: Arc<dyn ChildSpawner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            spawner,
            bus,
            inner: StdMutex::new(Inner {
                state: SupervisorState::Idle,
                child: None,
                generation: 0,
            }),
            spawn_count: AtomicU64::new(0),
        })
    }

    /// Spawn the child. Does nothing if it is already starting or running.
    ///
    /// Spawn failures leave the supervisor idle and are not retried.
    pub fn start(self: &Arc<Self>) -> Result<(), SpawnError> {
        let mut inner = self.lock();
        if matches!(
            inner.state,
            SupervisorState::Starting | SupervisorState::Running
        ) {
            tracing::debug!("MCP server already running, ignoring start");
            return Ok(());
        }
        self.spawn_locked(&mut inner)
    }

    /// Queue `message` as one line on the child's stdin.
    ///
    /// Dropped (and reported) when no child is running or its stdin is gone.
    pub fn send(&self, message: RpcMessage) -> Result<(), SendError> {
        let inner = self.lock();
        let result = match inner.child.as_ref() {
            None => Err((SendError::NotRunning, message)),
            Some(child) => child
                .stdin_tx
                .send(message)
                .map_err(|rejected| (SendError::Closed, rejected.0)),
        };
        drop(inner);

        result.map_err(|(e, message)| {
            tracing::warn!(
                error = %e,
                method = message.method().unwrap_or("-"),
                "Dropping message for MCP server"
            );
            e
        })
    }

    /// Kill the child and stay stopped until `start()` is called again.
    ///
    /// Pending calls are failed immediately.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.state = SupervisorState::Stopped;
        let child = inner.child.take();
        drop(inner);

        if let Some(child) = child {
            tracing::info!(pid = ?child.pid, "Stopping MCP server");
            child.kill.cancel();
            self.bus.publish(BusEvent::ChildExited { code: None });
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().child.as_ref().and_then(|c| c.pid)
    }

    /// Number of successful spawns so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    fn spawn_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<(), SpawnError> {
        inner.state = SupervisorState::Starting;
        inner.generation += 1;
        let generation = inner.generation;

        tracing::info!(
            program = %self.config.program,
            args = ?self.config.args,
            "Starting MCP server"
        );

        let (child, stdin, stdout, stderr) = match self.spawn_child() {
            Ok(parts) => parts,
            Err(e) => {
                inner.state = SupervisorState::Idle;
                tracing::error!(error = %e, "Failed to start MCP server");
                return Err(e);
            }
        };

        let pid = child.id();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();

        tokio::spawn(write_stdin(stdin, stdin_rx));
        tokio::spawn(log_stderr(stderr));
        let reader = tokio::spawn(read_stdout(stdout, Arc::clone(&self.bus)));
        tokio::spawn(Arc::clone(self).watch(child, reader, kill.clone(), generation));

        inner.child = Some(ChildHandle {
            pid,
            stdin_tx,
            kill,
        });
        inner.state = SupervisorState::Running;
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        tracing::info!(pid = ?pid, "MCP server started");
        Ok(())
    }

    fn spawn_child(&self) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr), SpawnError> {
        // Dropping `child` on a missing pipe kills it (kill_on_drop).
        let mut child = self.spawner.spawn(&self.config)?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;
        Ok((child, stdin, stdout, stderr))
    }

    async fn watch(
        self: Arc<Self>,
        mut child: Child,
        reader: JoinHandle<()>,
        kill: CancellationToken,
        generation: u64,
    ) {
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill.cancelled() => None,
        };

        let code = match status {
            Some(Ok(status)) => status.code(),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to wait for MCP server");
                None
            }
            None => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill MCP server");
                }
                reader.abort();
                tracing::info!("MCP server killed");
                return;
            }
        };

        // Let replies written just before exit reach the bus first.
        if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader)
            .await
            .is_err()
        {
            tracing::warn!("MCP server stdout did not close after exit");
        }

        self.on_exit(generation, code);
    }

    fn on_exit(self: &Arc<Self>, generation: u64, code: Option<i32>) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state == SupervisorState::Stopped {
            // stop() already reported this exit.
            return;
        }
        inner.child = None;
        inner.state = SupervisorState::Exited(code);
        drop(inner);

        tracing::info!(?code, "MCP process exited");
        self.bus.publish(BusEvent::ChildExited { code });

        if code == Some(0) {
            tracing::info!("MCP server exited cleanly, not restarting");
            return;
        }

        let delay = self.config.restart_delay;
        tracing::error!(
            ?code,
            delay_ms = delay.as_millis() as u64,
            "MCP server crashed, scheduling restart"
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.restart(generation);
        });
    }

    fn restart(self: &Arc<Self>, crashed_generation: u64) {
        let mut inner = self.lock();
        if inner.generation != crashed_generation
            || !matches!(inner.state, SupervisorState::Exited(_))
        {
            tracing::debug!("Restart superseded, skipping");
            return;
        }
        tracing::info!("Restarting MCP server");
        // Errors are logged by spawn_locked; spawn failures are not retried.
        let _ = self.spawn_locked(&mut inner);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn write_stdin(stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<RpcMessage>) {
    let mut writer = FramedWrite::new(stdin, NdjsonCodec::new());
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.send(message).await {
            tracing::warn!(error = %e, "Failed to write to MCP server stdin");
            break;
        }
    }
    tracing::debug!("Stdin writer task exiting");
}

async fn read_stdout(stdout: ChildStdout, bus: Arc<MessageBus>) {
    let mut reader = FramedRead::new(stdout, NdjsonCodec::new());
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Frame::Message(message)) => {
                tracing::debug!(target: "mcp_relay::server", line = message.as_str(), "MCP stdout");
                bus.publish(BusEvent::Message(message));
            }
            Ok(Frame::Malformed { line, reason }) => {
                tracing::warn!(%line, %reason, "Undecodable line from MCP server");
            }
            Err(e) => {
                tracing::error!(error = %e, "Error reading MCP server stdout");
                break;
            }
        }
    }
    tracing::debug!("Stdout reader task exiting");
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::warn!(target: "mcp_relay::server", "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Error reading MCP server stderr");
                break;
            }
        }
    }
}
