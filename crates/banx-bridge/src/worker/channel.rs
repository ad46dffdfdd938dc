//! Worker channel - owns the computation worker subprocess and its event loop.
//!
//! Flow:
//! 1. Spawn worker subprocess
//! 2. `execute` registers a pending request, then writes one JSON line
//! 3. Event loop routes responses to pending requests by `msgId`
//! 4. Per-request timers reject requests the worker never answers
//! 5. On worker exit: respawn and rewire, leaving pending requests to their timers

use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::bridge::codec::JsonLineCodec;
use crate::bridge::protocol::{MsgId, WorkerRequest, WorkerResponse};

use super::id::IdGenerator;
use super::spawner::{CommandSpawner, SpawnError, WorkerSpawner};

/// Default time a request may wait for its response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Variable bindings returned by a successful execution.
pub type Variables = serde_json::Map<String, serde_json::Value>;

type WorkerWriter = FramedWrite<ChildStdin, JsonLineCodec<WorkerRequest>>;
type WorkerReader = FramedRead<ChildStdout, JsonLineCodec<WorkerResponse>>;
type Reply = oneshot::Sender<Result<Variables, ExecuteError>>;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("worker error: {0}")]
    Worker(String),
    #[error("a timeout occurred waiting for the worker")]
    Timeout,
    #[error("failed to send request to worker: {0}")]
    Send(#[source] io::Error),
    #[error("worker channel closed")]
    Closed,
    #[error("worker returned a non-object result: {0}")]
    UnexpectedResult(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker {0} not captured")]
    Pipe(&'static str),
}

/// Lifecycle of the current worker subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// A replacement subprocess is being spawned.
    Starting,
    Running,
    Exited,
}

/// Snapshot of the worker subprocess, published on every lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Number of replacement subprocesses spawned so far.
    pub restarts: u64,
}

pub struct WorkerConfig {
    pub response_timeout: Duration,
    /// Delay before retrying a respawn that failed to start.
    pub respawn_backoff: Duration,
    /// Time allowed between SIGTERM and SIGKILL on shutdown.
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl WorkerConfig {
    pub fn new(program: impl Into<std::path::PathBuf>) -> Self {
        Self::with_spawner(Arc::new(CommandSpawner::new(program)))
    }

    pub fn with_spawner(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            respawn_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            spawner,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_respawn_backoff(mut self, backoff: Duration) -> Self {
        self.respawn_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

enum Command {
    Register { msg_id: MsgId, reply: Reply },
    /// The request never reached the worker; drop it without resolving.
    Forget { msg_id: MsgId },
}

/// Request/response channel to one persistent worker subprocess.
///
/// Cheap to share behind an `Arc`; every caller goes through the same
/// serialized writer. Dropping the channel terminates the subprocess.
pub struct WorkerChannel {
    ids: StdMutex<IdGenerator>,
    writer: Arc<Mutex<Option<WorkerWriter>>>,
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<WorkerStatus>,
    shutdown: CancellationToken,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerChannel {
    /// Spawn the worker and start the event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: WorkerConfig) -> Result<Self, WorkerError> {
        tracing::info!("Spawning worker subprocess");
        let (child, writer, reader) = spawn_piped(config.spawner.as_ref())?;
        let pid = child.id();
        tracing::info!(?pid, "Worker subprocess running");

        let writer = Arc::new(Mutex::new(Some(writer)));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(WorkerStatus {
            state: WorkerState::Running,
            pid,
            restarts: 0,
        });
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop {
            config,
            writer: Arc::clone(&writer),
            commands: commands_rx,
            status: status_tx,
            shutdown: shutdown.clone(),
            pending: HashMap::new(),
            timeouts: DelayQueue::new(),
        };
        let handle = tokio::spawn(event_loop.run(child, reader));

        Ok(Self {
            ids: StdMutex::new(IdGenerator::new()),
            writer,
            commands,
            status_rx,
            shutdown,
            event_loop: StdMutex::new(Some(handle)),
        })
    }

    /// Run `code` on the worker and return the variables it left in scope.
    pub async fn execute(&self, code: &str) -> Result<Variables, ExecuteError> {
        let msg_id = self.next_id();
        let (reply, response) = oneshot::channel();

        self.commands
            .send(Command::Register {
                msg_id: msg_id.clone(),
                reply,
            })
            .map_err(|_| ExecuteError::Closed)?;

        tracing::debug!(%msg_id, code_len = code.len(), "Dispatching code to worker");
        let request = WorkerRequest {
            msg_id: msg_id.clone(),
            code: code.to_string(),
        };
        if let Err(e) = self.send(request).await {
            let _ = self.commands.send(Command::Forget { msg_id });
            return Err(e);
        }

        response.await.map_err(|_| ExecuteError::Closed)?
    }

    /// Write one request, waiting until the pipe has taken all of it.
    async fn send(&self, request: WorkerRequest) -> Result<(), ExecuteError> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            if self.shutdown.is_cancelled() {
                return Err(ExecuteError::Closed);
            }
            return Err(ExecuteError::Send(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker is restarting",
            )));
        };
        writer.send(request).await.map_err(ExecuteError::Send)
    }

    fn next_id(&self) -> MsgId {
        match self.ids.lock() {
            Ok(mut ids) => ids.next_id(),
            Err(poisoned) => {
                tracing::error!("Id generator mutex poisoned - recovering");
                poisoned.into_inner().next_id()
            }
        }
    }

    /// Watch the worker subprocess lifecycle.
    pub fn status(&self) -> watch::Receiver<WorkerStatus> {
        self.status_rx.clone()
    }

    /// Terminate the worker and reject every pending request.
    ///
    /// Idempotent; later `execute` calls fail with [`ExecuteError::Closed`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = match self.event_loop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Worker event loop panicked");
        }
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_piped(
    spawner: &dyn WorkerSpawner,
) -> Result<(Child, WorkerWriter, WorkerReader), WorkerError> {
    let mut child = spawner.spawn()?;
    let stdin = child.stdin.take().ok_or(WorkerError::Pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(WorkerError::Pipe("stdout"))?;
    Ok((
        child,
        FramedWrite::new(stdin, JsonLineCodec::new()),
        FramedRead::new(stdout, JsonLineCodec::new()),
    ))
}

struct Pending {
    reply: Reply,
    timeout: delay_queue::Key,
}

/// State owned exclusively by the event loop task.
struct EventLoop {
    config: WorkerConfig,
    writer: Arc<Mutex<Option<WorkerWriter>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<WorkerStatus>,
    shutdown: CancellationToken,
    pending: HashMap<MsgId, Pending>,
    timeouts: DelayQueue<MsgId>,
}

impl EventLoop {
    async fn run(mut self, child: Child, reader: WorkerReader) {
        let mut child = Some(child);
        let mut reader = Some(reader);
        // Output of an exited worker, read to EOF so its last responses still count.
        let mut retired: Option<WorkerReader> = None;
        let mut respawn_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                // Registrations go first so a response can never overtake them.
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                response = next_response(&mut reader) => match response {
                    Some(Ok(response)) => self.resolve(response),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Worker stdout error");
                        reader = None;
                    }
                    None => {
                        tracing::debug!("Worker stdout closed");
                        reader = None;
                    }
                },

                response = next_response(&mut retired) => match response {
                    Some(Ok(response)) => self.resolve(response),
                    Some(Err(_)) | None => retired = None,
                },

                Some(expired) = self.timeouts.next(), if !self.timeouts.is_empty() => {
                    self.expire(expired.into_inner());
                }

                status = wait_child(&mut child) => {
                    self.on_exit(status);
                    child = None;
                    retired = reader.take();
                    *self.writer.lock().await = None;
                    respawn_at = Some(Instant::now());
                }

                _ = sleep_until(respawn_at) => {
                    self.status.send_modify(|s| {
                        s.state = WorkerState::Starting;
                        s.pid = None;
                    });
                    match spawn_piped(self.config.spawner.as_ref()) {
                        Ok((new_child, writer, new_reader)) => {
                            let pid = new_child.id();
                            *self.writer.lock().await = Some(writer);
                            child = Some(new_child);
                            reader = Some(new_reader);
                            respawn_at = None;
                            self.status.send_modify(|s| {
                                s.state = WorkerState::Running;
                                s.pid = pid;
                                s.restarts += 1;
                            });
                            tracing::info!(?pid, "Worker subprocess respawned");
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                backoff_ms = self.config.respawn_backoff.as_millis() as u64,
                                "Failed to respawn worker"
                            );
                            self.status.send_modify(|s| s.state = WorkerState::Exited);
                            respawn_at = Some(Instant::now() + self.config.respawn_backoff);
                        }
                    }
                }
            }
        }

        self.close(child).await;
        tracing::info!("Worker event loop exiting");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { msg_id, reply } => {
                let timeout = self
                    .timeouts
                    .insert(msg_id.clone(), self.config.response_timeout);
                let previous = self.pending.insert(msg_id.clone(), Pending { reply, timeout });
                if let Some(previous) = previous {
                    tracing::error!(%msg_id, "Duplicate correlation id - closing older request");
                    self.timeouts.remove(&previous.timeout);
                    let _ = previous.reply.send(Err(ExecuteError::Closed));
                }
                tracing::trace!(%msg_id, pending = self.pending.len(), "Registered request");
            }
            Command::Forget { msg_id } => {
                if let Some(pending) = self.pending.remove(&msg_id) {
                    self.timeouts.remove(&pending.timeout);
                }
            }
        }
    }

    fn resolve(&mut self, response: WorkerResponse) {
        let Some(pending) = self.pending.remove(&response.msg_id) else {
            tracing::debug!(
                msg_id = %response.msg_id,
                "Discarding response with no pending request"
            );
            return;
        };
        self.timeouts.remove(&pending.timeout);

        let outcome = if response.error {
            Err(ExecuteError::Worker(response.error_message()))
        } else {
            match response.result {
                serde_json::Value::Object(variables) => Ok(variables),
                other => Err(ExecuteError::UnexpectedResult(other.to_string())),
            }
        };
        tracing::debug!(msg_id = %response.msg_id, ok = outcome.is_ok(), "Resolved request");
        if pending.reply.send(outcome).is_err() {
            tracing::debug!(msg_id = %response.msg_id, "Caller gone before response arrived");
        }
    }

    fn expire(&mut self, msg_id: MsgId) {
        if let Some(pending) = self.pending.remove(&msg_id) {
            tracing::warn!(
                %msg_id,
                timeout_ms = self.config.response_timeout.as_millis() as u64,
                "Worker request timed out"
            );
            let _ = pending.reply.send(Err(ExecuteError::Timeout));
        }
    }

    fn on_exit(&mut self, status: io::Result<ExitStatus>) {
        match status {
            Ok(status) => tracing::warn!(%status, "Worker subprocess exited"),
            Err(e) => tracing::error!(error = %e, "Failed to wait for worker subprocess"),
        }
        // Requests already sent stay pending until their own timers fire.
        if !self.pending.is_empty() {
            tracing::warn!(
                pending = self.pending.len(),
                "Requests in flight at worker exit will time out"
            );
        }
        self.status.send_modify(|s| {
            s.state = WorkerState::Exited;
            s.pid = None;
        });
    }

    async fn close(&mut self, child: Option<Child>) {
        if let Some(child) = child {
            terminate(child, self.config.shutdown_grace).await;
        }
        *self.writer.lock().await = None;

        for (msg_id, pending) in self.pending.drain() {
            tracing::debug!(%msg_id, "Closing pending request");
            let _ = pending.reply.send(Err(ExecuteError::Closed));
        }
        self.timeouts.clear();
        self.status.send_modify(|s| {
            s.state = WorkerState::Exited;
            s.pid = None;
        });
    }
}

async fn next_response(reader: &mut Option<WorkerReader>) -> Option<io::Result<WorkerResponse>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_child(child: &mut Option<Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM, then SIGKILL if the worker outlives `grace`.
async fn terminate(mut child: Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "Failed to send SIGTERM to worker");
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(pid, %status, "Worker subprocess terminated");
                    return;
                }
                Ok(Err(e)) => tracing::warn!(pid, error = %e, "Failed to wait for worker"),
                Err(_) => tracing::warn!(pid, "Worker ignored SIGTERM, killing"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker subprocess");
    }
}
