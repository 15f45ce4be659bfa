//! One submitted command: its shell process, replay buffer and observers.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──first attach──▶ Running ──process exit──▶ Succeeded | Failed
//! ```
//!
//! A task is created when a command is submitted but its process is only
//! spawned when the first observer attaches. Starting happens under the task
//! lock and is guarded by `started`, so any number of concurrent attaches
//! produce exactly one process. After the lock is released the task spawns
//! one reader unit per output pipe (through the [`UnitLimiter`]) and a
//! watcher that waits for the exit status.
//!
//! Every output line goes into the [`LogBuffer`] and to each live observer.
//! Observers are bounded channels and readers wait for room, so a slow
//! observer slows the task down instead of losing output. Deliveries are
//! serialized by the fan-out lock, which keeps every observer's view in the
//! same order. An observer whose receiver is gone is dropped without
//! affecting the others. When the process exits the watcher publishes a
//! banner, sends every observer the final [`TaskOutcome`], releases them and
//! removes the task from the registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::buffer::LogBuffer;
use super::TaskRegistry;
use crate::limiter::UnitLimiter;
use crate::shell::process::{self, ShellError};

/// Queue depth per observer. Larger than the replay buffer so a fresh
/// observer can always take the full replay without waiting.
pub const OBSERVER_QUEUE: usize = 1024;

/// How long the watcher waits after exit for readers that make no progress.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(5);

pub const SUCCESS_BANNER: &str = "=============== command exited normally ===============";

fn failure_banner(detail: Option<&str>) -> String {
    match detail {
        Some(d) => format!("=============== command exited abnormally ({d}) ==============="),
        None => "=============== command exited abnormally ===============".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to initialize task: {0}")]
    Init(#[source] ShellError),
    #[error("failed to start task: {0}")]
    Start(#[source] ShellError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Terminal result handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub exit_code: Option<i32>,
}

impl TaskOutcome {
    /// Short notice suitable for a close reason.
    pub fn notice(&self) -> String {
        match (self.state, self.exit_code) {
            (TaskState::Succeeded, _) => "task succeeded".to_string(),
            (_, Some(code)) => format!("task failed with exit code {code}"),
            _ => "task failed".to_string(),
        }
    }
}

/// Messages delivered to an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    Line(String),
    /// Last event; the sender is dropped right after.
    Finished(TaskOutcome),
}

/// Sending half of an observer subscription.
pub struct Observer {
    tx: mpsc::Sender<ObserverEvent>,
}

impl Observer {
    pub fn channel() -> (Self, mpsc::Receiver<ObserverEvent>) {
        let (tx, rx) = mpsc::channel(OBSERVER_QUEUE);
        (Self { tx }, rx)
    }

    /// Queue a replayed event. A fresh queue always has room for the whole
    /// replay, so `false` only means the receiver is gone.
    fn replay(&self, event: ObserverEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

type ObserverTx = mpsc::Sender<ObserverEvent>;

/// Send `event` to every target, waiting for queue room. Returns the targets
/// whose receiver is gone.
async fn deliver_all(targets: &[ObserverTx], event: &ObserverEvent) -> Vec<ObserverTx> {
    let sends = targets.iter().map(|tx| async move {
        tx.send(event.clone()).await.map_err(|_| tx.clone())
    });
    futures::future::join_all(sends)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
}

struct TaskInner {
    state: TaskState,
    exit_code: Option<i32>,
    started: bool,
    finished: bool,
    buffer: LogBuffer,
    observers: Vec<ObserverTx>,
}

impl TaskInner {
    fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            state: self.state,
            exit_code: self.exit_code,
        }
    }

    /// Mark the task finished with `banner` as its last line and hand back
    /// the observers still subscribed.
    fn close(
        &mut self,
        state: TaskState,
        exit_code: Option<i32>,
        banner: String,
    ) -> (Vec<ObserverTx>, TaskOutcome) {
        self.buffer.push(banner);
        self.state = state;
        self.exit_code = exit_code;
        self.finished = true;
        (std::mem::take(&mut self.observers), self.outcome())
    }
}

/// A submitted command.
pub struct Task {
    id: String,
    shell: PathBuf,
    command: String,
    /// Held while a line or the final outcome is delivered.
    fanout: Mutex<()>,
    inner: Mutex<TaskInner>,
}

impl Task {
    /// Build a task around an already-resolved shell path.
    pub fn new(id: String, shell: PathBuf, command: String) -> Self {
        Self {
            id,
            shell,
            command,
            fanout: Mutex::new(()),
            inner: Mutex::new(TaskInner {
                state: TaskState::Created,
                exit_code: None,
                started: false,
                finished: false,
                buffer: LogBuffer::default(),
                observers: Vec::new(),
            }),
        }
    }

    /// Resolve `shell` and prepare `<shell> -c <command>`. Nothing is spawned.
    pub fn create(id: String, command: String, shell: &str) -> Result<Self, TaskError> {
        let shell = process::resolve_shell(shell).map_err(TaskError::Init)?;
        Ok(Self::new(id, shell, command))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn state(&self) -> TaskState {
        self.inner.lock().await.state
    }

    pub async fn exit_code(&self) -> Option<i32> {
        self.inner.lock().await.exit_code
    }

    pub async fn is_started(&self) -> bool {
        self.inner.lock().await.started
    }

    pub async fn observer_count(&self) -> usize {
        self.inner.lock().await.observers.len()
    }

    async fn lines_pushed(&self) -> u64 {
        self.inner.lock().await.buffer.pushed()
    }

    /// Snapshot of the replay buffer.
    pub async fn replay(&self) -> Vec<String> {
        self.inner.lock().await.buffer.iter().cloned().collect()
    }

    /// Subscribe `observer`, replaying the buffer first, and start the process
    /// if this is the first attach.
    ///
    /// On a finished task the observer gets the replay and the outcome and is
    /// released immediately. A start failure finishes the task as `Failed`,
    /// removes it from `registry` and is returned to the caller.
    pub async fn attach(
        self: &Arc<Self>,
        observer: Observer,
        registry: &TaskRegistry,
        limiter: &UnitLimiter,
    ) -> Result<(), TaskError> {
        let mut child = {
            let mut inner = self.inner.lock().await;
            if inner.buffer.evicted() > 0 {
                debug!(task_id = %self.id, evicted = inner.buffer.evicted(), "replay starts mid-output");
            }
            for line in inner.buffer.iter() {
                if !observer.replay(ObserverEvent::Line(line.clone())) {
                    return Ok(());
                }
            }
            if inner.finished {
                observer.replay(ObserverEvent::Finished(inner.outcome()));
                return Ok(());
            }
            inner.observers.push(observer.tx);
            if inner.started {
                return Ok(());
            }
            match process::spawn_command(&self.shell, &self.command) {
                Ok(child) => {
                    inner.started = true;
                    inner.state = TaskState::Running;
                    child
                }
                Err(e) => {
                    error!(task_id = %self.id, "task failed to start: {e}");
                    let banner = failure_banner(Some(&e.to_string()));
                    let (targets, outcome) = inner.close(TaskState::Failed, None, banner.clone());
                    drop(inner);
                    // No readers exist yet, so nothing else is delivering.
                    deliver_all(&targets, &ObserverEvent::Line(banner)).await;
                    deliver_all(&targets, &ObserverEvent::Finished(outcome)).await;
                    registry.delete(&self.id).await;
                    return Err(TaskError::Start(e));
                }
            }
        };

        info!(task_id = %self.id, pid = ?child.id(), command = %self.command, "task started");

        // Readers may wait on this observer's queue, so admission happens off
        // the caller. Watchers are bounded by registry capacity, one per
        // started task.
        tokio::spawn(Arc::clone(self).supervise(child, limiter.clone(), registry.clone()));
        Ok(())
    }

    async fn supervise(self: Arc<Self>, mut child: Child, limiter: UnitLimiter, registry: TaskRegistry) {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.extend(self.spawn_reader(stdout, &limiter).await);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.extend(self.spawn_reader(stderr, &limiter).await);
        }
        self.watch(child, readers, registry).await;
    }

    async fn spawn_reader<R>(self: &Arc<Self>, stream: R, limiter: &UnitLimiter) -> Option<JoinHandle<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        match limiter.spawn(Arc::clone(self).read_lines(stream)).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(task_id = %self.id, "cannot spawn output reader: {e}");
                None
            }
        }
    }

    async fn read_lines<R>(self: Arc<Self>, stream: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut scratch = Vec::new();
        while let Some(line) = process::next_line(&mut reader, &mut scratch).await {
            self.broadcast(line).await;
        }
    }

    /// Append a line to the buffer and send it to every live observer,
    /// waiting for room in each queue.
    pub async fn broadcast(&self, line: String) {
        let _order = self.fanout.lock().await;
        let targets = {
            let mut inner = self.inner.lock().await;
            inner.buffer.push(line.clone());
            inner.observers.clone()
        };
        let gone = deliver_all(&targets, &ObserverEvent::Line(line)).await;
        if !gone.is_empty() {
            warn!(task_id = %self.id, count = gone.len(), "dropping observers that went away");
            self.inner
                .lock()
                .await
                .observers
                .retain(|tx| !gone.iter().any(|g| g.same_channel(tx)));
        }
    }

    /// Publish the banner and the outcome, then release every observer.
    async fn finish(&self, state: TaskState, exit_code: Option<i32>, banner: String) {
        let _order = self.fanout.lock().await;
        let (targets, outcome) = self.inner.lock().await.close(state, exit_code, banner.clone());
        deliver_all(&targets, &ObserverEvent::Line(banner)).await;
        deliver_all(&targets, &ObserverEvent::Finished(outcome)).await;
    }

    async fn watch(self: Arc<Self>, mut child: Child, readers: Vec<JoinHandle<()>>, registry: TaskRegistry) {
        let status = child.wait().await;

        // Readers still delivering to slow observers keep the task open; a
        // pipe held by a lingering grandchild with no output does not.
        let mut drain = std::pin::pin!(futures::future::join_all(readers));
        let mut seen = self.lines_pushed().await;
        while tokio::time::timeout(READER_DRAIN_GRACE, drain.as_mut()).await.is_err() {
            let now = self.lines_pushed().await;
            if now == seen {
                warn!(task_id = %self.id, "output still open after exit, finishing anyway");
                break;
            }
            seen = now;
        }

        let (state, exit_code, banner) = match status {
            Ok(s) if s.success() => (TaskState::Succeeded, Some(0), SUCCESS_BANNER.to_string()),
            Ok(s) => (
                TaskState::Failed,
                s.code(),
                failure_banner(Some(&process::describe_exit(s))),
            ),
            Err(e) => {
                error!(task_id = %self.id, "waiting for task failed: {e}");
                (TaskState::Failed, None, failure_banner(None))
            }
        };

        self.finish(state, exit_code, banner).await;
        registry.delete(&self.id).await;
        info!(task_id = %self.id, state = state.as_str(), ?exit_code, "task finished");
    }
}
