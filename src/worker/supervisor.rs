//! Worker Supervisor (§4.3): owns exactly one `eval-worker` child process
//! across its lifetime. Forks, installs a request/reply bridge, detects
//! liveness loss by request/response gap, kills, and re-forks — forever.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::PoolError;
use crate::reverse_call::{CommandReply, ReverseCallRegistry, ReverseCaller};
use crate::worker::protocol::{ChildMessage, ParentMessage, WorkerBootstrap};

const RESPAWN_DELAY: Duration = Duration::from_secs(1);
/// An outstanding request with no reply for this long marks the worker
/// unresponsive, independent of the configured per-dispatch timeout (§5).
const LIVENESS_GAP: Duration = Duration::from_secs(60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

pub struct SupervisorSettings {
    pub worker_binary: PathBuf,
    pub bootstrap: WorkerBootstrap,
    pub execution_timeout: Duration,
}

/// One supervisor per worker slot. `Arc`-held by [`crate::worker::pool::WorkerPool`]
/// and by its own background respawn loop.
pub struct WorkerSupervisor {
    index: usize,
    settings: SupervisorSettings,
    reverse_calls: Arc<ReverseCallRegistry>,
    ready: AtomicBool,
    queue_size: AtomicUsize,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Result<String, PoolError>>>,
    outbound: RwLock<Option<mpsc::UnboundedSender<ParentMessage>>>,
    last_request_at: RwLock<Option<Instant>>,
    last_response_at: RwLock<Option<Instant>>,
}

impl WorkerSupervisor {
    pub fn spawn(
        index: usize,
        settings: SupervisorSettings,
        reverse_calls: Arc<ReverseCallRegistry>,
    ) -> Arc<Self> {
        let supervisor = Arc::new(WorkerSupervisor {
            index,
            settings,
            reverse_calls,
            ready: AtomicBool::new(false),
            queue_size: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            outbound: RwLock::new(None),
            last_request_at: RwLock::new(None),
            last_response_at: RwLock::new(None),
        });
        let loop_handle = supervisor.clone();
        tokio::spawn(async move { loop_handle.run_loop().await });
        supervisor
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::SeqCst)
    }

    /// Forwards one submission to this worker's child and awaits the reply,
    /// failing with [`PoolError::ExecutionTimeout`] after the configured
    /// per-dispatch timeout or [`PoolError::Unresponsive`] if the child is
    /// mid-respawn.
    pub async fn dispatch(&self, code: String, msg: Value) -> Result<String, PoolError> {
        let Some(sender) = self.outbound.read().clone() else {
            return Err(PoolError::Unresponsive);
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        *self.last_request_at.write() = Some(Instant::now());

        if sender.send(ParentMessage::Eval { id, code, msg }).is_err() {
            self.pending.remove(&id);
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Unresponsive);
        }

        let outcome = match tokio::time::timeout(self.settings.execution_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Unresponsive),
            Err(_) => {
                self.pending.remove(&id);
                Err(PoolError::ExecutionTimeout)
            }
        };
        self.queue_size.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.spawn_and_drive_child().await {
                warn!(worker = self.index, error = %e, "worker child exited");
            }
            self.ready.store(false, Ordering::SeqCst);
            *self.outbound.write() = None;
            self.fail_all_pending();
            self.queue_size.store(0, Ordering::SeqCst);
            tokio::time::sleep(RESPAWN_DELAY).await;
        }
    }

    fn fail_all_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, sender)) = self.pending.remove(&id) {
                let _ = sender.send(Err(PoolError::Unresponsive));
            }
        }
    }

    async fn spawn_and_drive_child(self: &Arc<Self>) -> Result<(), std::io::Error> {
        info!(worker = self.index, "spawning worker child");
        let mut child = Command::new(&self.settings.worker_binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let bootstrap_line =
            serde_json::to_string(&self.settings.bootstrap).expect("bootstrap serializes") + "\n";
        stdin.write_all(bootstrap_line.as_bytes()).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ParentMessage>();
        *self.outbound.write() = Some(tx);
        self.ready.store(true, Ordering::SeqCst);
        info!(worker = self.index, "worker child ready");

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&message) else {
                    continue;
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(text)) => self.handle_child_line(&text).await,
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = watchdog.tick() => {
                    if self.is_unresponsive() {
                        warn!(worker = self.index, "liveness gap exceeded, killing worker");
                        break;
                    }
                }
                status = child.wait() => {
                    info!(worker = self.index, status = ?status, "worker child exited");
                    break;
                }
            }
        }

        writer_task.abort();
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }

    /// §4.3: a request arrived but no reply has come for 60 s.
    fn is_unresponsive(&self) -> bool {
        let Some(last_req) = *self.last_request_at.read() else {
            return false;
        };
        let last_resp = *self.last_response_at.read();
        let answered = last_resp.is_some_and(|resp| resp >= last_req);
        !answered && last_req.elapsed() > LIVENESS_GAP
    }

    async fn handle_child_line(&self, text: &str) {
        let Ok(message) = serde_json::from_str::<ChildMessage>(text) else {
            warn!(worker = self.index, line = %text, "malformed line from worker child");
            return;
        };
        match message {
            ChildMessage::EvalResult { id, result, error } => {
                *self.last_response_at.write() = Some(Instant::now());
                if let Some((_, sender)) = self.pending.remove(&id) {
                    let outcome = match (result, error) {
                        (Some(r), _) => Ok(r),
                        (None, Some(e)) => Err(PoolError::Failed(e)),
                        (None, None) => Err(PoolError::Failed("empty worker reply".into())),
                    };
                    let _ = sender.send(outcome);
                }
            }
            ChildMessage::CommandRequest(request) => self.forward_command_request(request),
        }
    }

    /// A guest's `command(...)` call, forwarded by its worker child. Only
    /// the primary can service it — it owns the connected socket clients.
    fn forward_command_request(&self, request: crate::reverse_call::CommandDispatch) {
        let registry = self.reverse_calls.clone();
        let outbound = self.outbound.read().clone();
        let child_id = request.id.clone();

        tokio::spawn(async move {
            let result = registry.call(&request.code, request.msg).await;
            let reply = match result {
                Ok(mut reply) => {
                    reply.id = child_id;
                    reply
                }
                Err(e) => CommandReply {
                    id: child_id,
                    code: None,
                    msg: None,
                    error: Some(e.to_string()),
                },
            };
            if let Some(sender) = outbound {
                let _ = sender.send(ParentMessage::CommandReply(reply));
            }
        });
    }
}
