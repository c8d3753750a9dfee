//! `eval-worker`: the child-process binary a [`WorkerSupervisor`] forks.
//!
//! Reads a [`WorkerBootstrap`] as its very first stdin line, then loops
//! reading [`ParentMessage`]s: `Eval` dispatches enqueue onto a single
//! serial evaluation task (evaluations within one worker are never
//! concurrent, per §5), while `CommandReply`s are resolved immediately so a
//! guest's in-flight `command()` call can unblock without waiting behind
//! the next queued evaluation.

use std::sync::Arc;

use potat_eval_server::fetch::FetchClient;
use potat_eval_server::kv::ScopedStore;
use potat_eval_server::reverse_call::ReverseCaller;
use potat_eval_server::sandbox::SandboxKernel;
use potat_eval_server::telemetry;
use potat_eval_server::worker::child_bridge::ChildReverseCallBridge;
use potat_eval_server::worker::protocol::{ChildMessage, ParentMessage, WorkerBootstrap};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let bootstrap_line = match stdin.next_line().await {
        Ok(Some(line)) => line,
        _ => {
            eprintln!("eval-worker: no bootstrap line on stdin");
            std::process::exit(1);
        }
    };
    let bootstrap: WorkerBootstrap = match serde_json::from_str(&bootstrap_line) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("eval-worker: malformed bootstrap: {e}");
            std::process::exit(1);
        }
    };

    telemetry::init_worker(bootstrap.worker_index);

    let store = match ScopedStore::connect(&bootstrap.redis_host, bootstrap.redis_port) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "worker failed to connect to kv backend");
            std::process::exit(1);
        }
    };
    let fetch = match FetchClient::new(bootstrap.max_fetch_concurrency, bootstrap.fetch_timeout_ms)
    {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!(error = %e, "worker failed to build fetch client");
            std::process::exit(1);
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ChildMessage>();
    let eval_writer = ResultWriter(outbound_tx.clone());
    let bridge = Arc::new(ChildReverseCallBridge::new(outbound_tx));
    let reverse_calls: Option<Arc<dyn ReverseCaller>> = Some(bridge.clone());

    let kernel = SandboxKernel {
        store,
        fetch,
        reverse_calls,
        vm_timeout_ms: bootstrap.vm_timeout_ms,
        fetch_max_response_length: bootstrap.fetch_max_response_length,
    };

    let writer_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbound_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&message) else {
                continue;
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<(u64, String, serde_json::Value)>();

    let eval_task = {
        let kernel = kernel.clone();
        let writer = eval_writer.clone();
        tokio::spawn(async move {
            while let Some((id, code, msg)) = job_rx.recv().await {
                let result = kernel.evaluate(code, msg).await;
                writer.send(ChildMessage::EvalResult {
                    id,
                    result: Some(result),
                    error: None,
                });
            }
        })
    };

    while let Ok(Some(line)) = stdin.next_line().await {
        let message: ParentMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "malformed line from primary");
                continue;
            }
        };
        match message {
            ParentMessage::Eval { id, code, msg } => {
                if job_tx.send((id, code, msg)).is_err() {
                    break;
                }
            }
            ParentMessage::CommandReply(reply) => bridge.resolve(reply),
        }
    }

    drop(job_tx);
    let _ = eval_task.await;
    drop(eval_writer);
    let _ = writer_task.await;
}

/// Thin clone-able sender wrapper so the eval task can push replies onto
/// the same outbound channel the reverse-call bridge writes requests to,
/// without the kernel itself needing to know about the wire protocol.
#[derive(Clone)]
struct ResultWriter(mpsc::UnboundedSender<ChildMessage>);

impl ResultWriter {
    fn send(&self, message: ChildMessage) {
        let _ = self.0.send(message);
    }
}
