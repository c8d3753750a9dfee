//! Wire types shared by the primary process and every `eval-worker` child:
//! newline-delimited JSON over the child's stdin/stdout, matching "a
//! parent↔child message channel" in §5.
//!
//! The pipe multiplexes two independent correlated request/reply flows:
//! ordinary job dispatch (parent → child → parent) and reverse-call
//! forwarding (child → parent → child). The latter exists because a worker
//! child cannot service a guest's `command(...)` call itself — only the
//! primary process owns the connected socket client set a reverse call
//! broadcasts to (see [`crate::worker::child_bridge`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reverse_call::{CommandDispatch, CommandReply};

/// Startup handshake the primary writes as the child's very first line, so
/// a freshly-forked `eval-worker` doesn't need its own config file or CLI
/// plumbing beyond its index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub worker_index: usize,
    pub redis_host: String,
    pub redis_port: u16,
    pub vm_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub fetch_max_response_length: usize,
    pub max_fetch_concurrency: usize,
}

/// Messages the primary writes to a child's stdin after the bootstrap line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// Dispatch one submission for evaluation.
    Eval { id: u64, code: String, msg: Value },
    /// Reply to a [`ChildMessage::CommandRequest`] the child forwarded
    /// earlier, re-keyed onto the child's own correlation id.
    CommandReply(CommandReply),
}

/// Messages a child writes to its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// Result of an `Eval` dispatch. `result` is always set on a normal
    /// return (the kernel never lets a guest fault escape as an `error`);
    /// `error` is reserved for the evaluation task itself failing to run.
    EvalResult {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Forwards a guest's `command(...)` call upstream.
    CommandRequest(CommandDispatch),
}
