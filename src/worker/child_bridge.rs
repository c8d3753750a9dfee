//! Worker-child implementation of [`ReverseCaller`]: forwards a guest's
//! `command(...)` call upstream to the primary over the child's IPC channel
//! and awaits the correlated reply, since only the primary process owns the
//! connected socket client set a reverse call is broadcast to.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::ReverseCallError;
use crate::reverse_call::{CommandDispatch, CommandReply, ReverseCaller, REVERSE_CALL_TIMEOUT};
use crate::worker::protocol::ChildMessage;

#[derive(Clone)]
pub struct ChildReverseCallBridge {
    pending: Arc<DashMap<String, oneshot::Sender<CommandReply>>>,
    outbound: mpsc::UnboundedSender<ChildMessage>,
}

impl ChildReverseCallBridge {
    pub fn new(outbound: mpsc::UnboundedSender<ChildMessage>) -> Self {
        ChildReverseCallBridge {
            pending: Arc::new(DashMap::new()),
            outbound,
        }
    }

    /// Delivers a `CommandReply` the primary sent back, called from the
    /// child's stdin-reader loop.
    pub fn resolve(&self, reply: CommandReply) {
        if let Some((_, sender)) = self.pending.remove(&reply.id) {
            let _ = sender.send(reply);
        }
    }
}

#[async_trait]
impl ReverseCaller for ChildReverseCallBridge {
    async fn call(&self, code: &str, msg: Value) -> Result<CommandReply, ReverseCallError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = ChildMessage::CommandRequest(CommandDispatch {
            id: id.clone(),
            code: code.to_string(),
            msg,
        });
        if self.outbound.send(request).is_err() {
            self.pending.remove(&id);
            return Err(ReverseCallError::NoClient);
        }

        match tokio::time::timeout(REVERSE_CALL_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.pending.remove(&id);
                Err(ReverseCallError::TimedOut)
            }
        }
    }
}
