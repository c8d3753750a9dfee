//! Reverse-call router: lets guest code ask a connected socket client to
//! run one of *its* named commands and return data, correlated by a UUID
//! with a 10 s timeout. Also the MALFORMED/DISPATCH frame dispatch logic
//! for inbound socket messages (§4.7).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::ReverseCallError;

pub const REVERSE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability bridge seam for `global.command(...)`. The primary process
/// implements this directly against its connected socket clients
/// ([`ReverseCallRegistry`]); a worker child process instead implements it
/// by forwarding the call upstream over its IPC channel to the primary
/// (see `worker::child_bridge`), since only the primary owns the socket
/// client set.
#[async_trait]
pub trait ReverseCaller: Send + Sync {
    async fn call(&self, code: &str, msg: Value) -> Result<CommandReply, ReverseCallError>;
}

/// Broadcast to every connected socket client; opcode 4004 (DISPATCH). Also
/// doubles as the child→parent reverse-call forwarding payload (see
/// `worker::protocol::ChildMessage::CommandRequest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDispatch {
    pub id: String,
    pub code: String,
    pub msg: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub msg: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Registry of in-flight reverse calls, keyed by correlation id. Shared by
/// every socket connection task and by the sandbox bridge's `command()`
/// host function.
#[derive(Clone, Default)]
pub struct ReverseCallRegistry {
    pending: Arc<DashMap<String, oneshot::Sender<CommandReply>>>,
    broadcaster: Arc<DashMap<u64, tokio::sync::mpsc::UnboundedSender<CommandDispatch>>>,
    next_client_id: Arc<AtomicU64>,
}

impl ReverseCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new socket client's outbound channel; returns a guard id
    /// that must be passed to [`Self::deregister_client`] on disconnect.
    pub async fn register_client(
        &self,
        sender: tokio::sync::mpsc::UnboundedSender<CommandDispatch>,
    ) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        self.broadcaster.insert(id, sender);
        id
    }

    /// Removes a client's outbound channel, called once its socket
    /// connection's receive loop exits. Without this, a disconnected
    /// client's dead sender lingers forever: `has_client()`/`call()` would
    /// keep thinking a client is connected and broadcast into a closed
    /// channel instead of failing fast with `NoClient`.
    pub fn deregister_client(&self, id: u64) {
        self.broadcaster.remove(&id);
    }

    pub async fn has_client(&self) -> bool {
        !self.broadcaster.is_empty()
    }

    /// Resolves a pending call if `id` matches one, returning `true` if it
    /// did. Called from the socket receive loop for every inbound message
    /// that parses as JSON before falling back to "new submission" routing.
    pub fn resolve(&self, id: &str, reply: CommandReply) -> bool {
        if let Some((_, sender)) = self.pending.remove(id) {
            let _ = sender.send(reply);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ReverseCaller for ReverseCallRegistry {
    /// Broadcasts a DISPATCH to every connected client and races the first
    /// reply to win, failing with [`ReverseCallError::TimedOut`] after 10s.
    async fn call(&self, code: &str, msg: Value) -> Result<CommandReply, ReverseCallError> {
        if self.broadcaster.is_empty() {
            return Err(ReverseCallError::NoClient);
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let dispatch = CommandDispatch {
            id: id.clone(),
            code: code.to_string(),
            msg,
        };
        for client in self.broadcaster.iter() {
            let _ = client.value().send(dispatch.clone());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_without_a_connected_client_fails_fast() {
        let registry = ReverseCallRegistry::new();
        let err = registry.call("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, ReverseCallError::NoClient));
    }

    #[tokio::test]
    async fn resolve_delivers_to_the_matching_pending_call() {
        let registry = ReverseCallRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register_client(tx).await;

        let registry2 = registry.clone();
        let handle = tokio::spawn(async move { registry2.call("ping", Value::Null).await });

        // give the call a moment to register its pending id
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = registry.pending.iter().next().unwrap().key().clone();
        assert!(registry.resolve(
            &id,
            CommandReply {
                id: id.clone(),
                code: None,
                msg: Some(Value::String("pong".into())),
                error: None,
            }
        ));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.msg, Some(Value::String("pong".into())));
    }

    #[tokio::test]
    async fn deregistering_the_only_client_makes_call_fail_fast_again() {
        let registry = ReverseCallRegistry::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let client_id = registry.register_client(tx).await;
        assert!(registry.has_client().await);

        registry.deregister_client(client_id);
        assert!(!registry.has_client().await);

        let err = registry.call("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, ReverseCallError::NoClient));
    }
}
