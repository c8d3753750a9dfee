//! Worker Pool (§4.2): a fixed-size set of supervisors with least-loaded
//! dispatch and a per-worker queue cap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::ResolvedConfig;
use crate::error::PoolError;
use crate::reverse_call::ReverseCallRegistry;
use crate::worker::protocol::WorkerBootstrap;
use crate::worker::supervisor::{SupervisorSettings, WorkerSupervisor};

pub struct WorkerPool {
    supervisors: Vec<Arc<WorkerSupervisor>>,
    max_queue_size_per_worker: usize,
}

impl WorkerPool {
    /// Spawns `config.max_child_process_count` supervisors, each
    /// immediately forking and bootstrapping its own `eval-worker` child.
    pub fn new(
        config: &ResolvedConfig,
        worker_binary: PathBuf,
        reverse_calls: Arc<ReverseCallRegistry>,
    ) -> Self {
        let execution_timeout = Duration::from_millis(config.workers_timeout_ms);

        let supervisors = (0..config.max_child_process_count)
            .map(|index| {
                let bootstrap = WorkerBootstrap {
                    worker_index: index,
                    redis_host: config.redis_host.clone(),
                    redis_port: config.redis_port,
                    vm_timeout_ms: config.vm_timeout_ms,
                    fetch_timeout_ms: config.fetch_timeout_ms,
                    fetch_max_response_length: config.fetch_max_response_length,
                    max_fetch_concurrency: config.max_fetch_concurrency,
                };
                let settings = SupervisorSettings {
                    worker_binary: worker_binary.clone(),
                    bootstrap,
                    execution_timeout,
                };
                WorkerSupervisor::spawn(index, settings, reverse_calls.clone())
            })
            .collect();

        WorkerPool {
            supervisors,
            max_queue_size_per_worker: config.queue_size as usize,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.supervisors.len()
    }

    /// Picks the ready supervisor with the smallest `queue_size` under the
    /// per-worker cap, breaking ties by stable (index) order — the first
    /// minimal supervisor `min_by_key` finds, since iteration is in spawn
    /// order. Fails with [`PoolError::QueueFull`] if none qualify.
    pub async fn dispatch(&self, code: String, msg: Value) -> Result<String, PoolError> {
        let chosen = self
            .supervisors
            .iter()
            .filter(|s| s.is_ready() && s.queue_size() < self.max_queue_size_per_worker)
            .min_by_key(|s| s.queue_size());

        let Some(supervisor) = chosen else {
            return Err(PoolError::QueueFull);
        };

        supervisor.dispatch(code, msg).await
    }
}
