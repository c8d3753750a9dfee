//! `eval-server`: the primary process entrypoint (§2). Loads configuration,
//! initializes tracing, spawns the worker pool, and serves the HTTP/WS
//! front ends over axum.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use potat_eval_server::config::{Cli, Config};
use potat_eval_server::http::{router, AppState};
use potat_eval_server::pipeline::Pipeline;
use potat_eval_server::reverse_call::ReverseCallRegistry;
use potat_eval_server::telemetry;
use potat_eval_server::worker::pool::WorkerPool;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config).and_then(Config::resolve) {
        Ok(c) => c,
        Err(e) => {
            // Telemetry isn't initialized yet: a config failure is
            // intentionally the one place in the system allowed to abort
            // the process, since it runs before any submission is in
            // flight (§4.9).
            eprintln!("eval-server: configuration error: {e}");
            std::process::exit(1);
        }
    };

    telemetry::init(cli.json_logs);
    info!(
        port = config.port,
        workers = config.max_child_process_count,
        "starting eval-server"
    );

    let worker_binary = sibling_binary_path("eval-worker");
    let reverse_calls = Arc::new(ReverseCallRegistry::new());
    let pool = WorkerPool::new(&config, worker_binary, reverse_calls.clone());
    let pipeline = Pipeline::new(pool);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let worker_count = pipeline.worker_count();
    let state = Arc::new(AppState {
        config,
        pipeline,
        reverse_calls,
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(%addr, workers = worker_count, "listening");
    if let Err(e) = axum::serve(listener, router(state)).await {
        error!(error = %e, "server exited with an error");
    }
}

/// Locates the `eval-worker` binary next to the running `eval-server`
/// executable, matching the teacher's pattern of shelling out to a sibling
/// coprocessor binary rather than requiring it on `$PATH`.
fn sibling_binary_path(name: &str) -> std::path::PathBuf {
    let exe = std::env::current_exe().unwrap_or_else(|_| std::path::PathBuf::from(name));
    let dir = exe.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    dir.join(name)
}
