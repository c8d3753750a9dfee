//! Ambient-stack test (SPEC_FULL.md §1.1, §4.8): drives the full axum router
//! for `POST /eval` with `tower::ServiceExt::oneshot`, exercising auth,
//! validation and pool-failure mapping end to end without a real `eval-worker`
//! child process.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use potat_eval_server::config::ResolvedConfig;
use potat_eval_server::http::{router, AppState};
use potat_eval_server::pipeline::Pipeline;
use potat_eval_server::reverse_call::ReverseCallRegistry;
use potat_eval_server::worker::pool::WorkerPool;

/// Zero workers: the pool is real, but with no supervisors any dispatch
/// fails fast with `PoolError::QueueFull` instead of needing a live child
/// process. This is enough to exercise the auth/validation/error-mapping
/// layers the handler owns without shelling out to `eval-worker`.
fn test_app(auth: &str) -> axum::Router {
    let config = ResolvedConfig {
        port: 0,
        auth: auth.to_string(),
        queue_size: 20,
        fetch_timeout_ms: 15_000,
        fetch_max_response_length: 10_000,
        max_fetch_concurrency: 5,
        workers_timeout_ms: 5_000,
        vm_memory_limit_mb: 32,
        vm_timeout_ms: 1_000,
        max_child_process_count: 0,
        redis_host: "localhost".to_string(),
        redis_port: 6379,
    };
    let reverse_calls = Arc::new(ReverseCallRegistry::new());
    let pool = WorkerPool::new(&config, std::path::PathBuf::new(), reverse_calls.clone());
    let pipeline = Pipeline::new(pool);
    let state = Arc::new(AppState {
        config,
        pipeline,
        reverse_calls,
    });
    router(state)
}

fn post_eval(body: &str, auth_header: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/eval")
        .header("content-type", "application/json");
    if let Some(auth) = auth_header {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn rejects_a_missing_bearer_token_with_418() {
    let app = test_app("correct-token");
    let response = app
        .oneshot(post_eval(r#"{"code": "1+1"}"#, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn rejects_a_wrong_prefix_token_with_418() {
    let app = test_app("correct-token");
    let response = app
        .oneshot(post_eval(r#"{"code": "1+1"}"#, Some("Bearer nope!")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn accepts_a_matching_token_prefix_even_if_longer() {
    // §6's 5-byte-prefix auth quirk, exercised end to end: only the first
    // five bytes of the configured token are ever significant.
    let app = test_app("short");
    let response = app
        .oneshot(post_eval(
            r#"{"code": "1+1"}"#,
            Some("Bearer short-but-with-a-much-longer-suffix"),
        ))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn rejects_empty_code_with_400() {
    let app = test_app("tok");
    let response = app
        .oneshot(post_eval(r#"{"code": ""}"#, Some("Bearer tok")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn surfaces_a_500_when_the_pool_has_no_ready_worker() {
    let app = test_app("tok");
    let response = app
        .oneshot(post_eval(r#"{"code": "1+1"}"#, Some("Bearer tok")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
