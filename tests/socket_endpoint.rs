//! Ambient-stack test (SPEC_FULL.md §1.1, §4.8, §6): drives a real
//! `/socket` connection over a bound TCP listener with `tokio-tungstenite`,
//! the way the teacher integration-tests its own long-lived connections.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use potat_eval_server::config::ResolvedConfig;
use potat_eval_server::http::{router, AppState};
use potat_eval_server::pipeline::Pipeline;
use potat_eval_server::reverse_call::ReverseCallRegistry;
use potat_eval_server::worker::pool::WorkerPool;

async fn spawn_test_server(auth: &str) -> SocketAddr {
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

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    addr
}

#[tokio::test]
async fn closes_with_4007_on_auth_mismatch() {
    let addr = spawn_test_server("correct-token").await;
    let url = format!("ws://{addr}/socket?auth=wrong-token");
    let (mut ws, _) = connect_async(url).await.unwrap();

    let message = ws.next().await.unwrap().unwrap();
    match message {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4007),
        other => panic!("expected a 4007 close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn dispatches_a_new_submission_as_a_4004_frame() {
    let addr = spawn_test_server("tok").await;
    let url = format!("ws://{addr}/socket?auth=tok");
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(WsMessage::Text(r#"{"id":"u1","code":"1+1"}"#.into()))
        .await
        .unwrap();

    let frame = loop {
        let message = ws.next().await.unwrap().unwrap();
        if let WsMessage::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["opcode"] == 4004 {
                break value;
            }
        }
    };

    assert_eq!(frame["data"]["id"], "u1");
}

#[tokio::test]
async fn malformed_frame_without_an_id_gets_opcode_4006() {
    let addr = spawn_test_server("tok").await;
    let url = format!("ws://{addr}/socket?auth=tok");
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(WsMessage::Text(r#"{"foo":"bar"}"#.into()))
        .await
        .unwrap();

    let message = ws.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = message else {
        panic!("expected a text frame");
    };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["opcode"], 4006);
}
