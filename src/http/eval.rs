//! `POST /eval` (§6): the request/reply front end over the Submission
//! Pipeline.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};

use crate::context::Submission;

use super::{check_auth, AppState};

const REJECTED_BODY_MESSAGE: &str = "not today my little bish xqcL";

pub async fn handle_eval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(submission): Json<Submission>,
) -> impl IntoResponse {
    let token = bearer_token(&headers);
    let authorized = token
        .map(|t| check_auth(&state.config.auth, t))
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::IM_A_TEAPOT,
            Json(serde_json::json!({
                "data": [],
                "statusCode": 418,
                "duration": 0,
                "errors": [{"message": REJECTED_BODY_MESSAGE}],
            })),
        );
    }

    let response = state.pipeline.submit(submission).await;
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
    (status, Json(body))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
