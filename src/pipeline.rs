//! Submission Pipeline (§4.1): validates inbound submissions, dispatches to
//! the worker pool, and shapes the `Response` both front ends share.

use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::context::Submission;
use crate::error::PipelineError;
use crate::worker::pool::WorkerPool;

#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    pub message: String,
}

/// `{status_code, data: [string], duration_ms, errors: [{message}], id?}`.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub data: Vec<String>,
    #[serde(rename = "duration")]
    pub duration_ms: f64,
    pub errors: Vec<ResponseError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Response {
    fn error(status_code: u16, message: impl Into<String>, duration_ms: f64, id: Option<String>) -> Self {
        Response {
            status_code,
            data: Vec::new(),
            duration_ms,
            errors: vec![ResponseError {
                message: message.into(),
            }],
            id,
        }
    }
}

pub struct Pipeline {
    pool: WorkerPool,
}

impl Pipeline {
    pub fn new(pool: WorkerPool) -> Self {
        Pipeline { pool }
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Validates, enqueues, and shapes the `Response` for one submission.
    /// `duration_ms` is measured start-to-finish in this call, rounded to
    /// four decimal places per §4.1.
    pub async fn submit(&self, submission: Submission) -> Response {
        let start = Instant::now();
        let id = submission.correlation_id.clone();

        if let Some(err) = validation_error(&submission) {
            return Response::error(400, err.to_string(), elapsed_ms(start), id);
        }

        let msg = submission.msg.clone().unwrap_or(Value::Null);
        match self.pool.dispatch(submission.code, msg).await {
            Ok(result) => Response {
                status_code: 200,
                data: vec![result],
                duration_ms: elapsed_ms(start),
                errors: Vec::new(),
                id,
            },
            Err(err) => Response::error(500, err.to_string(), elapsed_ms(start), id),
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 1000.0 * 10_000.0).round() / 10_000.0
}

fn validation_error(submission: &Submission) -> Option<PipelineError> {
    if submission.code.trim().is_empty() {
        return Some(PipelineError::InvalidCode);
    }
    match &submission.msg {
        None | Some(Value::Object(_)) => None,
        Some(_) => Some(PipelineError::InvalidMsg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_code() {
        let submission = Submission {
            code: "   ".to_string(),
            msg: None,
            correlation_id: None,
        };
        assert!(matches!(
            validation_error(&submission),
            Some(PipelineError::InvalidCode)
        ));
    }

    #[test]
    fn rejects_non_object_msg() {
        let submission = Submission {
            code: "1+1".to_string(),
            msg: Some(Value::String("nope".into())),
            correlation_id: None,
        };
        assert!(matches!(
            validation_error(&submission),
            Some(PipelineError::InvalidMsg)
        ));
    }

    #[test]
    fn accepts_well_formed_submission() {
        let submission = Submission {
            code: "1+1".to_string(),
            msg: Some(serde_json::json!({"user": {"id": "u1"}})),
            correlation_id: None,
        };
        assert!(validation_error(&submission).is_none());
    }
}
