//! HTTP & WebSocket transport (§4.8, ambient): axum routing, the shared
//! `AppState`, and the constant-time auth check both front ends use.

pub mod eval;
pub mod socket;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ResolvedConfig;
use crate::pipeline::Pipeline;
use crate::reverse_call::ReverseCallRegistry;

/// §6: request body limited to ~20 MiB.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

pub struct AppState {
    pub config: ResolvedConfig,
    pub pipeline: Pipeline,
    pub reverse_calls: Arc<ReverseCallRegistry>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/eval", post(eval::handle_eval))
        .route("/socket", get(socket::handle_upgrade))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The spec's literal (and knowingly weak) auth check: both sides are
/// copied into a fixed 5-byte, zero-padded buffer before a constant-time
/// comparison, so only the first 5 bytes of the token are ever
/// significant. Preserved bit-exact — see DESIGN.md's Open Question log;
/// this is a documented defect carried over deliberately, not an oversight.
pub fn check_auth(expected: &str, presented: &str) -> bool {
    fn fixed_buffer(s: &str) -> [u8; 5] {
        let mut buf = [0u8; 5];
        let bytes = s.as_bytes();
        let n = bytes.len().min(5);
        buf[..n].copy_from_slice(&bytes[..n]);
        buf
    }

    let expected_buf = fixed_buffer(expected);
    let presented_buf = fixed_buffer(presented);

    let mut diff = 0u8;
    for i in 0..5 {
        diff |= expected_buf[i] ^ presented_buf[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_prefix() {
        assert!(check_auth("sekrit", "sekrit-but-longer"));
    }

    #[test]
    fn rejects_differing_prefix() {
        assert!(!check_auth("sekrit", "nope!!"));
    }

    #[test]
    fn handles_short_tokens_without_panicking() {
        assert!(check_auth("ab", "ab"));
        assert!(!check_auth("ab", "xy"));
    }
}
