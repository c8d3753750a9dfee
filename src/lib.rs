//! Remote sandboxed code-evaluation service: HTTP + WebSocket front ends
//! over a worker-process pool of guest isolates.
//!
//! See `SPEC_FULL.md` and `DESIGN.md` in the repository root for the full
//! component breakdown and grounding ledger.

pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod http;
pub mod kv;
pub mod pipeline;
pub mod reverse_call;
pub mod sandbox;
pub mod telemetry;
pub mod worker;
