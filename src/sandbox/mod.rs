//! Sandbox Kernel: per-submission guest lifecycle (§4.4). A fresh
//! `rhai::Engine` + `Scope` pair stands in for the "isolate" the spec
//! describes — created and disposed on every call, exactly as required by
//! "a per-submission isolate is created and disposed each call" in §5.

pub mod bridge;
pub mod prelude;

use std::sync::Arc;
use std::time::Duration;

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;

use crate::context::PotatContext;
use crate::error::SandboxError;
use crate::fetch::FetchClient;
use crate::kv::ScopedStore;
use crate::reverse_call::ReverseCaller;

use bridge::CapabilityContext;

/// Approximates the spec's 8 MiB guest heap cap via Rhai's size limits
/// (Rhai has no byte-granular allocator hook to cap directly — see
/// DESIGN.md for the exact scaling chosen).
const MAX_STRING_SIZE: usize = 2 * 1024 * 1024;
const MAX_ARRAY_SIZE: usize = 200_000;
const MAX_MAP_SIZE: usize = 50_000;
const MAX_OPERATIONS: u64 = 50_000_000;
const MAX_EXPR_DEPTH: usize = 128;

#[derive(Clone)]
pub struct SandboxKernel {
    pub store: Arc<ScopedStore>,
    pub fetch: Arc<FetchClient>,
    pub reverse_calls: Option<Arc<dyn ReverseCaller>>,
    pub vm_timeout_ms: u64,
    pub fetch_max_response_length: usize,
}

impl SandboxKernel {
    /// Evaluates `code` against `msg`, never returning an `Err`: guest
    /// faults resolve to the `"🚫 <Name>: <message>"` string per §4.4 step
    /// 8, and the caller (Worker Process) always gets a plain `String`.
    pub async fn evaluate(&self, code: String, msg: Value) -> String {
        let deadline = Duration::from_millis(self.vm_timeout_ms + 1000);
        let kernel = self.clone();

        let eval_task = tokio::task::spawn_blocking(move || kernel.evaluate_blocking(&code, msg));

        match tokio::time::timeout(deadline, eval_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => SandboxError::Fatal(join_error.to_string()).as_guest_string(),
            Err(_) => SandboxError::Timeout(self.vm_timeout_ms + 1000).as_guest_string(),
        }
    }

    fn evaluate_blocking(&self, code: &str, msg: Value) -> String {
        let mut engine = Engine::new();
        engine.set_max_string_size(MAX_STRING_SIZE);
        engine.set_max_array_size(MAX_ARRAY_SIZE);
        engine.set_max_map_size(MAX_MAP_SIZE);
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);

        let potat_context = Arc::new(PotatContext::from_msg(&msg));
        let capability_ctx = CapabilityContext {
            store: self.store.clone(),
            fetch: self.fetch.clone(),
            reverse_calls: self.reverse_calls.clone(),
            msg: msg.clone(),
            potat_context,
        };

        let mut scope = Scope::new();
        scope.push_constant("msg", bridge_json_to_dynamic(&msg));
        bridge::register_capabilities(&mut engine, &mut scope, capability_ctx);

        let wrapped = prelude::wrap_code(code);

        match engine.eval_with_scope::<Dynamic>(&mut scope, &wrapped) {
            Ok(result) => {
                let stringified = prelude::stringify_dynamic(&result);
                prelude::truncate_to_char_boundary(&stringified, self.fetch_max_response_length)
                    .to_string()
            }
            Err(err) => {
                let (name, message) = classify_eval_error(&err);
                SandboxError::GuestFault { name, message }.as_guest_string()
            }
        }
    }
}

fn classify_eval_error(err: &rhai::EvalAltResult) -> (String, String) {
    use rhai::EvalAltResult::*;
    let name = match err {
        ErrorParsing(..) => "SyntaxError",
        ErrorFunctionNotFound(..) => "ReferenceError",
        ErrorVariableNotFound(..) => "ReferenceError",
        ErrorIndexingType(..) | ErrorMismatchDataType(..) => "TypeError",
        ErrorTooManyOperations(..) => "TimeoutError",
        ErrorArrayBounds(..) | ErrorStringBounds(..) => "RangeError",
        ErrorRuntime(..) => "Error",
        _ => "Error",
    };
    (name.to_string(), err.to_string())
}

pub(crate) fn bridge_json_to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchClient;

    fn test_kernel() -> SandboxKernel {
        SandboxKernel {
            store: Arc::new(ScopedStore::connect("localhost", 6379).expect("local redis config")),
            fetch: Arc::new(FetchClient::new(5, 15_000).expect("client builds")),
            reverse_calls: None,
            vm_timeout_ms: 14_000,
            fetch_max_response_length: 10_000,
        }
    }

    #[tokio::test]
    async fn evaluates_a_simple_expression() {
        let kernel = test_kernel();
        let result = kernel.evaluate("1+1".to_string(), Value::Null).await;
        assert_eq!(result, "2");
    }

    #[tokio::test]
    async fn async_form_supports_bare_return() {
        let kernel = test_kernel();
        let result = kernel.evaluate("return 2+2".to_string(), Value::Null).await;
        assert_eq!(result, "4");
    }

    #[tokio::test]
    async fn guest_faults_resolve_to_a_prefixed_string_not_an_error() {
        let kernel = test_kernel();
        let result = kernel
            .evaluate("return undefined_fn()".to_string(), Value::Null)
            .await;
        assert!(result.starts_with("🚫"));
    }

    #[tokio::test]
    async fn store_is_exposed_as_an_object_with_method_call_syntax() {
        // No live backend in this test: `store.get(...)` dispatches through
        // the registered `Store` methods and reaches an actual connection
        // attempt, which fails — proving the guest-visible `store.get` call
        // is wired up as object-method syntax rather than a free function,
        // without requiring a running Redis.
        let kernel = test_kernel();
        let result = kernel
            .evaluate("return store.get('x')".to_string(), Value::Null)
            .await;
        assert!(result.starts_with("🚫"));
        assert!(!result.contains("Function not found"));
    }
}
