//! The Capability Bridge: host functions exposed as globals in the guest
//! (§4.5), plus the host utility library (§4.4 step 4).
//!
//! Rhai's `register_result_fn` is the idiomatic way to surface a failing
//! host call as a thrown guest exception (`Box<EvalAltResult>`); every
//! fallible capability below uses it instead of panicking or silently
//! swallowing the error, matching "each host-provided callable ... must
//! declare whether the call is promise-returning" in the Design Notes —
//! here, "promise-returning" collapses to "may return `Result`", since the
//! whole evaluation already runs inside a blocking task that bridges back
//! into async host code via `Handle::block_on`.

use std::sync::Arc;

use base64::Engine as _;
use rand::seq::SliceRandom;
use rand::Rng;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Position, Scope, RhaiResultOf};
use serde_json::Value;

use crate::context::PotatContext;
use crate::fetch::{FetchClient, FetchOptions};
use crate::kv::ScopedStore;
use crate::reverse_call::ReverseCaller;

pub const PERMISSION_STORE: i64 = 1 << 0;
pub const PERMISSION_FETCH: i64 = 1 << 1;
pub const PERMISSION_COMMAND: i64 = 1 << 2;

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Handle::current().block_on(fut)
}

/// Per-submission capability bundle. Cheaply `Clone`-able (every field is
/// an `Arc` or small value) so it can be captured by several independent
/// host-function closures.
#[derive(Clone)]
pub struct CapabilityContext {
    pub store: Arc<ScopedStore>,
    pub fetch: Arc<FetchClient>,
    pub reverse_calls: Option<Arc<dyn ReverseCaller>>,
    pub msg: Value,
    pub potat_context: Arc<PotatContext>,
}

impl CapabilityContext {
    fn scoped_hash(&self, flag: Option<i64>) -> RhaiResultOf<String> {
        crate::context::derive_scoped_key(&self.msg, flag)
            .map_err(|e| runtime_error(e.to_string()))
    }

    fn context_chain(&self) -> Vec<&PotatContext> {
        self.potat_context.chain()
    }
}

pub fn register_capabilities(engine: &mut Engine, scope: &mut Scope, ctx: CapabilityContext) {
    let store = register_store(engine, ctx.clone());
    register_fetch(engine, ctx.clone());
    register_command(engine, ctx.clone());
    register_utilities(engine);

    scope.push_constant("permissions", PERMISSION_STORE | PERMISSION_FETCH | PERMISSION_COMMAND);
    scope.push_constant("store", store.clone());

    // `global.s`/`global.p` alias the same frozen handles, per §4.5. Rhai
    // has no self-referential-map primitive, so `global` is a plain
    // constant map rather than a literal cycle back to the top scope (see
    // Design Notes, "Cyclic/self-referential globals").
    let mut global = Map::new();
    global.insert("p".into(), Dynamic::from(PERMISSION_STORE | PERMISSION_FETCH | PERMISSION_COMMAND));
    global.insert("s".into(), Dynamic::from(store));
    scope.push_constant("global", global);
}

/// Guest-visible handle for `store.*` calls. Wraps the per-submission
/// [`CapabilityContext`] so Rhai's method-call syntax (`store.get(...)`)
/// dispatches to functions registered with `&mut Store` as their receiver —
/// the idiomatic way Rhai gives a registered Rust type `object.method()`
/// syntax, since Rhai has no way to attach closures to a plain object map.
#[derive(Clone)]
pub struct Store(CapabilityContext);

fn register_store(engine: &mut Engine, ctx: CapabilityContext) -> Store {
    engine.register_type_with_name::<Store>("Store");

    // get / g
    for name in ["get", "g"] {
        engine.register_result_fn(name, |store: &mut Store, key: &str| -> RhaiResultOf<Dynamic> {
            store_get(&store.0, key, None)
        });
        engine.register_result_fn(
            name,
            |store: &mut Store, key: &str, flag: i64| -> RhaiResultOf<Dynamic> {
                store_get(&store.0, key, Some(flag))
            },
        );
    }

    // del / d
    for name in ["del", "d"] {
        engine.register_result_fn(name, |store: &mut Store, key: &str| -> RhaiResultOf<bool> {
            store_del(&store.0, key, None)
        });
        engine.register_result_fn(
            name,
            |store: &mut Store, key: &str, flag: i64| -> RhaiResultOf<bool> {
                store_del(&store.0, key, Some(flag))
            },
        );
    }

    // len / l
    for name in ["len", "l"] {
        engine.register_result_fn(name, |store: &mut Store, key: &str| -> RhaiResultOf<i64> {
            store_len(&store.0, key, None)
        });
        engine.register_result_fn(
            name,
            |store: &mut Store, key: &str, flag: i64| -> RhaiResultOf<i64> {
                store_len(&store.0, key, Some(flag))
            },
        );
    }

    engine.register_result_fn(
        "ex",
        |store: &mut Store, key: &str, seconds: i64| -> RhaiResultOf<bool> {
            store_ex(&store.0, key, seconds, None)
        },
    );
    engine.register_result_fn(
        "ex",
        |store: &mut Store, key: &str, seconds: i64, flag: i64| -> RhaiResultOf<bool> {
            store_ex(&store.0, key, seconds, Some(flag))
        },
    );

    // set / s, in 2/3/4-arity forms.
    for name in ["set", "s"] {
        engine.register_result_fn(
            name,
            |store: &mut Store, key: &str, value: Dynamic| -> RhaiResultOf<bool> {
                store_set(&store.0, key, value, None, None)
            },
        );
        engine.register_result_fn(
            name,
            |store: &mut Store, key: &str, value: Dynamic, flag: i64| -> RhaiResultOf<bool> {
                store_set(&store.0, key, value, Some(flag), None)
            },
        );
        engine.register_result_fn(
            name,
            |store: &mut Store,
             key: &str,
             value: Dynamic,
             flag: i64,
             ex: i64|
             -> RhaiResultOf<bool> { store_set(&store.0, key, value, Some(flag), Some(ex)) },
        );
    }

    Store(ctx)
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic(value).unwrap_or(Value::Null)
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

fn store_get(ctx: &CapabilityContext, key: &str, flag: Option<i64>) -> RhaiResultOf<Dynamic> {
    let hash = ctx.scoped_hash(flag)?;
    let result = block_on(ctx.store.get(&hash, key)).map_err(|e| runtime_error(e.to_string()))?;
    Ok(result.map(|v| json_to_dynamic(&v)).unwrap_or(Dynamic::UNIT))
}

fn store_set(
    ctx: &CapabilityContext,
    key: &str,
    value: Dynamic,
    flag: Option<i64>,
    ex: Option<i64>,
) -> RhaiResultOf<bool> {
    let hash = ctx.scoped_hash(flag)?;
    let json_value = dynamic_to_json(&value);
    block_on(ctx.store.set(&hash, key, &json_value, ex.map(|e| e.max(0) as u64)))
        .map_err(|e| runtime_error(e.to_string()))?;
    Ok(true)
}

fn store_del(ctx: &CapabilityContext, key: &str, flag: Option<i64>) -> RhaiResultOf<bool> {
    let hash = ctx.scoped_hash(flag)?;
    block_on(ctx.store.del(&hash, key)).map_err(|e| runtime_error(e.to_string()))
}

fn store_len(ctx: &CapabilityContext, key: &str, flag: Option<i64>) -> RhaiResultOf<i64> {
    let hash = ctx.scoped_hash(flag)?;
    let len = block_on(ctx.store.len(&hash)).map_err(|e| runtime_error(e.to_string()))?;
    Ok(len as i64)
}

fn store_ex(
    ctx: &CapabilityContext,
    key: &str,
    seconds: i64,
    flag: Option<i64>,
) -> RhaiResultOf<bool> {
    let hash = ctx.scoped_hash(flag)?;
    block_on(ctx.store.ex(&hash, key, seconds.max(0) as u64))
        .map_err(|e| runtime_error(e.to_string()))
}

fn register_fetch(engine: &mut Engine, ctx: CapabilityContext) {
    let c = ctx.clone();
    engine.register_result_fn("fetch", move |url: &str| -> RhaiResultOf<Map> {
        do_fetch(&c, url, Map::new())
    });
    let c = ctx.clone();
    engine.register_result_fn("fetch", move |url: &str, options: Map| -> RhaiResultOf<Map> {
        do_fetch(&c, url, options)
    });
}

fn do_fetch(ctx: &CapabilityContext, url: &str, options_map: Map) -> RhaiResultOf<Map> {
    let with_data_headers = options_map
        .get("withDataHeaders")
        .map(|d| d.as_bool().unwrap_or(false))
        .unwrap_or(false);
    let method = options_map
        .get("method")
        .and_then(|d| d.clone().try_cast::<String>());
    let body = options_map
        .get("body")
        .and_then(|d| d.clone().try_cast::<String>());

    let options = FetchOptions {
        with_data_headers,
        method,
        body,
        headers: Vec::new(),
    };

    let chain = ctx.context_chain();
    let result = block_on(ctx.fetch.fetch(url, options, &chain))
        .map_err(|e| runtime_error(e.to_string()))?;

    let mut out = Map::new();
    out.insert("status".into(), Dynamic::from(result.status as i64));
    out.insert("body".into(), json_to_dynamic(&result.body));
    Ok(out)
}

fn register_command(engine: &mut Engine, ctx: CapabilityContext) {
    if ctx.reverse_calls.is_none() {
        return;
    }
    let c = ctx.clone();
    engine.register_result_fn(
        "command",
        move |name: &str, args: Array| -> RhaiResultOf<Map> {
            let mut words = Vec::with_capacity(args.len());
            for (i, a) in args.iter().enumerate() {
                match a.clone().try_cast::<String>() {
                    Some(s) => words.push(s),
                    None => {
                        return Err(runtime_error(format!(
                            "argument {i} is not a string"
                        )))
                    }
                }
            }

            let registry = c.reverse_calls.as_ref().expect("checked above");
            let mut call_msg = c.msg.clone();
            if let Value::Object(ref mut obj) = call_msg {
                obj.insert("text".into(), Value::String(words.join(" ")));
            }

            let reply = block_on(registry.call(name, call_msg))
                .map_err(|e| runtime_error(e.to_string()))?;

            let mut out = Map::new();
            out.insert("id".into(), Dynamic::from(reply.id));
            out.insert(
                "code".into(),
                reply
                    .code
                    .map(Dynamic::from)
                    .unwrap_or(Dynamic::UNIT),
            );
            out.insert(
                "msg".into(),
                reply.msg.map(|m| json_to_dynamic(&m)).unwrap_or(Dynamic::UNIT),
            );
            if let Some(err) = reply.error {
                out.insert("error".into(), Dynamic::from(err));
            }
            Ok(out)
        },
    );
}

fn register_utilities(engine: &mut Engine) {
    engine.register_fn("randomString", |len: i64| -> String {
        const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        (0..len.max(0))
            .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
            .collect()
    });

    engine.register_fn("randomInt", |min: i64, max: i64| -> i64 {
        if max <= min {
            return min;
        }
        rand::rng().random_range(min..max)
    });

    engine.register_fn("shuffleArray", |arr: Array| -> Array {
        let mut arr = arr;
        arr.shuffle(&mut rand::rng());
        arr
    });

    engine.register_fn("shuffleString", |s: &str| -> String {
        let mut chars: Vec<char> = s.chars().collect();
        chars.shuffle(&mut rand::rng());
        chars.into_iter().collect()
    });

    engine.register_fn("splitArray", |arr: Array, size: i64| -> Array {
        let size = size.max(1) as usize;
        arr.chunks(size)
            .map(|chunk| Dynamic::from_array(chunk.to_vec()))
            .collect()
    });

    engine.register_fn("randomSlice", |arr: Array, count: i64| -> Array {
        let count = (count.max(0) as usize).min(arr.len());
        let mut rng = rand::rng();
        let mut copy = arr;
        copy.shuffle(&mut rng);
        copy.into_iter().take(count).collect()
    });

    engine.register_result_fn("atob", |s: &str| -> RhaiResultOf<String> {
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| runtime_error(e.to_string()))
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|e| runtime_error(e.to_string()))
            })
    });

    engine.register_fn("btoa", |s: &str| -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    });

    engine.register_fn("humanizeDuration", |ms: i64| -> String {
        humantime::format_duration(std::time::Duration::from_millis(ms.max(0) as u64)).to_string()
    });

    // `process.exit` has no ambient counterpart to neutralize: Rhai never
    // exposes a `process` global in the first place, so the guest has no
    // way to terminate the host process. Nothing to register here.
}
