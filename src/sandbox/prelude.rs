//! The guest-side "prelude": code-form wrapping (§4.4 step 6) and the
//! dynamic-dispatch stringifier (§4.4 step 5 / Design Notes, "Dynamic
//! dispatch on error shapes"). Rhai guests have no reflection API rich
//! enough to express the stringifier *inside* the guest the way the
//! original JS prelude does, so it is implemented host-side and applied to
//! the guest's returned `Dynamic` after evaluation — exactly the fallback
//! the design notes call out as acceptable.

use rhai::Dynamic;
use serde_json::Value;

/// Naive substring detector matching the spec's intentionally-preserved
/// quirk: identifiers like `returnValue` or `awaited` also trigger the
/// async wrapping. Do not "fix" this — it is observable behaviour.
pub fn is_async_form(code: &str) -> bool {
    code.contains("return") || code.contains("await")
}

/// Wraps the submitted code text per §4.4 step 6. The async-form branch
/// wraps the body in a named function so a bare `return` exits with a
/// value; the non-async branch evaluates the escaped source through Rhai's
/// built-in `eval` so a single expression's value is produced either way.
pub fn wrap_code(code: &str) -> String {
    if is_async_form(code) {
        format!("fn evaluate() {{\n{code}\n}}\nevaluate()")
    } else {
        let escaped = code.replace('\\', "\\\\").replace('"', "\\\"");
        format!("eval(\"{escaped}\")")
    }
}

/// Stringifies a successfully-evaluated guest result per the `toString`
/// helper in §4.4 step 5: strings pass through, `{name, message}` maps
/// render as `"Name: message"`, arrays render as comma-joined mapped
/// elements, everything else falls back to JSON.
pub fn stringify_dynamic(value: &Dynamic) -> String {
    if value.is_unit() {
        return "null".to_string();
    }
    if let Some(s) = value.clone().try_cast::<String>() {
        return s;
    }
    if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        return s.to_string();
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        return arr
            .iter()
            .map(stringify_dynamic)
            .collect::<Vec<_>>()
            .join(",");
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        if let (Some(name), Some(message)) = (map.get("name"), map.get("message")) {
            if name.clone().try_cast::<String>().is_some()
                || name.clone().try_cast::<rhai::ImmutableString>().is_some()
            {
                return format!(
                    "{}: {}",
                    stringify_dynamic(name),
                    stringify_dynamic(message)
                );
            }
        }
        return json_string(value);
    }
    if value.is_bool() || value.is_int() || value.is_float() {
        return value.to_string();
    }
    json_string(value)
}

fn json_string(value: &Dynamic) -> String {
    rhai::serde::from_dynamic::<Value>(value)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// Rounds a truncation length down to the nearest valid `char` boundary so
/// a multi-byte codepoint is never split (Design Notes open question).
pub fn truncate_to_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_async_form_on_return_or_await() {
        assert!(is_async_form("return 1"));
        assert!(is_async_form("await fetch('x')"));
        assert!(!is_async_form("1 + 1"));
    }

    #[test]
    fn preserves_the_false_positive_quirk() {
        // `returnValue` contains `return` as a substring: intentional.
        assert!(is_async_form("let returnValue = 1;"));
    }

    #[test]
    fn truncation_never_splits_a_multibyte_codepoint() {
        let s = "a🚫b";
        // byte index 2 lands inside the 4-byte emoji
        let truncated = truncate_to_char_boundary(s, 2);
        assert_eq!(truncated, "a");
    }

    #[test]
    fn stringify_passes_strings_through() {
        let d = Dynamic::from("hello".to_string());
        assert_eq!(stringify_dynamic(&d), "hello");
    }

    #[test]
    fn stringify_joins_arrays_with_commas() {
        let arr: rhai::Array = vec![Dynamic::from(1_i64), Dynamic::from(2_i64)];
        let d = Dynamic::from_array(arr);
        assert_eq!(stringify_dynamic(&d), "1,2");
    }
}
