//! The submission data model: the raw `Submission` a client sends, the
//! filtered `PotatContext` view exposed to the guest and used on outbound
//! fetch headers, and the `ScopeFlags` bitfield used by the KV facade to
//! derive namespaced keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KvError;

/// A raw submission as received from either front end.
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub code: String,
    #[serde(default)]
    pub msg: Option<Value>,
    #[serde(rename = "correlation_id", default)]
    pub correlation_id: Option<String>,
}

impl Submission {
    /// `code` must be a non-empty string; `msg`, if present, must be a
    /// JSON object (mapping).
    pub fn validate(&self) -> bool {
        if self.code.trim().is_empty() {
            return false;
        }
        match &self.msg {
            None => true,
            Some(Value::Object(_)) => true,
            Some(_) => false,
        }
    }
}

/// Filtered, serialisable view of `msg` exposed to the guest and attached
/// to outbound fetch headers. Built by stripping `channel.commands`,
/// `channel.blocks` and `command.description` from the raw `msg` mapping.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PotatContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Value>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub platform: String,
    #[serde(rename = "isSilent", default)]
    pub is_silent: bool,
    #[serde(default)]
    pub emotes: Vec<Value>,
    #[serde(default)]
    pub fragments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<PotatContext>>,
}

impl PotatContext {
    /// Build a `PotatContext` from a raw `msg` mapping, recursing into an
    /// optional `parent` submission context. `None` is returned for a
    /// totally absent `msg` (the guest still gets `msg == null`).
    pub fn from_msg(msg: &Value) -> Self {
        let obj = match msg.as_object() {
            Some(o) => o,
            None => return PotatContext::default(),
        };

        let mut channel = obj.get("channel").cloned();
        if let Some(Value::Object(ref mut ch)) = channel {
            ch.remove("commands");
            ch.remove("blocks");
        }

        let user = obj.get("user").cloned();

        let command_silent = obj
            .get("command")
            .and_then(|c| c.get("silent"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let timestamp = obj.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        let platform = obj
            .get("platform")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let emotes = obj
            .get("emotes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let fragments = obj
            .get("fragments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let parent = obj
            .get("parent")
            .map(|p| Box::new(PotatContext::from_msg(p)));

        PotatContext {
            user,
            channel,
            id,
            timestamp,
            platform,
            is_silent: command_silent,
            emotes,
            fragments,
            parent,
        }
    }

    /// Flattens `self` and every ancestor, outermost last, for the
    /// `x-potat-data[-N]` header fan-out in §4.6.
    pub fn chain(&self) -> Vec<&PotatContext> {
        let mut out = vec![self];
        let mut current = self;
        while let Some(parent) = &current.parent {
            out.push(parent);
            current = parent;
        }
        out
    }
}

/// Bitfield constants used to compose scoped KV key prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeFlags(pub u32);

impl ScopeFlags {
    pub const COMMAND: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
    pub const CHANNEL: u32 = 1 << 3;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Derives the scoped KV key for `(msg, flag)` per §4.5.
///
/// If `flag` is absent or non-numeric, the key defaults to
/// `user:<user.id>:channel:<channel.id>`. Otherwise segments are assembled
/// in fixed order (`user`, `command`, `channel`) for each set bit; a
/// missing id for a set bit is an error.
pub fn derive_scoped_key(msg: &Value, flag: Option<i64>) -> Result<String, KvError> {
    let user_id = msg.pointer("/user/id").and_then(Value::as_str);
    let channel_id = msg.pointer("/channel/id").and_then(Value::as_str);
    let command_id = msg.pointer("/command/id").and_then(Value::as_str);

    let Some(flag) = flag else {
        return Ok(default_key(user_id, channel_id));
    };
    let flags = ScopeFlags(flag as u32);

    let mut segments = Vec::new();
    if flags.has(ScopeFlags::USER) {
        segments.push((
            "user",
            user_id.ok_or(KvError::MissingScopeId { scope: "user" })?,
        ));
    }
    if flags.has(ScopeFlags::COMMAND) {
        segments.push((
            "command",
            command_id.ok_or(KvError::MissingScopeId { scope: "command" })?,
        ));
    }
    if flags.has(ScopeFlags::CHANNEL) {
        segments.push((
            "channel",
            channel_id.ok_or(KvError::MissingScopeId { scope: "channel" })?,
        ));
    }

    if segments.is_empty() {
        return Ok(default_key(user_id, channel_id));
    }

    Ok(segments
        .into_iter()
        .map(|(name, id)| format!("{name}:{id}"))
        .collect::<Vec<_>>()
        .join(":"))
}

fn default_key(user_id: Option<&str>, channel_id: Option<&str>) -> String {
    format!(
        "user:{}:channel:{}",
        user_id.unwrap_or_default(),
        channel_id.unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_to_user_channel_when_flag_absent() {
        let msg = json!({"user": {"id": "u1"}, "channel": {"id": "c1"}});
        assert_eq!(
            derive_scoped_key(&msg, None).unwrap(),
            "user:u1:channel:c1"
        );
    }

    #[test]
    fn assembles_set_bits_in_fixed_order() {
        let msg = json!({
            "user": {"id": "u1"},
            "channel": {"id": "c1"},
            "command": {"id": "cmd1"},
        });
        let flag = (ScopeFlags::CHANNEL | ScopeFlags::USER) as i64;
        assert_eq!(derive_scoped_key(&msg, Some(flag)).unwrap(), "user:u1:channel:c1");
    }

    #[test]
    fn missing_id_for_set_bit_is_an_error() {
        let msg = json!({"channel": {"id": "c1"}});
        let err = derive_scoped_key(&msg, Some(ScopeFlags::USER as i64)).unwrap_err();
        assert!(matches!(err, KvError::MissingScopeId { scope: "user" }));
    }

    #[test]
    fn potat_context_strips_channel_commands_and_blocks() {
        let msg = json!({
            "id": "m1",
            "channel": {"id": "c1", "commands": ["a"], "blocks": ["b"]},
        });
        let ctx = PotatContext::from_msg(&msg);
        let channel = ctx.channel.unwrap();
        assert!(channel.get("commands").is_none());
        assert!(channel.get("blocks").is_none());
        assert_eq!(channel.get("id").unwrap(), "c1");
    }
}
