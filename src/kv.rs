//! Scoped, guest-visible key-value facade over a Redis-compatible
//! hash-with-field-TTL backend (via `deadpool-redis`, matching the teacher's
//! own Redis client stack).
//!
//! Each scoped key (derived in [`crate::context::derive_scoped_key`]) names
//! a Redis hash; the guest-supplied `key` argument to `store.*` is the
//! field within that hash. Non-string values are JSON-encoded on write and
//! JSON-decoded (best effort) on read.

use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use serde_json::Value;

use crate::error::KvError;

pub const MAX_HASH_FIELDS: usize = 100;
pub const MAX_VALUE_LEN: usize = 10_000;

#[derive(Clone)]
pub struct ScopedStore {
    pool: Pool,
}

impl ScopedStore {
    pub fn connect(host: &str, port: u16) -> Result<Self, KvError> {
        let cfg = RedisConfig::from_url(format!("redis://{host}:{port}/"));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(ScopedStore { pool })
    }

    pub async fn get(&self, hash: &str, field: &str) -> Result<Option<Value>, KvError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .hget(hash, field)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(raw.map(|s| decode_stored(&s)))
    }

    pub async fn set(
        &self,
        hash: &str,
        field: &str,
        value: &Value,
        ex: Option<u64>,
    ) -> Result<(), KvError> {
        let encoded = encode_for_store(value);
        if encoded.len() > MAX_VALUE_LEN {
            return Err(KvError::ValueTooLarge);
        }

        let mut conn = self.conn().await?;

        let existing_len: usize = conn
            .hlen(hash)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        let field_exists: bool = conn
            .hexists(hash, field)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        if !field_exists && existing_len >= MAX_HASH_FIELDS {
            return Err(KvError::HashFull);
        }

        let _: () = conn
            .hset(hash, field, &encoded)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        if let Some(seconds) = ex.filter(|s| *s > 0) {
            // NX: only apply a TTL if the field doesn't already have one.
            let _: Result<(), _> = redis::cmd("HEXPIRE")
                .arg(hash)
                .arg(seconds)
                .arg("NX")
                .arg("FIELDS")
                .arg(1)
                .arg(field)
                .query_async(&mut conn)
                .await;
        }

        Ok(())
    }

    pub async fn del(&self, hash: &str, field: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .hdel(hash, field)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    pub async fn len(&self, hash: &str) -> Result<usize, KvError> {
        let mut conn = self.conn().await?;
        conn.hlen(hash)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    pub async fn ex(&self, hash: &str, field: &str, seconds: u64) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let result: Vec<i64> = redis::cmd("HEXPIRE")
            .arg(hash)
            .arg(seconds)
            .arg("FIELDS")
            .arg(1)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(result.first().copied().unwrap_or(0) == 1)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, KvError> {
        self.pool
            .get()
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}

fn encode_for_store(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn decode_stored(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_strings_raw_and_others_as_json() {
        assert_eq!(encode_for_store(&Value::String("hi".into())), "hi");
        assert_eq!(encode_for_store(&Value::from(42)), "42");
    }

    #[test]
    fn decodes_scalars_back_to_their_json_type() {
        assert_eq!(decode_stored("42"), Value::from(42));
        assert_eq!(decode_stored("hi"), Value::String("hi".into()));
        assert_eq!(decode_stored("true"), Value::Bool(true));
    }
}
