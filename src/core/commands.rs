// src/core/commands.rs

//! The typed command catalog.
//!
//! Each method translates typed arguments into one dispatch envelope and the
//! acknowledgement payload back into a typed result. Reads that may
//! legitimately find nothing on a single endpoint go through the nil-tolerant
//! dispatch; writes and counters take the first settled answer.
//!
//! A request that times out or comes back malformed surfaces as an absent
//! value, exactly like a missing key; command-specific semantics are the
//! caller's business.

use serde_json::Value;
use std::collections::HashMap;

use crate::client::KeySyncClient;
use crate::core::session::SessionGroup;
use std::sync::Arc;

/// The `value` field of an acknowledgement, with JSON `null` folded into
/// absence.
pub fn value_field(ack: &Value) -> Option<&Value> {
    match ack.get("value") {
        Some(Value::Null) | None => None,
        Some(value) => Some(value),
    }
}

pub fn string_result(ack: Value) -> Option<String> {
    value_field(&ack)?.as_str().map(str::to_string)
}

pub fn int_result(ack: Value) -> Option<i64> {
    value_field(&ack)?.as_i64()
}

pub fn float_result(ack: Value) -> Option<f64> {
    value_field(&ack)?.as_f64()
}

pub fn ok_result(ack: Value) -> Option<bool> {
    ack.get("ok").and_then(Value::as_bool)
}

pub fn string_array_result(ack: Value) -> Option<Vec<String>> {
    let items = value_field(&ack)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
    )
}

/// For replies whose entries may individually be absent (`HMGET`).
pub fn optional_string_array_result(ack: Value) -> Option<Vec<Option<String>>> {
    let items = value_field(&ack)?.as_array()?;
    Some(
        items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
    )
}

pub fn map_result(ack: Value) -> Option<HashMap<String, String>> {
    let object = value_field(&ack)?.as_object()?;
    Some(
        object
            .iter()
            .filter_map(|(field, value)| value.as_str().map(|v| (field.clone(), v.to_string())))
            .collect(),
    )
}

fn string_args(values: &[&str]) -> Vec<Value> {
    values.iter().map(|v| Value::from(*v)).collect()
}

impl KeySyncClient {
    fn group(&self) -> Option<Arc<SessionGroup>> {
        self.session()
    }

    // --- strings and counters ---

    pub async fn get(&self, key: &str) -> Option<String> {
        self.group()?
            .dispatch_first_value_map("get", string_args(&[key]), string_result)
            .await
    }

    pub async fn get_int(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map("get", string_args(&[key]), int_result)
            .await
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> bool {
        let Some(group) = self.group() else {
            return false;
        };
        group
            .dispatch_map("set", vec![Value::from(key), value.into()], ok_result)
            .await
            .unwrap_or(false)
    }

    pub async fn getdel(&self, key: &str) -> Option<String> {
        self.group()?
            .dispatch_first_value_map("getdel", string_args(&[key]), string_result)
            .await
    }

    pub async fn getrange(&self, key: &str, start: i64, end: i64) -> Option<String> {
        self.group()?
            .dispatch_first_value_map(
                "getrange",
                vec![Value::from(key), Value::from(start), Value::from(end)],
                string_result,
            )
            .await
    }

    pub async fn setrange(&self, key: &str, offset: i64, value: impl Into<Value>) -> Option<i64> {
        self.group()?
            .dispatch_map(
                "setrange",
                vec![Value::from(key), Value::from(offset), value.into()],
                int_result,
            )
            .await
    }

    pub async fn append(&self, key: &str, value: impl Into<Value>) -> Option<i64> {
        self.group()?
            .dispatch_map("append", vec![Value::from(key), value.into()], int_result)
            .await
    }

    pub async fn strlen(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map("strlen", string_args(&[key]), int_result)
            .await
    }

    pub async fn incr(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_map("incr", string_args(&[key]), int_result)
            .await
    }

    pub async fn incrby(&self, key: &str, increment: i64) -> Option<i64> {
        self.group()?
            .dispatch_map(
                "incrby",
                vec![Value::from(key), Value::from(increment)],
                int_result,
            )
            .await
    }

    pub async fn incrbyfloat(&self, key: &str, increment: f64) -> Option<f64> {
        self.group()?
            .dispatch_map(
                "incrbyfloat",
                vec![Value::from(key), Value::from(increment)],
                float_result,
            )
            .await
    }

    pub async fn decr(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_map("decr", string_args(&[key]), int_result)
            .await
    }

    pub async fn decrby(&self, key: &str, decrement: i64) -> Option<i64> {
        self.group()?
            .dispatch_map(
                "decrby",
                vec![Value::from(key), Value::from(decrement)],
                int_result,
            )
            .await
    }

    // --- generic key operations ---

    pub async fn del(&self, keys: &[&str]) -> Option<i64> {
        self.group()?
            .dispatch_map("del", string_args(keys), int_result)
            .await
    }

    pub async fn exists(&self, keys: &[&str]) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map("exists", string_args(keys), int_result)
            .await
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Option<i64> {
        self.group()?
            .dispatch_map(
                "expire",
                vec![Value::from(key), Value::from(seconds)],
                int_result,
            )
            .await
    }

    pub async fn ttl(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map("ttl", string_args(&[key]), int_result)
            .await
    }

    pub async fn keys(&self, pattern: &str) -> Option<Vec<String>> {
        self.group()?
            .dispatch_first_value_map("keys", string_args(&[pattern]), string_array_result)
            .await
    }

    pub async fn copy(&self, source: &str, destination: &str, replace: bool) -> Option<i64> {
        self.group()?
            .dispatch_map(
                "copy",
                vec![
                    Value::from(source),
                    Value::from(destination),
                    Value::from(replace),
                ],
                int_result,
            )
            .await
    }

    /// Renames a key. A watch on the old name survives through the server's
    /// `renamed` notification.
    pub async fn rename(&self, key: &str, new_key: &str) -> bool {
        let Some(group) = self.group() else {
            return false;
        };
        group
            .dispatch_map("rename", string_args(&[key, new_key]), ok_result)
            .await
            .unwrap_or(false)
    }

    pub async fn touch(&self, keys: &[&str]) -> Option<i64> {
        self.group()?
            .dispatch_map("touch", string_args(keys), int_result)
            .await
    }

    // --- hashes ---

    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.group()?
            .dispatch_first_value_map("hget", string_args(&[key, field]), string_result)
            .await
    }

    pub async fn hset(&self, key: &str, field_values: &[(&str, Value)]) -> Option<i64> {
        let mut args = vec![Value::from(key)];
        for (field, value) in field_values {
            args.push(Value::from(*field));
            args.push(value.clone());
        }
        self.group()?.dispatch_map("hset", args, int_result).await
    }

    pub async fn hgetall(&self, key: &str) -> Option<HashMap<String, String>> {
        self.group()?
            .dispatch_first_value_map("hgetall", string_args(&[key]), map_result)
            .await
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> Option<i64> {
        let mut args = vec![Value::from(key)];
        args.extend(string_args(fields));
        self.group()?.dispatch_map("hdel", args, int_result).await
    }

    pub async fn hkeys(&self, key: &str) -> Option<Vec<String>> {
        self.group()?
            .dispatch_first_value_map("hkeys", string_args(&[key]), string_array_result)
            .await
    }

    pub async fn hvals(&self, key: &str) -> Option<Vec<String>> {
        self.group()?
            .dispatch_first_value_map("hvals", string_args(&[key]), string_array_result)
            .await
    }

    pub async fn hlen(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map("hlen", string_args(&[key]), int_result)
            .await
    }

    pub async fn hmget(&self, key: &str, fields: &[&str]) -> Option<Vec<Option<String>>> {
        let mut args = vec![Value::from(key)];
        args.extend(string_args(fields));
        self.group()?
            .dispatch_first_value_map("hmget", args, optional_string_array_result)
            .await
    }

    pub async fn hincrby(&self, key: &str, field: &str, increment: i64) -> Option<i64> {
        self.group()?
            .dispatch_map(
                "hincrby",
                vec![Value::from(key), Value::from(field), Value::from(increment)],
                int_result,
            )
            .await
    }

    // --- lists ---

    pub async fn lpush(&self, key: &str, elements: Vec<Value>) -> Option<i64> {
        let mut args = vec![Value::from(key)];
        args.extend(elements);
        self.group()?.dispatch_map("lpush", args, int_result).await
    }

    pub async fn rpush(&self, key: &str, elements: Vec<Value>) -> Option<i64> {
        let mut args = vec![Value::from(key)];
        args.extend(elements);
        self.group()?.dispatch_map("rpush", args, int_result).await
    }

    pub async fn lpop(&self, key: &str) -> Option<String> {
        self.group()?
            .dispatch_map("lpop", string_args(&[key]), string_result)
            .await
    }

    pub async fn rpop(&self, key: &str) -> Option<String> {
        self.group()?
            .dispatch_map("rpop", string_args(&[key]), string_result)
            .await
    }

    pub async fn llen(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map("llen", string_args(&[key]), int_result)
            .await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Option<Vec<String>> {
        self.group()?
            .dispatch_first_value_map(
                "lrange",
                vec![Value::from(key), Value::from(start), Value::from(stop)],
                string_array_result,
            )
            .await
    }

    pub async fn lindex(&self, key: &str, index: i64) -> Option<String> {
        self.group()?
            .dispatch_first_value_map(
                "lindex",
                vec![Value::from(key), Value::from(index)],
                string_result,
            )
            .await
    }

    pub async fn lset(&self, key: &str, index: i64, element: impl Into<Value>) -> bool {
        let Some(group) = self.group() else {
            return false;
        };
        group
            .dispatch_map(
                "lset",
                vec![Value::from(key), Value::from(index), element.into()],
                ok_result,
            )
            .await
            .unwrap_or(false)
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> bool {
        let Some(group) = self.group() else {
            return false;
        };
        group
            .dispatch_map(
                "ltrim",
                vec![Value::from(key), Value::from(start), Value::from(stop)],
                ok_result,
            )
            .await
            .unwrap_or(false)
    }

    // --- sets ---

    pub async fn sadd(&self, key: &str, members: Vec<Value>) -> Option<i64> {
        let mut args = vec![Value::from(key)];
        args.extend(members);
        self.group()?.dispatch_map("sadd", args, int_result).await
    }

    pub async fn srem(&self, key: &str, members: Vec<Value>) -> Option<i64> {
        let mut args = vec![Value::from(key)];
        args.extend(members);
        self.group()?.dispatch_map("srem", args, int_result).await
    }

    pub async fn smembers(&self, key: &str) -> Option<Vec<String>> {
        self.group()?
            .dispatch_first_value_map("smembers", string_args(&[key]), string_array_result)
            .await
    }

    pub async fn sismember(&self, key: &str, member: impl Into<Value>) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map(
                "sismember",
                vec![Value::from(key), member.into()],
                int_result,
            )
            .await
    }

    pub async fn scard(&self, key: &str) -> Option<i64> {
        self.group()?
            .dispatch_first_value_map("scard", string_args(&[key]), int_result)
            .await
    }

    pub async fn spop(&self, key: &str) -> Option<String> {
        self.group()?
            .dispatch_map("spop", string_args(&[key]), string_result)
            .await
    }
}
