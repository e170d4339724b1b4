// src/params.rs

//! Typed access to step parameters
//!
//! Step parameters arrive as a JSON-like map (recipes are TOML, plans are
//! JSON). Actions read them through these helpers in both their preflight
//! and execute paths, so validation and execution see identical values.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameter map of one step
pub type Params = serde_json::Map<String, Value>;

pub fn get_string<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Non-empty string parameter
pub fn get_non_empty<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    get_string(params, key).filter(|s| !s.is_empty())
}

pub fn require_string<'a>(params: &'a Params, action: &str, key: &str) -> Result<&'a str> {
    get_non_empty(params, key).ok_or_else(|| Error::missing_param(action, key))
}

/// Integer parameter; TOML integers and JSON floats with no fraction both qualify
pub fn get_int(params: &Params, key: &str) -> Option<i64> {
    match params.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn get_bool(params: &Params, key: &str) -> Option<bool> {
    params.get(key).and_then(Value::as_bool)
}

/// List of strings; `None` if absent or if any element is not a string
pub fn get_string_slice(params: &Params, key: &str) -> Option<Vec<String>> {
    let items = params.get(key)?.as_array()?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

/// Table of string values; `None` if absent or any value is not a string
pub fn get_string_map(params: &Params, key: &str) -> Option<BTreeMap<String, String>> {
    let table = params.get(key)?.as_object()?;
    table
        .iter()
        .map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

/// Whether a key is present at all, regardless of type
pub fn has(params: &Params, key: &str) -> bool {
    params.contains_key(key)
}

/// Build a parameter map from key/value pairs
pub fn from_pairs<I, K>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Substitute `{name}` placeholders from `vars`; unknown placeholders are left as is
pub fn expand_vars(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

/// Look up `value` in an optional mapping table, returning it unchanged when unmapped
pub fn apply_mapping(value: &str, mapping: Option<&BTreeMap<String, String>>) -> String {
    mapping
        .and_then(|m| m.get(value))
        .cloned()
        .unwrap_or_else(|| value.to_string())
}
