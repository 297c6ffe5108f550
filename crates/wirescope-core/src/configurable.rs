//! Module configuration
//!
//! Every module carries a flat key/value configuration. Values are scalars
//! (string, number, bool) or lists of scalars; nested maps are rejected at
//! load time, so merging two configurations is a per-key replacement.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat key/value configuration with typed getters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleConfig {
    values: Map<String, Value>,
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a configuration tree node.
    ///
    /// `null` yields an empty configuration. Anything other than a map
    /// fails with `not_a_map`; a map value that is itself a map (or a list
    /// containing one) fails with `invalid value for key: <key>`.
    pub fn from_value(value: &Value, not_a_map: &str) -> CoreResult<Self> {
        let map = match value {
            Value::Null => return Ok(Self::new()),
            Value::Object(map) => map,
            _ => return Err(CoreError::InvalidConfig(not_a_map.to_string())),
        };

        let mut config = Self::new();
        for (key, value) in map {
            if !is_config_value(value) {
                return Err(CoreError::InvalidConfig(format!(
                    "invalid value for key: {}",
                    key
                )));
            }
            config.values.insert(key.clone(), value.clone());
        }
        Ok(config)
    }

    /// Typed lookup; `None` when the key is absent or does not convert
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Typed lookup that reports a present-but-unconvertible value
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|_| {
                CoreError::InvalidConfig(format!("invalid value for key: {}", key))
            }),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
    }

    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.values.insert(key.to_string(), v);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overlay `other` on top of this configuration; `other` wins per key
    pub fn merge(&mut self, other: &ModuleConfig) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Returns a new configuration of `self` overlaid with `other`
    pub fn merged(&self, other: &ModuleConfig) -> ModuleConfig {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

fn is_config_value(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(is_scalar),
        other => is_scalar(other),
    }
}

/// Serialize a configuration tree with object keys sorted at every level.
///
/// Used wherever a digest must not depend on the order keys were declared.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_getters() {
        let config = ModuleConfig::from_value(
            &json!({
                "iface": "eth0",
                "num_periods": 5,
                "promisc": true,
                "only_qname_suffix": [".google.com", "slack.com"]
            }),
            "not a map",
        )
        .unwrap();

        assert_eq!(config.get_string("iface").as_deref(), Some("eth0"));
        assert_eq!(config.get_u64("num_periods"), Some(5));
        assert_eq!(config.get_bool("promisc"), Some(true));
        assert_eq!(
            config.get_string_list("only_qname_suffix").unwrap()[0],
            ".google.com"
        );
        assert!(config.get_u64("iface").is_none());
        assert!(config.try_get::<u64>("iface").is_err());
        assert_eq!(config.try_get::<u64>("missing").unwrap(), None);
    }

    #[test]
    fn test_rejects_nested_map() {
        let err = ModuleConfig::from_value(&json!({"bpf": {"badmap": "bad value"}}), "x")
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value for key: bpf");
    }

    #[test]
    fn test_rejects_non_map() {
        let err = ModuleConfig::from_value(&json!("not_a_map"), "config is not a map")
            .unwrap_err();
        assert_eq!(err.to_string(), "config is not a map");
        assert!(ModuleConfig::from_value(&Value::Null, "x").unwrap().is_empty());
    }

    #[test]
    fn test_merge_override_wins() {
        let mut base = ModuleConfig::from_value(&json!({"iface": "eth0", "a": 1}), "x").unwrap();
        let overrides = ModuleConfig::from_value(&json!({"iface": "eth1", "b": [1, 2]}), "x").unwrap();
        base.merge(&overrides);
        assert_eq!(base.get_string("iface").as_deref(), Some("eth1"));
        assert_eq!(base.get_u64("a"), Some(1));
        assert_eq!(base.get::<Vec<u64>>("b"), Some(vec![1, 2]));
    }

    #[test]
    fn test_canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let b = json!({"a": {"x": 1, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
