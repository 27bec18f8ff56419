//! Free-form plugin configuration bag.
//!
//! Every plugin is configured through a string-keyed [`Metadata`] map.
//! Accessors fail soft: a missing key or a type mismatch yields the zero
//! value of the requested type, and the caller supplies defaults
//! explicitly. Keys are case-sensitive. Unknown keys are ignored.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

/// Read-only typed view over untyped key-value configuration.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: HashMap<String, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a value; used by builders that seed plugin configuration.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> &str {
        self.entries.get(key).and_then(Value::as_str).unwrap_or("")
    }

    pub fn get_string(&self, key: &str) -> String {
        self.get_str(key).to_string()
    }

    /// Integers also accept numeric strings, matching the loose typing of
    /// URL query options.
    pub fn get_int(&self, key: &str) -> i64 {
        match self.entries.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Booleans accept `true`/`false`, `1`/`0` and their string forms.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => s == "true" || s == "1",
            _ => false,
        }
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        match self.entries.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Durations accept integer seconds or strings like `"500ms"`,
    /// `"10s"`, `"2m"`, `"1h"`. Zero on anything else.
    pub fn get_duration(&self, key: &str) -> Duration {
        match self.entries.get(key) {
            Some(Value::Number(n)) => Duration::from_secs(n.as_u64().unwrap_or(0)),
            Some(Value::String(s)) => parse_duration(s).unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.entries.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => {
                s.split(',').map(|p| p.trim().to_string()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn get_map(&self, key: &str) -> Metadata {
        match self.entries.get(key) {
            Some(Value::Object(m)) => Metadata {
                entries: m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            },
            _ => Metadata::new(),
        }
    }
}

impl From<HashMap<String, Value>> for Metadata {
    fn from(entries: HashMap<String, Value>) -> Self {
        Self { entries }
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(split);
    let num: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(num)),
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Metadata {
        let mut md = Metadata::new();
        md.set("name", "alpha");
        md.set("port", 8080);
        md.set("portStr", "9090");
        md.set("secure", true);
        md.set("flag", "1");
        md.set("timeout", "10s");
        md.set("interval", 30);
        md.set("hosts", json!(["a.example.com", "b.example.com"]));
        md.set("nested", json!({"path": "/tunnel"}));
        md
    }

    #[test]
    fn missing_keys_yield_zero_values() {
        let md = Metadata::new();
        assert_eq!(md.get_str("nope"), "");
        assert_eq!(md.get_int("nope"), 0);
        assert!(!md.get_bool("nope"));
        assert_eq!(md.get_duration("nope"), Duration::ZERO);
        assert!(md.get_str_list("nope").is_empty());
    }

    #[test]
    fn type_mismatch_yields_zero_not_error() {
        let md = sample();
        // "name" is a string; asking for an int must not panic or error
        assert_eq!(md.get_int("name"), 0);
        assert_eq!(md.get_str("port"), "");
    }

    #[test]
    fn typed_accessors() {
        let md = sample();
        assert_eq!(md.get_str("name"), "alpha");
        assert_eq!(md.get_int("port"), 8080);
        assert_eq!(md.get_int("portStr"), 9090);
        assert!(md.get_bool("secure"));
        assert!(md.get_bool("flag"));
        assert_eq!(md.get_duration("timeout"), Duration::from_secs(10));
        assert_eq!(md.get_duration("interval"), Duration::from_secs(30));
        assert_eq!(md.get_str_list("hosts").len(), 2);
        assert_eq!(md.get_map("nested").get_str("path"), "/tunnel");
    }

    #[test]
    fn keys_are_case_sensitive() {
        let md = sample();
        assert_eq!(md.get_str("Name"), "");
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("junk"), None);
    }
}
