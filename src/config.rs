use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{ErrorKind, Result, ScanariumError};

/// Two-level `section.key` configuration namespace.
///
/// The on-disk format is a JSON object of sections; values may be strings,
/// numbers or booleans and are coerced per lookup. An override file merges
/// on top with per-key precedence.
#[derive(Clone, Debug, Default)]
pub struct Config {
    sections: BTreeMap<String, BTreeMap<String, Value>>,
}

fn error_missing(section: &str, key: &str) -> ScanariumError {
    ScanariumError::with_parameters(
        ErrorKind::ConfigMissing,
        "Configuration entry \"{section}.{key}\" is missing",
        &[("section", section), ("key", key)],
    )
}

fn error_value(section: &str, key: &str, wanted: &str) -> ScanariumError {
    ScanariumError::with_parameters(
        ErrorKind::ConfigValue,
        "Configuration entry \"{section}.{key}\" is not a valid {wanted}",
        &[("section", section), ("key", key), ("wanted", wanted)],
    )
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|_| {
            ScanariumError::with_parameters(
                ErrorKind::ConfigMissing,
                "Failed to read configuration file \"{file_name}\"",
                &[("file_name", &path.display().to_string())],
            )
        })?;
        Self::parse(&raw).map_err(|e| e.with_private("file", &path.display().to_string()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|_| error_value("<root>", "<root>", "JSON object"))?;
        let mut sections = BTreeMap::new();
        let object = value
            .as_object()
            .ok_or_else(|| error_value("<root>", "<root>", "JSON object"))?;
        for (section, entries) in object {
            let entries = entries
                .as_object()
                .ok_or_else(|| error_value(section, "<section>", "JSON object"))?;
            sections.insert(
                section.clone(),
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
        }
        Ok(Config { sections })
    }

    /// Merge an override on top of this configuration. Sections of the
    /// override take precedence key by key.
    pub fn merge_override(&mut self, overrides: Config) {
        for (section, entries) in overrides.sections {
            let target = self.sections.entry(section).or_default();
            for (key, value) in entries {
                target.insert(key, value);
            }
        }
    }

    /// All keys of a section, in stable order. Unknown sections are empty.
    pub fn keys(&self, section: &str) -> Vec<String> {
        self.sections
            .get(section)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn raw(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section).and_then(|s| s.get(key))
    }

    pub fn string(&self, section: &str, key: &str) -> Result<String> {
        match self.raw(section, key) {
            None | Some(Value::Null) => Err(error_missing(section, key)),
            Some(value) => coerce_string(value).ok_or_else(|| error_value(section, key, "string")),
        }
    }

    /// A string lookup where a missing, null or empty value means "not set".
    pub fn opt_string(&self, section: &str, key: &str) -> Result<Option<String>> {
        match self.raw(section, key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                let s = coerce_string(value).ok_or_else(|| error_value(section, key, "string"))?;
                Ok(if s.is_empty() { None } else { Some(s) })
            }
        }
    }

    pub fn string_or(&self, section: &str, key: &str, default: &str) -> Result<String> {
        Ok(self.opt_string(section, key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn int(&self, section: &str, key: &str) -> Result<i64> {
        self.opt_int(section, key)?
            .ok_or_else(|| error_missing(section, key))
    }

    pub fn opt_int(&self, section: &str, key: &str) -> Result<Option<i64>> {
        match self.raw(section, key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(value) => coerce_int(value)
                .map(Some)
                .ok_or_else(|| error_value(section, key, "integer")),
        }
    }

    pub fn float(&self, section: &str, key: &str) -> Result<f64> {
        self.opt_float(section, key)?
            .ok_or_else(|| error_missing(section, key))
    }

    pub fn opt_float(&self, section: &str, key: &str) -> Result<Option<f64>> {
        match self.raw(section, key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(value) => coerce_float(value)
                .map(Some)
                .ok_or_else(|| error_value(section, key, "number")),
        }
    }

    pub fn boolean(&self, section: &str, key: &str) -> Result<bool> {
        match self.raw(section, key) {
            None | Some(Value::Null) => Err(error_missing(section, key)),
            Some(value) => {
                coerce_boolean(value).ok_or_else(|| error_value(section, key, "boolean"))
            }
        }
    }

    /// A boolean lookup where an absent key counts as `false`.
    pub fn boolean_or_false(&self, section: &str, key: &str) -> Result<bool> {
        match self.raw(section, key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::String(s)) if s.is_empty() => Ok(false),
            Some(value) => {
                coerce_boolean(value).ok_or_else(|| error_value(section, key, "boolean"))
            }
        }
    }
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}
