//! Dynamic key/value configuration store.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// A single configuration value.
///
/// Per-extruder and per-filament options are vectors; everything else is a
/// scalar. Enums are stored by name as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean switch.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value (mm, %, degrees...).
    Float(f64),
    /// String or enum name.
    String(String),
    /// Per-extruder booleans.
    Bools(Vec<bool>),
    /// Per-extruder integers.
    Ints(Vec<i64>),
    /// Per-extruder floats.
    Floats(Vec<f64>),
    /// Per-extruder strings.
    Strings(Vec<String>),
}

impl ConfigValue {
    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::String(_) => "string",
            ConfigValue::Bools(_) => "bools",
            ConfigValue::Ints(_) => "ints",
            ConfigValue::Floats(_) => "floats",
            ConfigValue::Strings(_) => "strings",
        }
    }
}

impl Hash for ConfigValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_name().hash(state);
        match self {
            ConfigValue::Bool(v) => v.hash(state),
            ConfigValue::Int(v) => v.hash(state),
            ConfigValue::Float(v) => v.to_bits().hash(state),
            ConfigValue::String(v) => v.hash(state),
            ConfigValue::Bools(v) => v.hash(state),
            ConfigValue::Ints(v) => v.hash(state),
            ConfigValue::Floats(v) => {
                for f in v {
                    f.to_bits().hash(state);
                }
            }
            ConfigValue::Strings(v) => v.hash(state),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::String(v)
    }
}

impl From<Vec<i64>> for ConfigValue {
    fn from(v: Vec<i64>) -> Self {
        ConfigValue::Ints(v)
    }
}

impl From<Vec<f64>> for ConfigValue {
    fn from(v: Vec<f64>) -> Self {
        ConfigValue::Floats(v)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(v: Vec<String>) -> Self {
        ConfigValue::Strings(v)
    }
}

impl From<Vec<&str>> for ConfigValue {
    fn from(v: Vec<&str>) -> Self {
        ConfigValue::Strings(v.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<bool>> for ConfigValue {
    fn from(v: Vec<bool>) -> Self {
        ConfigValue::Bools(v)
    }
}

/// An ordered key/value configuration.
///
/// Keys are kept sorted so iteration, hashing and serialization are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicConfig {
    options: BTreeMap<String, ConfigValue>,
}

impl Hash for DynamicConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (k, v) in &self.options {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl DynamicConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Parse a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// True if no key is set.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// True if `key` is set.
    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// Raw access to a value.
    pub fn option(&self, key: &str) -> Option<&ConfigValue> {
        self.options.get(key)
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.options.insert(key.into(), value.into());
    }

    /// Remove a key; returns true if it was present.
    pub fn erase(&mut self, key: &str) -> bool {
        self.options.remove(key).is_some()
    }

    /// Iterate keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.options.keys().map(String::as_str)
    }

    /// Iterate key/value pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overwrite this config with every key of `other`.
    pub fn apply(&mut self, other: &DynamicConfig) {
        for (k, v) in &other.options {
            self.options.insert(k.clone(), v.clone());
        }
    }

    /// Overwrite this config with the listed keys of `other` that it sets.
    pub fn apply_only<'a>(&mut self, other: &DynamicConfig, keys: impl IntoIterator<Item = &'a str>) {
        for key in keys {
            if let Some(v) = other.options.get(key) {
                self.options.insert(key.to_string(), v.clone());
            }
        }
    }

    /// Keys whose values differ between `self` and `other`.
    ///
    /// A key set on only one side counts as changed.
    pub fn diff(&self, other: &DynamicConfig) -> Vec<String> {
        let mut changed: Vec<String> = self
            .options
            .iter()
            .filter(|(k, v)| other.options.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(
            other
                .options
                .keys()
                .filter(|k| !self.options.contains_key(*k))
                .cloned(),
        );
        changed.sort();
        changed
    }

    /// Subset of this config whose keys satisfy `pred`.
    pub fn filtered(&self, pred: impl Fn(&str) -> bool) -> DynamicConfig {
        DynamicConfig {
            options: self
                .options
                .iter()
                .filter(|(k, _)| pred(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Stable content hash of all keys and values.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn get(&self, key: &str) -> Result<&ConfigValue> {
        self.options
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    fn mismatch(key: &str, expected: &'static str) -> ConfigError {
        ConfigError::TypeMismatch {
            key: key.to_string(),
            expected,
        }
    }

    /// Boolean value.
    pub fn opt_bool(&self, key: &str) -> Result<bool> {
        match self.get(key)? {
            ConfigValue::Bool(v) => Ok(*v),
            ConfigValue::Bools(v) if !v.is_empty() => Ok(v[0]),
            ConfigValue::Int(v) => Ok(*v != 0),
            _ => Err(Self::mismatch(key, "bool")),
        }
    }

    /// Integer value; the first element of a vector is accepted.
    pub fn opt_int(&self, key: &str) -> Result<i64> {
        self.opt_int_at(key, 0)
    }

    /// Float value; integers are widened.
    pub fn opt_float(&self, key: &str) -> Result<f64> {
        self.opt_float_at(key, 0)
    }

    /// String value.
    pub fn opt_string(&self, key: &str) -> Result<&str> {
        self.opt_string_at(key, 0)
    }

    /// Enum value parsed from its string name.
    pub fn opt_enum<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr<Err = ConfigError>,
    {
        self.opt_string(key)?.parse()
    }

    /// Element `idx` of a per-extruder integer vector, falling back to the
    /// first element when `idx` is out of range.
    pub fn opt_int_at(&self, key: &str, idx: usize) -> Result<i64> {
        match self.get(key)? {
            ConfigValue::Int(v) => Ok(*v),
            ConfigValue::Bool(v) => Ok(i64::from(*v)),
            ConfigValue::Ints(v) if !v.is_empty() => Ok(*v.get(idx).unwrap_or(&v[0])),
            _ => Err(Self::mismatch(key, "int")),
        }
    }

    /// Element `idx` of a per-extruder float vector, falling back to the first.
    pub fn opt_float_at(&self, key: &str, idx: usize) -> Result<f64> {
        match self.get(key)? {
            ConfigValue::Float(v) => Ok(*v),
            ConfigValue::Int(v) => Ok(*v as f64),
            ConfigValue::Floats(v) if !v.is_empty() => Ok(*v.get(idx).unwrap_or(&v[0])),
            ConfigValue::Ints(v) if !v.is_empty() => Ok(*v.get(idx).unwrap_or(&v[0]) as f64),
            _ => Err(Self::mismatch(key, "float")),
        }
    }

    /// Element `idx` of a per-extruder string vector, falling back to the first.
    pub fn opt_string_at(&self, key: &str, idx: usize) -> Result<&str> {
        match self.get(key)? {
            ConfigValue::String(v) => Ok(v),
            ConfigValue::Strings(v) if !v.is_empty() => {
                Ok(v.get(idx).unwrap_or(&v[0]).as_str())
            }
            _ => Err(Self::mismatch(key, "string")),
        }
    }

    /// Integer vector; a scalar becomes a one-element vector.
    pub fn opt_ints(&self, key: &str) -> Result<Vec<i64>> {
        match self.get(key)? {
            ConfigValue::Ints(v) => Ok(v.clone()),
            ConfigValue::Int(v) => Ok(vec![*v]),
            _ => Err(Self::mismatch(key, "ints")),
        }
    }

    /// Float vector; integers are widened and scalars wrapped.
    pub fn opt_floats(&self, key: &str) -> Result<Vec<f64>> {
        match self.get(key)? {
            ConfigValue::Floats(v) => Ok(v.clone()),
            ConfigValue::Ints(v) => Ok(v.iter().map(|i| *i as f64).collect()),
            ConfigValue::Float(v) => Ok(vec![*v]),
            ConfigValue::Int(v) => Ok(vec![*v as f64]),
            _ => Err(Self::mismatch(key, "floats")),
        }
    }

    /// String vector; a scalar becomes a one-element vector.
    pub fn opt_strings(&self, key: &str) -> Result<Vec<String>> {
        match self.get(key)? {
            ConfigValue::Strings(v) => Ok(v.clone()),
            ConfigValue::String(v) => Ok(vec![v.clone()]),
            _ => Err(Self::mismatch(key, "strings")),
        }
    }

    /// Length of a vector option, 1 for scalars, 0 when missing.
    pub fn vector_len(&self, key: &str) -> usize {
        match self.options.get(key) {
            None => 0,
            Some(ConfigValue::Bools(v)) => v.len(),
            Some(ConfigValue::Ints(v)) => v.len(),
            Some(ConfigValue::Floats(v)) => v.len(),
            Some(ConfigValue::Strings(v)) => v.len(),
            Some(_) => 1,
        }
    }
}

impl FromIterator<(String, ConfigValue)> for DynamicConfig {
    fn from_iter<I: IntoIterator<Item = (String, ConfigValue)>>(iter: I) -> Self {
        Self {
            options: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> DynamicConfig {
        let mut c = DynamicConfig::new();
        c.set("layer_height", 0.2);
        c.set("wall_loops", 2i64);
        c.set("enable_support", false);
        c.set("nozzle_diameter", vec![0.4, 0.6]);
        c.set("filament_type", vec!["PLA", "PETG"]);
        c
    }

    #[test]
    fn test_typed_getters() {
        let c = sample();
        assert_relative_eq!(c.opt_float("layer_height").unwrap(), 0.2);
        assert_relative_eq!(c.opt_float("wall_loops").unwrap(), 2.0);
        assert_eq!(c.opt_int("wall_loops").unwrap(), 2);
        assert!(!c.opt_bool("enable_support").unwrap());
        assert_relative_eq!(c.opt_float_at("nozzle_diameter", 1).unwrap(), 0.6);
        // Out of range falls back to the first extruder.
        assert_relative_eq!(c.opt_float_at("nozzle_diameter", 7).unwrap(), 0.4);
        assert_eq!(c.opt_string_at("filament_type", 1).unwrap(), "PETG");
    }

    #[test]
    fn test_missing_and_mismatched_keys() {
        let c = sample();
        assert!(matches!(c.opt_float("nope"), Err(ConfigError::MissingKey(_))));
        assert!(matches!(
            c.opt_bool("filament_type"),
            Err(ConfigError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_diff_reports_changed_added_and_removed() {
        let a = sample();
        let mut b = sample();
        b.set("wall_loops", 3i64);
        b.set("ironing_type", "top");
        b.erase("enable_support");
        assert_eq!(
            a.diff(&b),
            vec!["enable_support", "ironing_type", "wall_loops"]
        );
        assert!(a.diff(&a.clone()).is_empty());
    }

    #[test]
    fn test_apply_and_hash() {
        let mut a = sample();
        let before = a.content_hash();
        let mut overrides = DynamicConfig::new();
        overrides.set("layer_height", 0.12);
        a.apply(&overrides);
        assert_relative_eq!(a.opt_float("layer_height").unwrap(), 0.12);
        assert_ne!(a.content_hash(), before);
        assert_eq!(a.content_hash(), a.clone().content_hash());
    }

    #[test]
    fn test_toml_round_trip_preserves_types() {
        let text = r#"
            layer_height = 0.16
            wall_loops = 4
            spiral_mode = true
            curr_bed_type = "cool_plate"
            nozzle_diameter = [0.4, 0.4]
            filament_type = ["PLA", "TPU"]
        "#;
        let c = DynamicConfig::from_toml_str(text).unwrap();
        assert_eq!(c.option("wall_loops"), Some(&ConfigValue::Int(4)));
        assert_eq!(c.option("spiral_mode"), Some(&ConfigValue::Bool(true)));
        assert_eq!(c.vector_len("filament_type"), 2);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        std::fs::write(&path, r#"{"sparse_infill_density": 20.0}"#).unwrap();
        let c = DynamicConfig::load(&path).unwrap();
        assert_relative_eq!(c.opt_float("sparse_infill_density").unwrap(), 20.0);
        assert!(matches!(
            DynamicConfig::load(dir.path().join("x.ini")),
            Err(ConfigError::Io(_))
        ));
    }
}
