//! Untyped manifest values
//!
//! A parsed YAML document becomes a [`Dynamic`] tree with every map key
//! coerced to a string. Field extraction never fails: absent or oddly shaped
//! fields come back as an empty string and the caller decides whether that
//! is fatal.

use std::collections::BTreeMap;

use serde_yml::Value as Yaml;

use crate::errors::ConveyorError;

/// Dynamic value of a parsed manifest
#[derive(Debug, Clone, PartialEq)]
pub enum Dynamic {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Dynamic>),
    Map(BTreeMap<String, Dynamic>),
}

impl Dynamic {
    /// Parse one YAML document
    pub fn from_yaml_str(doc: &str) -> Result<Self, ConveyorError> {
        let value: Yaml = serde_yml::from_str(doc)?;
        Ok(Self::from(value))
    }

    /// Canonical string form of a scalar
    ///
    /// Strings are trimmed, integral floats lose their fraction, composites
    /// and null yield an empty string.
    pub fn as_string(&self) -> String {
        match self {
            Dynamic::Null => String::new(),
            Dynamic::Bool(b) => b.to_string(),
            Dynamic::Int(i) => i.to_string(),
            Dynamic::Float(f) => format_float(*f),
            Dynamic::String(s) => s.trim().to_string(),
            Dynamic::List(_) | Dynamic::Map(_) => String::new(),
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Dynamic>> {
        match self {
            Dynamic::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Dynamic]> {
        match self {
            Dynamic::List(list) => Some(list),
            _ => None,
        }
    }

    /// Scalar entries of a map, coerced to strings; anything else is empty
    pub fn as_string_map(&self) -> BTreeMap<String, String> {
        self.as_map()
            .map(|map| {
                map.iter()
                    .filter(|(_, v)| !matches!(v, Dynamic::List(_) | Dynamic::Map(_)))
                    .map(|(k, v)| (k.clone(), v.as_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Field of a map, `None` on non-maps
    pub fn get(&self, key: &str) -> Option<&Dynamic> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Field of a map coerced to a string
    pub fn field_string(&self, key: &str) -> String {
        self.get(key).map(Dynamic::as_string).unwrap_or_default()
    }

    pub fn kind(&self) -> String {
        self.field_string("kind")
    }

    /// Extract `metadata.<key>`
    ///
    /// `metadata` may be a map, a list of maps (first map holding the key
    /// wins) or a string holding an embedded YAML map.
    pub fn metadata_field(&self, key: &str) -> String {
        match self.get("metadata") {
            Some(metadata @ Dynamic::Map(_)) => metadata.field_string(key),
            Some(Dynamic::List(items)) => items
                .iter()
                .find(|item| item.get(key).is_some())
                .map(|item| item.field_string(key))
                .unwrap_or_default(),
            Some(Dynamic::String(embedded)) => Dynamic::from_yaml_str(embedded)
                .map(|parsed| parsed.field_string(key))
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// JSON form used for typed conversion
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Dynamic::Null => serde_json::Value::Null,
            Dynamic::Bool(b) => serde_json::Value::Bool(*b),
            Dynamic::Int(i) => serde_json::Value::from(*i),
            Dynamic::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Dynamic::String(s) => serde_json::Value::String(s.clone()),
            Dynamic::List(list) => {
                serde_json::Value::Array(list.iter().map(Dynamic::to_json).collect())
            }
            Dynamic::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

/// Map keys of any scalar type become their string form
fn key_string(key: &Yaml) -> String {
    Dynamic::from(key.clone()).as_string()
}

impl From<Yaml> for Dynamic {
    fn from(value: Yaml) -> Self {
        match value {
            Yaml::Null => Dynamic::Null,
            Yaml::Bool(b) => Dynamic::Bool(b),
            Yaml::Number(n) => match n.as_i64() {
                Some(i) => Dynamic::Int(i),
                None => Dynamic::Float(n.as_f64().unwrap_or_default()),
            },
            Yaml::String(s) => Dynamic::String(s),
            Yaml::Sequence(seq) => Dynamic::List(seq.into_iter().map(Dynamic::from).collect()),
            Yaml::Mapping(mapping) => Dynamic::Map(
                mapping
                    .into_iter()
                    .map(|(k, v)| (key_string(&k), Dynamic::from(v)))
                    .collect(),
            ),
            Yaml::Tagged(tagged) => {
                let tagged = *tagged;
                Dynamic::from(tagged.value)
            }
        }
    }
}
