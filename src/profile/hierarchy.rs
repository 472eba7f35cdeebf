//! Typed view over a nested settings mapping.
//!
//! Profiles store their settings as nested JSON objects. A setting key such
//! as `filter/endpoints` addresses `{"filter": {"endpoints": [...]}}`.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Separator between the segments of a setting key.
pub const KEY_SEPARATOR: char = '/';

/// Error from reading or writing a nested settings mapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid setting key {0:?}")]
    InvalidKey(String),

    #[error("setting {key} is not a {expected}")]
    WrongType { key: String, expected: &'static str },
}

/// Flattened, read-only snapshot of a nested settings mapping.
#[derive(Debug, Clone, Default)]
pub struct Perspective {
    values: HashMap<String, Value>,
}

impl Perspective {
    /// Flatten `config` into setting keys.
    pub fn new(config: &Map<String, Value>) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        flatten_into(&mut values, "", config)?;
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The value of a string setting. `Ok(None)` if it is not set.
    pub fn get_as_string(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(ConfigError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// The value of a string list setting. `Ok(None)` if it is not set.
    pub fn get_as_string_array(&self, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
        let wrong_type = || ConfigError::WrongType {
            key: key.to_string(),
            expected: "list of strings",
        };

        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(wrong_type))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(wrong_type()),
        }
    }
}

fn flatten_into(
    values: &mut HashMap<String, Value>,
    prefix: &str,
    config: &Map<String, Value>,
) -> Result<(), ConfigError> {
    for (segment, value) in config {
        if segment.is_empty() || segment.contains(KEY_SEPARATOR) {
            return Err(ConfigError::InvalidKey(format!("{}{}", prefix, segment)));
        }
        let key = format!("{}{}", prefix, segment);
        match value {
            Value::Object(nested) => {
                flatten_into(values, &format!("{}{}", key, KEY_SEPARATOR), nested)?
            }
            leaf => {
                values.insert(key, leaf.clone());
            }
        }
    }
    Ok(())
}

/// Write `value` at `key`, creating intermediate objects as needed.
/// Non-object values on the way are replaced.
pub fn put_value(config: &mut Map<String, Value>, key: &str, value: Value) -> Result<(), ConfigError> {
    let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ConfigError::InvalidKey(key.to_string()));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(ConfigError::InvalidKey(key.to_string()));
    };

    let mut current = config;
    for segment in parents {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return Err(ConfigError::InvalidKey(key.to_string()));
        };
        current = next;
    }

    current.insert(last.to_string(), value);
    Ok(())
}
