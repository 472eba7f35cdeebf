//! Profile persistence.

use super::ProfileSource;
use crate::intel::SecurityLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Prefix of all profile storage keys.
pub const PROFILES_KEY_PREFIX: &str = "core:profiles/";

/// The `source/id` form of a profile identity.
pub fn make_scoped_id(source: ProfileSource, id: &str) -> String {
    format!("{}/{}", source, id)
}

/// The storage key of a profile.
pub fn make_profile_key(source: ProfileSource, id: &str) -> String {
    format!("{}{}", PROFILES_KEY_PREFIX, make_scoped_id(source, id))
}

/// Kind of value held in [`ProfileRecord::icon`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IconType {
    #[default]
    Path,
    Database,
    Blob,
}

/// Persisted form of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub id: String,
    pub source: ProfileSource,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub icon_type: IconType,
    #[serde(default)]
    pub linked_path: String,
    #[serde(default)]
    pub linked_profiles: Vec<String>,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Unix seconds.
    #[serde(default)]
    pub approx_last_used: i64,
    /// Unix seconds.
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub internal: bool,
}

impl ProfileRecord {
    pub fn key(&self) -> String {
        make_profile_key(self.source, &self.id)
    }
}

/// Error from the profile store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {key} is not a profile: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error("storage failure: {0}")]
    Backend(String),
}

/// Record storage keyed by `core:profiles/<source>/<id>`.
pub trait ProfileStore: Send + Sync {
    fn put(&self, record: &ProfileRecord) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<ProfileRecord>, StoreError>;
}

/// Store keeping serialized records in memory.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    records: RwLock<HashMap<String, Value>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value under `key`, bypassing the typed path.
    pub fn put_raw(&self, key: &str, value: Value) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProfileStore for MemoryProfileStore {
    fn put(&self, record: &ProfileRecord) -> Result<(), StoreError> {
        let value = serde_json::to_value(record).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.put_raw(&record.key(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<ProfileRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let Some(value) = records.get(key) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys() {
        assert_eq!(make_scoped_id(ProfileSource::Local, "abc"), "local/abc");
        assert_eq!(
            make_profile_key(ProfileSource::Special, "system"),
            "core:profiles/special/system"
        );
    }

    #[test]
    fn test_memory_store_put_get() {
        let store = MemoryProfileStore::new();
        let mut record = ProfileRecord {
            id: "abc".to_string(),
            source: ProfileSource::Local,
            name: "Firefox".to_string(),
            ..Default::default()
        };
        record
            .config
            .insert("filter".to_string(), json!({"defaultAction": "block"}));

        store.put(&record).unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.get("core:profiles/local/abc").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("core:profiles/local/missing").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_decode_error() {
        let store = MemoryProfileStore::new();
        store.put_raw("core:profiles/local/bad", json!({"id": 5}));
        assert!(matches!(
            store.get("core:profiles/local/bad"),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn test_record_json_shape() {
        let record = ProfileRecord {
            id: "abc".to_string(),
            source: ProfileSource::Community,
            linked_path: "/usr/bin/curl".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["source"], "community");
        assert_eq!(value["linkedPath"], "/usr/bin/curl");
        assert_eq!(value["iconType"], "path");
    }
}
