//! TTL-based cache reusing entities across repeated observations.

use crate::intel::Entity;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Identity of an observed remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub protocol: u8,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub domain: Option<String>,
}

/// Cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity {
    pub entity: Arc<Entity>,
    /// When this entry was cached.
    pub cached_at: Instant,
    /// TTL for this entry.
    pub ttl: Duration,
}

impl CachedEntity {
    /// Check if this cache entry has expired.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Thread-safe TTL cache for entities.
pub struct EntityCache {
    cache: RwLock<HashMap<EntityKey, CachedEntity>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl EntityCache {
    /// Create a new entity cache.
    pub fn new(default_ttl_seconds: u64, max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            default_ttl: Duration::from_secs(default_ttl_seconds),
            max_entries,
        }
    }

    /// Get a cached entity if available and not expired.
    pub fn get(&self, key: &EntityKey) -> Option<Arc<Entity>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(key)?;

        if entry.is_expired() {
            // Don't remove here to avoid write lock, cleanup will handle it
            None
        } else {
            Some(Arc::clone(&entry.entity))
        }
    }

    /// Return the cached entity for `key`, or cache the one built by `create`.
    ///
    /// Lookup and insertion happen under one write lock, so concurrent
    /// callers for the same key share one entity.
    pub fn get_or_insert_with(&self, key: EntityKey, create: impl FnOnce() -> Entity) -> Arc<Entity> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = cache.get(&key) {
            if !entry.is_expired() {
                return Arc::clone(&entry.entity);
            }
        }

        let entity = Arc::new(create());
        self.insert_entry(&mut cache, key, Arc::clone(&entity));
        entity
    }

    /// Store an entity in the cache.
    pub fn set(&self, key: EntityKey, entity: Arc<Entity>) {
        if let Ok(mut cache) = self.cache.write() {
            self.insert_entry(&mut cache, key, entity);
        }
    }

    fn insert_entry(&self, cache: &mut HashMap<EntityKey, CachedEntity>, key: EntityKey, entity: Arc<Entity>) {
        let entry = CachedEntity {
            entity,
            cached_at: Instant::now(),
            ttl: self.default_ttl,
        };

        // Evict if at capacity
        if cache.len() >= self.max_entries && !cache.contains_key(&key) {
            Self::evict_expired_entries(cache);

            // If still at capacity, remove oldest entry
            if cache.len() >= self.max_entries {
                if let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, v)| v.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest);
                }
            }
        }

        cache.insert(key, entry);
    }

    /// Remove expired entries from the cache.
    pub fn cleanup(&self) {
        if let Ok(mut cache) = self.cache.write() {
            Self::evict_expired_entries(&mut cache);
        }
    }

    fn evict_expired_entries(cache: &mut HashMap<EntityKey, CachedEntity>) {
        cache.retain(|_, v| !v.is_expired());
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }
}
