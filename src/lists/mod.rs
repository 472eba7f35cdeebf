//! File-backed threat list sources.
//!
//! Each configured source is a file with one entry per line (or CSV/JSON).
//! The index answers "which lists contain this key" for every lookup
//! dimension of an entity and resolves list IDs for profiles.

pub mod loader;

use crate::config::ListSourceConfig;
use crate::intel::{LookupError, ThreatListLookup};
use async_trait::async_trait;
use loader::{load_list, ListEntries};
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Error from resolving list IDs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListResolveError {
    #[error("unknown filter list: {0}")]
    UnknownList(String),
}

/// Resolves configured filter list names to the IDs used by lookups.
pub trait ListIdResolver: Send + Sync {
    fn resolve_list_ids(&self, ids: &[String]) -> Result<Vec<String>, ListResolveError>;
}

struct ListSource {
    config: ListSourceConfig,
    entries: RwLock<ListEntries>,
    last_refresh: RwLock<Option<Instant>>,
}

impl ListSource {
    fn new(config: ListSourceConfig) -> Result<Self, LookupError> {
        let source = Self {
            config,
            entries: RwLock::new(ListEntries::default()),
            last_refresh: RwLock::new(None),
        };

        source.refresh()?;

        Ok(source)
    }

    fn refresh_if_needed(&self) -> Result<(), LookupError> {
        let should_refresh = {
            let last = self
                .last_refresh
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match *last {
                Some(instant) => {
                    instant.elapsed() > Duration::from_secs(self.config.refresh_interval_seconds)
                }
                None => true,
            }
        };

        if should_refresh {
            self.refresh()?;
        }

        Ok(())
    }

    fn refresh(&self) -> Result<(), LookupError> {
        let entries = load_list(&self.config.path, self.config.format)?;
        let count = entries.len();

        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = entries;
        *self
            .last_refresh
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        info!(list = %self.config.id, entries = count, "Filter list loaded");

        Ok(())
    }

    fn matches(&self, check: impl Fn(&ListEntries) -> bool) -> bool {
        // A failed refresh keeps the previous contents.
        if let Err(e) = self.refresh_if_needed() {
            warn!(list = %self.config.id, error = %e, "Failed to refresh filter list");
        }

        check(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Index over all enabled list sources.
pub struct FileListIndex {
    sources: Vec<ListSource>,
}

impl FileListIndex {
    /// Load every enabled source. Sources that fail to load are skipped.
    pub fn load(configs: &[ListSourceConfig]) -> Self {
        let mut sources = Vec::new();

        for config in configs {
            if !config.enabled {
                debug!(list = %config.id, "Filter list disabled");
                continue;
            }
            match ListSource::new(config.clone()) {
                Ok(source) => sources.push(source),
                Err(e) => {
                    warn!(list = %config.id, error = %e, "Failed to load filter list");
                }
            }
        }

        Self { sources }
    }

    /// IDs of all loaded sources.
    pub fn list_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.config.id.clone()).collect()
    }

    fn matching(&self, check: impl Fn(&ListEntries) -> bool) -> Vec<String> {
        self.sources
            .iter()
            .filter(|source| source.matches(&check))
            .map(|source| source.config.id.clone())
            .collect()
    }
}

#[async_trait]
impl ThreatListLookup for FileListIndex {
    async fn lookup_domain(&self, domain: &str) -> Result<Vec<String>, LookupError> {
        Ok(self.matching(|entries| entries.contains_domain(domain)))
    }

    async fn lookup_ip(&self, ip: &IpAddr) -> Result<Vec<String>, LookupError> {
        Ok(self.matching(|entries| entries.contains_ip(ip)))
    }

    async fn lookup_asn(&self, asn: &str) -> Result<Vec<String>, LookupError> {
        Ok(self.matching(|entries| entries.contains_asn(asn)))
    }

    async fn lookup_country(&self, country: &str) -> Result<Vec<String>, LookupError> {
        Ok(self.matching(|entries| entries.contains_country(country)))
    }
}

impl ListIdResolver for FileListIndex {
    fn resolve_list_ids(&self, ids: &[String]) -> Result<Vec<String>, ListResolveError> {
        ids.iter()
            .map(|id| {
                self.sources
                    .iter()
                    .find(|s| s.config.id.eq_ignore_ascii_case(id))
                    .map(|s| s.config.id.clone())
                    .ok_or_else(|| ListResolveError::UnknownList(id.clone()))
            })
            .collect()
    }
}
